//! Entry formats recognized by the block parser
//!
//! A format answers two questions about its source: does this line open a
//! new entry (and under which headword), and what optional structure can be
//! pulled out of a finished body. Everything else is the state machine's job.

use std::sync::LazyLock;

use regex::Regex;

/// Headword marker: `*alpha*,` or `*beija-flor*` at the start of a line
static RE_HEADWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*([^*]+)\*\s*,?").expect("static headword pattern"));

/// Domain label: `[fauna]` anywhere in the body
static RE_BRACKET_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]\[]{2,40})\]").expect("static label pattern"));

/// Abbreviated domain label at a word boundary: `Bot.`, `Zool.`
static RE_ABBREV_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s|\()(Bot|Zool|Mús|Culin|Anat|Relig|Mar|Gír)\.").expect("static abbreviation pattern")
});

/// Cross-reference: `V. *word*`, `Cf. word`, `Sin. word`
static RE_CROSS_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:V|Cf|Sin)\.\s+\*?([\p{L}][\p{L}'’-]*)\*?").expect("static cross-reference pattern")
});

/// Format-specific structure of a text source
pub trait EntryFormat: Send + Sync {
    /// Short identifier recorded in job metadata
    fn name(&self) -> &'static str;

    /// Headword if `line` opens a new entry
    ///
    /// `line` is already trimmed and non-empty. Must only look at the
    /// structural marker, never at whether a body follows.
    fn opens_entry(&self, line: &str) -> Option<String>;

    /// Best-effort category of a finished entry body
    fn extract_category(&self, _body: &str) -> Option<String> {
        None
    }

    /// Best-effort cross-referenced headwords of a finished entry body
    fn extract_cross_refs(&self, _body: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Dictionary format with `*headword*,` markers
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadwordFormat;

impl HeadwordFormat {
    fn abbreviation_category(abbrev: &str) -> &'static str {
        match abbrev {
            "Bot" => "flora",
            "Zool" => "fauna",
            "Mús" => "musica",
            "Culin" => "culinaria",
            "Anat" => "corpo",
            "Relig" => "religiao",
            "Mar" => "mar",
            _ => "giria",
        }
    }
}

impl EntryFormat for HeadwordFormat {
    fn name(&self) -> &'static str {
        "headword"
    }

    fn opens_entry(&self, line: &str) -> Option<String> {
        let caps = RE_HEADWORD.captures(line)?;
        let headword = caps.get(1)?.as_str().trim();
        if headword.is_empty() {
            None
        } else {
            Some(headword.to_string())
        }
    }

    fn extract_category(&self, body: &str) -> Option<String> {
        if let Some(caps) = RE_BRACKET_LABEL.captures(body) {
            let label = lexa_common::text::normalize_key(&caps[1]);
            if !label.is_empty() {
                return Some(label);
            }
        }
        RE_ABBREV_LABEL
            .captures(body)
            .map(|caps| Self::abbreviation_category(&caps[1]).to_string())
    }

    fn extract_cross_refs(&self, body: &str) -> Vec<String> {
        let mut refs: Vec<String> = Vec::new();
        for caps in RE_CROSS_REF.captures_iter(body) {
            let target = lexa_common::text::normalize_key(&caps[1]);
            if !target.is_empty() && !refs.contains(&target) {
                refs.push(target);
            }
        }
        refs
    }
}

/// Lyrics corpus: each song opens with a `# Title` line
#[derive(Debug, Default, Clone, Copy)]
pub struct SongHeaderFormat;

impl EntryFormat for SongHeaderFormat {
    fn name(&self) -> &'static str {
        "song-header"
    }

    fn opens_entry(&self, line: &str) -> Option<String> {
        let title = line.strip_prefix("# ")?.trim();
        if title.is_empty() {
            None
        } else {
            Some(title.to_string())
        }
    }
}
