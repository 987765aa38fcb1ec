//! Units - the atomic items a chunk processes

use serde::{Deserialize, Serialize};

use crate::parser::ParsedEntry;

/// One word of the lyrics corpus, with the line it appears in as context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordOccurrence {
    /// Natural key of the occurrence: `song:line:token`
    pub unit_key: String,
    /// Token as written
    pub surface: String,
    /// Normalized token, the key every cascade lookup uses
    pub word: String,
    /// Full lyric line
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_of_speech: Option<String>,
}

impl WordOccurrence {
    pub fn unit_key(song: &str, line: usize, token: usize) -> String {
        format!("{}:{}:{}", song, line, token)
    }
}

/// Staged unit payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Unit {
    Entry(ParsedEntry),
    Occurrence(WordOccurrence),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_payload_is_tagged() {
        let unit = Unit::Occurrence(WordOccurrence {
            unit_key: WordOccurrence::unit_key("aguas-de-marco", 3, 1),
            surface: "Pau".into(),
            word: "pau".into(),
            context: "É pau, é pedra".into(),
            part_of_speech: None,
        });
        let json = serde_json::to_value(&unit).unwrap();
        assert_eq!(json["type"], "occurrence");
        assert_eq!(json["unit_key"], "aguas-de-marco:3:1");
        assert!(json.get("part_of_speech").is_none());
    }
}
