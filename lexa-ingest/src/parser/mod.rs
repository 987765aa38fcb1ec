//! Block parsing of dictionary and lyrics sources

pub mod block;
pub mod formats;

pub use block::{BlockParser, ParseStats, ParsedEntry, DEFAULT_MIN_FRAGMENT_LEN, PARSER_VERSION};
pub use formats::{EntryFormat, HeadwordFormat, SongHeaderFormat};
