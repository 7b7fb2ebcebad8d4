//! Wire-level types shared by the server, the smart client and the
//! replication engine.

use serde::{Deserialize, Serialize};

/// A chunk is a piece of the category log that contains the messages written
/// to it. It can be incomplete, which means that it is currently being
/// written into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub name: String,
    pub complete: bool,
    pub size: u64,
}

/// Width of the zero-padded chunk index so that lexicographic ordering of
/// chunk names equals numeric ordering.
const CHUNK_IDX_WIDTH: usize = 9;

/// Format the on-disk file name of a chunk owned by `instance`.
pub fn chunk_file_name(instance: &str, idx: u64) -> String {
    format!("{instance}-chunk{idx:0width$}", width = CHUNK_IDX_WIDTH)
}

/// Parse a chunk file name into the owner instance and the chunk index.
///
/// Returns `None` for names that do not follow the `<instance>-chunk<idx>`
/// convention so that callers can skip them.
pub fn parse_chunk_file_name(name: &str) -> Option<(&str, u64)> {
    let pos = name.rfind("-chunk")?;
    let idx = name[pos + "-chunk".len()..].parse().ok()?;
    Some((&name[..pos], idx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_file_name_round_trip() {
        let name = chunk_file_name("moscow", 42);
        assert_eq!(name, "moscow-chunk000000042");
        assert_eq!(parse_chunk_file_name(&name), Some(("moscow", 42)));
    }

    #[test]
    fn test_parse_unpadded_index() {
        assert_eq!(parse_chunk_file_name("hc-chunk10"), Some(("hc", 10)));
    }

    #[test]
    fn test_parse_instance_with_dash() {
        assert_eq!(
            parse_chunk_file_name("hc-eu-1-chunk000000007"),
            Some(("hc-eu-1", 7))
        );
    }

    #[test]
    fn test_parse_malformed_names() {
        assert_eq!(parse_chunk_file_name("write_test"), None);
        assert_eq!(parse_chunk_file_name("hc-chunk"), None);
        assert_eq!(parse_chunk_file_name("hc-chunkXYZ"), None);
    }

    #[test]
    fn test_lexicographic_order_matches_numeric() {
        let a = chunk_file_name("hc", 9);
        let b = chunk_file_name("hc", 10);
        assert!(a < b);
    }

    #[test]
    fn test_chunk_json_shape() {
        let chunk = Chunk {
            name: "hc-chunk000000000".into(),
            complete: true,
            size: 123,
        };
        let encoded = serde_json::to_string(&chunk).unwrap();
        assert_eq!(
            encoded,
            r#"{"name":"hc-chunk000000000","complete":true,"size":123}"#
        );
    }
}
