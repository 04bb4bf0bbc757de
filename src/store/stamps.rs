//! Text codec for the `stamps` column: an ascending, deduplicated,
//! comma-joined set of small non-negative integers (`"1,2,3"`, or empty).

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid stamp token {token:?}")]
pub struct StampsDecodeError {
    pub token: String,
}

/// Encode a stamp set. `BTreeSet` iteration gives the ascending order the
/// column format requires.
pub fn encode(stamps: &BTreeSet<u32>) -> String {
    stamps
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode the persisted text form. Empty or blank input is the empty set.
pub fn decode(raw: &str) -> Result<BTreeSet<u32>, StampsDecodeError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(BTreeSet::new());
    }
    raw.split(',')
        .map(|token| {
            let token = token.trim();
            token.parse::<u32>().map_err(|_| StampsDecodeError {
                token: token.to_string(),
            })
        })
        .collect()
}

/// Decode, recovering malformed history to the empty set with a warning
/// instead of surfacing an error to the caller.
pub fn decode_or_empty(name: &str, raw: &str) -> BTreeSet<u32> {
    match decode(raw) {
        Ok(set) => set,
        Err(e) => {
            warn!(user = %name, error = %e, "malformed stamps value, reading as empty set");
            BTreeSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[u32]) -> BTreeSet<u32> {
        values.iter().copied().collect()
    }

    #[test]
    fn encodes_ascending_regardless_of_input_order() {
        assert_eq!(encode(&set(&[3, 1, 2])), "1,2,3");
    }

    #[test]
    fn empty_set_encodes_to_empty_string() {
        assert_eq!(encode(&BTreeSet::new()), "");
    }

    #[test]
    fn decode_reverses_encode() {
        let original = set(&[7, 0, 42]);
        assert_eq!(decode(&encode(&original)).unwrap(), original);
    }

    #[test]
    fn encoding_is_stable_across_round_trips() {
        let encoded = encode(&set(&[5, 5, 9, 1]));
        let again = encode(&decode(&encoded).unwrap());
        assert_eq!(encoded, again);
    }

    #[test]
    fn blank_input_decodes_to_empty_set() {
        assert_eq!(decode("").unwrap(), BTreeSet::new());
        assert_eq!(decode("   ").unwrap(), BTreeSet::new());
    }

    #[test]
    fn non_numeric_token_is_an_explicit_error() {
        let err = decode("1,x,3").unwrap_err();
        assert_eq!(err.token, "x");
    }

    #[test]
    fn negative_token_is_rejected() {
        assert!(decode("-1").is_err());
    }

    #[test]
    fn decode_or_empty_recovers_malformed_history() {
        assert_eq!(decode_or_empty("cc", "1,x,3"), BTreeSet::new());
        assert_eq!(decode_or_empty("cc", "4,5"), set(&[4, 5]));
    }
}
