//! Serialized tally blobs.
//!
//! Tallies are stored as a versioned JSON object:
//!
//! ```text
//! {"v":1,"counts":{"0":12,"86400":3}}
//! ```
//!
//! Rows written before versioning hold the bare window map
//! (`{"0":12,"86400":3}`) and decode the same way. Keys that are not a
//! window in seconds are ignored, as are negative counts; reconciling the
//! decoded windows with the configured ones is the caller's job
//! ([`TallyVector::conform`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{TallyVector, TimeWindow};

/// Current blob version.
pub const TALLY_BLOB_VERSION: u32 = 1;

#[derive(Serialize)]
struct BlobOut {
    v: u32,
    counts: BTreeMap<u64, u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BlobIn {
    Versioned {
        v: u32,
        counts: BTreeMap<String, serde_json::Value>,
    },
    Legacy(BTreeMap<String, serde_json::Value>),
}

/// Encode a tally vector as a versioned blob.
///
/// # Errors
///
/// Returns an error only if JSON serialization fails.
pub fn encode_tally(vector: &TallyVector) -> Result<String, serde_json::Error> {
    let blob = BlobOut {
        v: TALLY_BLOB_VERSION,
        counts: vector.iter().map(|(w, c)| (w.secs(), c)).collect(),
    };
    serde_json::to_string(&blob)
}

/// Decode a stored blob in either the versioned or legacy layout.
///
/// # Errors
///
/// Returns an error if the text is not a JSON object of either layout.
pub fn decode_tally(raw: &str) -> Result<TallyVector, serde_json::Error> {
    let counts = match serde_json::from_str::<BlobIn>(raw)? {
        BlobIn::Versioned { v, counts } => {
            if v > TALLY_BLOB_VERSION {
                tracing::warn!(version = v, "tally blob from a newer writer; reading known fields");
            }
            counts
        }
        BlobIn::Legacy(counts) => counts,
    };

    Ok(TallyVector::from_counts(counts.into_iter().filter_map(
        |(key, value)| {
            let window = key.parse::<TimeWindow>().ok()?;
            let count = value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))?;
            Some((window, count))
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_versioned_layout_in_window_order() {
        let vector = TallyVector::from_counts([
            (TimeWindow::ALL_TIME, 12),
            (TimeWindow::DAY, 3),
            (TimeWindow::WEEK, 5),
        ]);
        let raw = encode_tally(&vector).unwrap();
        assert_eq!(raw, r#"{"v":1,"counts":{"0":12,"86400":3,"604800":5}}"#);
        assert_eq!(decode_tally(&raw).unwrap(), vector);
    }

    #[test]
    fn decodes_legacy_layout_with_string_counts() {
        let vector = decode_tally(r#"{"86400":"4","604800":9}"#).unwrap();
        assert_eq!(vector.count(TimeWindow::DAY), 4);
        assert_eq!(vector.count(TimeWindow::WEEK), 9);
    }

    #[test]
    fn ignores_unknown_keys_and_bad_counts() {
        let vector = decode_tally(r#"{"v":1,"counts":{"daily":5,"86400":-1,"0":2}}"#).unwrap();
        assert_eq!(vector.iter().count(), 1);
        assert_eq!(vector.count(TimeWindow::ALL_TIME), 2);
    }

    #[test]
    fn rejects_non_objects() {
        assert!(decode_tally("[1,2,3]").is_err());
        assert!(decode_tally("not json").is_err());
    }
}
