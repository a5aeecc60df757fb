//! Coarse reports from the companion data store and their provenance form.

use serde::{Deserialize, Serialize};

/// One observation of a coarse, cumulative report.
///
/// `count` is the origin's running total for `(origin_id, record_id)` at the
/// time of observation, not a delta. The same record may be observed again
/// later with a larger count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalRecord {
    /// Writer of the report (companion app or device).
    pub origin_id: String,
    /// Stable identity of the record within its origin.
    pub record_id: String,
    /// Start of the reported interval, epoch seconds.
    pub start_time: u64,
    /// End of the reported interval, epoch seconds.
    pub end_time: u64,
    /// Cumulative step count for this record.
    pub count: u64,
}

impl ExternalRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(
        origin_id: impl Into<String>,
        record_id: impl Into<String>,
        start_time: u64,
        end_time: u64,
        count: u64,
    ) -> Self {
        Self {
            origin_id: origin_id.into(),
            record_id: record_id.into(),
            start_time,
            end_time,
            count,
        }
    }
}

/// Diagnostic trace of a coarse report that contributed to a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    /// Start of the contributing report.
    pub start_time: u64,
    /// End of the contributing report.
    pub end_time: u64,
    /// Count reported at the time of the fill.
    pub count: u64,
    /// Origin that wrote the report.
    pub origin_id: String,
}

impl From<&ExternalRecord> for ProvenanceEntry {
    fn from(record: &ExternalRecord) -> Self {
        Self {
            start_time: record.start_time,
            end_time: record.end_time,
            count: record.count,
            origin_id: record.origin_id.clone(),
        }
    }
}

/// Serializes provenance entries for storage alongside a bucket.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode_provenance(entries: &[ProvenanceEntry]) -> Result<String, serde_json::Error> {
    serde_json::to_string(entries)
}

/// Parses stored provenance.
///
/// # Errors
///
/// Returns an error if `raw` is not a JSON array of provenance entries.
pub fn decode_provenance(raw: &str) -> Result<Vec<ProvenanceEntry>, serde_json::Error> {
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provenance_json_shape() {
        let record = ExternalRecord::new("com.example.watch", "r1", 60, 120, 42);
        let encoded = encode_provenance(&[ProvenanceEntry::from(&record)]).unwrap();
        assert_eq!(
            encoded,
            r#"[{"start_time":60,"end_time":120,"count":42,"origin_id":"com.example.watch"}]"#
        );
        let decoded = decode_provenance(&encoded).unwrap();
        assert_eq!(decoded[0].count, 42);
    }
}
