use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EtlError;

/// Durable paging position for a single extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagingCheckpoint {
    /// Next `$skip` to request on resume.
    pub skip: i64,
    pub page_index: u64,
    pub total_records: i64,
    pub saved_at: DateTime<Utc>,
}

/// One entry of the bounded per-parameter failure list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedParameter {
    pub value: String,
    pub endpoint: String,
    pub error: String,
}

/// Durable position inside a parameterized job's value loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterCheckpoint {
    /// Index into the deterministically ordered parameter list at which to
    /// resume.
    pub parameter_index: usize,
    pub total_records: i64,
    #[serde(default)]
    pub failed_parameters: Vec<FailedParameter>,
    /// Paging position when the run stopped mid-parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<PagingCheckpoint>,
    pub saved_at: DateTime<Utc>,
}

/// Checkpoint persisted inside a run's context under the `checkpoint` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Checkpoint {
    Paging(PagingCheckpoint),
    Parameter(ParameterCheckpoint),
}

impl Checkpoint {
    pub fn total_records(&self) -> i64 {
        match self {
            Checkpoint::Paging(p) => p.total_records,
            Checkpoint::Parameter(p) => p.total_records,
        }
    }

    pub fn to_value(&self) -> Result<Value, EtlError> {
        serde_json::to_value(self).map_err(|e| EtlError::ConfigInvalid(e.to_string()))
    }

    /// Decode a stored checkpoint; malformed state surfaces as
    /// `CheckpointCorrupt` rather than being silently discarded.
    pub fn from_value(run_id: i64, value: Value) -> Result<Checkpoint, EtlError> {
        serde_json::from_value(value).map_err(|e| EtlError::CheckpointCorrupt {
            run_id,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn paging_checkpoint_round_trips() {
        let checkpoint = Checkpoint::Paging(PagingCheckpoint {
            skip: 3000,
            page_index: 3,
            total_records: 2981,
            saved_at: Utc::now(),
        });

        let value = checkpoint.to_value().unwrap();
        assert_eq!(value["kind"], "paging");

        let decoded = Checkpoint::from_value(1, value).unwrap();
        assert_eq!(decoded, checkpoint);
    }

    #[test]
    fn parameter_checkpoint_nests_a_paging_position() {
        let checkpoint = Checkpoint::Parameter(ParameterCheckpoint {
            parameter_index: 41,
            total_records: 1200,
            failed_parameters: vec![FailedParameter {
                value: "101".to_string(),
                endpoint: "/patients/101/allergies/odata".to_string(),
                error: "upstream server error (status 500)".to_string(),
            }],
            page: Some(PagingCheckpoint {
                skip: 200,
                page_index: 2,
                total_records: 180,
                saved_at: Utc::now(),
            }),
            saved_at: Utc::now(),
        });

        let decoded = Checkpoint::from_value(9, checkpoint.to_value().unwrap()).unwrap();
        assert_eq!(decoded, checkpoint);
        assert_eq!(decoded.total_records(), 1200);
    }

    #[test]
    fn corrupt_checkpoint_is_reported_not_swallowed() {
        let err = Checkpoint::from_value(7, json!({"kind": "paging", "skip": "not-a-number"}))
            .unwrap_err();

        assert!(matches!(err, EtlError::CheckpointCorrupt { run_id: 7, .. }));
    }

    #[test]
    fn missing_failure_list_defaults_to_empty() {
        let decoded = Checkpoint::from_value(
            3,
            json!({
                "kind": "parameter",
                "parameter_index": 5,
                "total_records": 12,
                "saved_at": "2025-06-01T00:00:00Z"
            }),
        )
        .unwrap();

        let Checkpoint::Parameter(p) = decoded else {
            panic!("expected parameter checkpoint");
        };
        assert!(p.failed_parameters.is_empty());
        assert!(p.page.is_none());
    }
}
