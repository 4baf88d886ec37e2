//! Segment schema payloads and their content fingerprints.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{AggregatorFactory, TIME_COLUMN};

/// Logical type of a segment column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Long,
    Double,
    String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnSignature {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

/// Column names and types of a segment plus the aggregators its metrics were rolled up with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaPayload {
    pub row_signature: Vec<ColumnSignature>,
    #[serde(default)]
    pub aggregator_factories: BTreeMap<String, AggregatorFactory>,
}

impl SchemaPayload {
    /// Builds the payload of a segment with the given dimensions and metrics.
    ///
    /// The signature lists the time column first, then dimensions (strings) in order, then metrics.
    pub fn for_columns(dimensions: &[String], metrics: &[AggregatorFactory]) -> Self {
        let mut row_signature = Vec::with_capacity(1 + dimensions.len() + metrics.len());
        row_signature.push(ColumnSignature {
            name: TIME_COLUMN.to_string(),
            column_type: ColumnType::Long,
        });
        row_signature.extend(dimensions.iter().map(|name| ColumnSignature {
            name: name.clone(),
            column_type: ColumnType::String,
        }));
        row_signature.extend(metrics.iter().map(|factory| ColumnSignature {
            name: factory.name().to_string(),
            column_type: factory.column_type(),
        }));

        let aggregator_factories = metrics
            .iter()
            .map(|factory| (factory.name().to_string(), factory.clone()))
            .collect();

        Self {
            row_signature,
            aggregator_factories,
        }
    }

    /// SHA-256 over the canonical JSON encoding of the payload.
    ///
    /// Equal payloads always share a fingerprint, so a schema is stored once however many segments
    /// reference it.
    pub fn fingerprint(&self) -> Result<SchemaFingerprint, serde_json::Error> {
        let encoded = serde_json::to_vec(self)?;
        let digest = Sha256::digest(&encoded);
        Ok(SchemaFingerprint(hex::encode(digest)))
    }
}

/// A schema payload together with the row count of the segment it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaPayloadPlus {
    pub schema_payload: SchemaPayload,
    pub num_rows: u64,
}

impl SchemaPayloadPlus {
    pub fn new(schema_payload: SchemaPayload, num_rows: u64) -> Self {
        Self {
            schema_payload,
            num_rows,
        }
    }
}

/// Hex-encoded content hash of a [`SchemaPayload`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaFingerprint(String);

impl SchemaFingerprint {
    /// Wraps a fingerprint previously produced by [`SchemaPayload::fingerprint`].
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(dimensions: &[&str]) -> SchemaPayload {
        let dimensions: Vec<String> = dimensions.iter().map(|d| d.to_string()).collect();
        SchemaPayload::for_columns(
            &dimensions,
            &[AggregatorFactory::Count {
                name: "count".into(),
            }],
        )
    }

    #[test]
    fn row_signature_lists_time_dimensions_then_metrics() {
        let payload = payload(&["page", "user"]);
        let columns: Vec<(&str, ColumnType)> = payload
            .row_signature
            .iter()
            .map(|c| (c.name.as_str(), c.column_type))
            .collect();

        assert_eq!(
            columns,
            vec![
                ("__time", ColumnType::Long),
                ("page", ColumnType::String),
                ("user", ColumnType::String),
                ("count", ColumnType::Long),
            ]
        );
    }

    #[test]
    fn fingerprint_depends_only_on_content() {
        let first = payload(&["page"]).fingerprint().expect("Failed to fingerprint");
        let second = payload(&["page"]).fingerprint().expect("Failed to fingerprint");
        let other = payload(&["user"]).fingerprint().expect("Failed to fingerprint");

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(first.as_str().len(), 64);
    }
}
