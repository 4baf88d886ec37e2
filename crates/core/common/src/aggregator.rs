//! Rollup aggregators.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ColumnType;

/// Definition of a metric column computed while rolling up rows.
///
/// Serialized with a `type` tag, e.g. `{"type": "longSum", "name": "added", "fieldName": "added"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AggregatorFactory {
    /// Number of input rows folded into the output row.
    Count { name: String },
    #[serde(rename_all = "camelCase")]
    LongSum { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    DoubleSum { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    LongMin { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    LongMax { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    DoubleMin { name: String, field_name: String },
    #[serde(rename_all = "camelCase")]
    DoubleMax { name: String, field_name: String },
}

impl AggregatorFactory {
    /// Output column name.
    pub fn name(&self) -> &str {
        match self {
            AggregatorFactory::Count { name }
            | AggregatorFactory::LongSum { name, .. }
            | AggregatorFactory::DoubleSum { name, .. }
            | AggregatorFactory::LongMin { name, .. }
            | AggregatorFactory::LongMax { name, .. }
            | AggregatorFactory::DoubleMin { name, .. }
            | AggregatorFactory::DoubleMax { name, .. } => name,
        }
    }

    /// Input field read by the aggregator, if any.
    pub fn field_name(&self) -> Option<&str> {
        match self {
            AggregatorFactory::Count { .. } => None,
            AggregatorFactory::LongSum { field_name, .. }
            | AggregatorFactory::DoubleSum { field_name, .. }
            | AggregatorFactory::LongMin { field_name, .. }
            | AggregatorFactory::LongMax { field_name, .. }
            | AggregatorFactory::DoubleMin { field_name, .. }
            | AggregatorFactory::DoubleMax { field_name, .. } => Some(field_name),
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            AggregatorFactory::Count { .. }
            | AggregatorFactory::LongSum { .. }
            | AggregatorFactory::LongMin { .. }
            | AggregatorFactory::LongMax { .. } => ColumnType::Long,
            AggregatorFactory::DoubleSum { .. }
            | AggregatorFactory::DoubleMin { .. }
            | AggregatorFactory::DoubleMax { .. } => ColumnType::Double,
        }
    }

    /// The value of an aggregate before any row was folded in.
    pub fn init(&self) -> AggregateValue {
        match self {
            AggregatorFactory::Count { .. } | AggregatorFactory::LongSum { .. } => {
                AggregateValue::Long(0)
            }
            AggregatorFactory::LongMin { .. } => AggregateValue::Long(i64::MAX),
            AggregatorFactory::LongMax { .. } => AggregateValue::Long(i64::MIN),
            AggregatorFactory::DoubleSum { .. } => AggregateValue::Double(0.0),
            AggregatorFactory::DoubleMin { .. } => AggregateValue::Double(f64::INFINITY),
            AggregatorFactory::DoubleMax { .. } => AggregateValue::Double(f64::NEG_INFINITY),
        }
    }

    /// Folds one input event into `acc`.
    ///
    /// Missing, null or non-numeric fields leave the aggregate unchanged. Long aggregates wrap on
    /// overflow.
    pub fn aggregate(&self, acc: &mut AggregateValue, event: &Map<String, Value>) {
        let field = self.field_name().and_then(|field| event.get(field));
        match (self, acc) {
            (AggregatorFactory::Count { .. }, AggregateValue::Long(acc)) => {
                *acc = acc.wrapping_add(1);
            }
            (AggregatorFactory::LongSum { .. }, AggregateValue::Long(acc)) => {
                if let Some(value) = field.and_then(long_value) {
                    *acc = acc.wrapping_add(value);
                }
            }
            (AggregatorFactory::LongMin { .. }, AggregateValue::Long(acc)) => {
                if let Some(value) = field.and_then(long_value) {
                    *acc = (*acc).min(value);
                }
            }
            (AggregatorFactory::LongMax { .. }, AggregateValue::Long(acc)) => {
                if let Some(value) = field.and_then(long_value) {
                    *acc = (*acc).max(value);
                }
            }
            (AggregatorFactory::DoubleSum { .. }, AggregateValue::Double(acc)) => {
                if let Some(value) = field.and_then(double_value) {
                    *acc += value;
                }
            }
            (AggregatorFactory::DoubleMin { .. }, AggregateValue::Double(acc)) => {
                if let Some(value) = field.and_then(double_value) {
                    *acc = acc.min(value);
                }
            }
            (AggregatorFactory::DoubleMax { .. }, AggregateValue::Double(acc)) => {
                if let Some(value) = field.and_then(double_value) {
                    *acc = acc.max(value);
                }
            }
            // An accumulator always comes from `init` of the same factory
            _ => {}
        }
    }
}

/// Current value of one metric of a rolled-up row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggregateValue {
    Long(i64),
    Double(f64),
}

impl AggregateValue {
    pub fn as_i64(self) -> i64 {
        match self {
            AggregateValue::Long(v) => v,
            AggregateValue::Double(v) => v as i64,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            AggregateValue::Long(v) => v as f64,
            AggregateValue::Double(v) => v,
        }
    }
}

fn long_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64)),
        _ => None,
    }
}

fn double_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
