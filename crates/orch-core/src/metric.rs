//! Metric value objects: a comparable scalar-or-structured result plus a
//! `maximize` direction, and a sentinel that always loses comparisons.

use serde::{Deserialize, Serialize};

/// Either a single number or an opaque structured record (e.g. the
/// `{metric_names: [...]}` shape produced by multi-dataset metric parsing).
/// Structured values are round-tripped losslessly; only scalars participate
/// directly in numeric comparisons.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Structured(serde_json::Value),
}

impl MetricValue {
    /// Best-effort scalar extraction, used only for `use_val_metric_only`
    /// best-node comparisons. Structured values average any numeric
    /// `final_value` fields found under `metric_names[].data[]`; this is a
    /// deliberately loose heuristic since the wire format is not a fixed
    /// schema (see the open question in the design notes).
    pub fn scalar_key(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            MetricValue::Structured(v) => {
                let mut total = 0.0;
                let mut count = 0usize;
                if let Some(names) = v.get("metric_names").and_then(|m| m.as_array()) {
                    for entry in names {
                        if let Some(data) = entry.get("data").and_then(|d| d.as_array()) {
                            for point in data {
                                if let Some(n) = point.get("final_value").and_then(|n| n.as_f64())
                                {
                                    total += n;
                                    count += 1;
                                }
                            }
                        }
                    }
                }
                if count > 0 {
                    Some(total / count as f64)
                } else {
                    None
                }
            }
        }
    }
}

/// A single node's metric: either a real value with a direction, or the
/// worst-possible sentinel assigned when evaluation failed outright.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Metric {
    Worst,
    Value {
        value: MetricValue,
        maximize: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl Metric {
    pub fn worst() -> Self {
        Metric::Worst
    }

    pub fn scalar(value: f64, maximize: bool) -> Self {
        Metric::Value {
            value: MetricValue::Scalar(value),
            maximize,
            name: None,
            description: None,
        }
    }

    pub fn structured(value: serde_json::Value, maximize: bool) -> Self {
        Metric::Value {
            value: MetricValue::Structured(value),
            maximize,
            name: None,
            description: None,
        }
    }

    pub fn is_worst(&self) -> bool {
        matches!(self, Metric::Worst)
    }

    /// A metric-only comparison key: `None` sorts below every real value,
    /// direction-adjusted so that a larger key is always "better".
    pub fn comparison_key(&self) -> Option<f64> {
        match self {
            Metric::Worst => None,
            Metric::Value {
                value, maximize, ..
            } => value
                .scalar_key()
                .map(|v| if *maximize { v } else { -v }),
        }
    }

    /// True if `self` is strictly better than `other` under their own
    /// (independent) maximize directions. A missing scalar key compares as
    /// worst regardless of direction, matching the sentinel's behavior.
    pub fn better_than(&self, other: &Metric) -> bool {
        match (self.comparison_key(), other.comparison_key()) {
            (Some(a), Some(b)) => a > b,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

impl From<MetricValue> for Metric {
    fn from(value: MetricValue) -> Self {
        Metric::Value {
            value,
            maximize: true,
            name: None,
            description: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_loses_to_any_real_metric_both_directions() {
        let worst = Metric::worst();
        let maximize_real = Metric::scalar(0.0001, true);
        let minimize_real = Metric::scalar(1_000_000.0, false);
        assert!(maximize_real.better_than(&worst));
        assert!(minimize_real.better_than(&worst));
        assert!(!worst.better_than(&maximize_real));
        assert!(!worst.better_than(&minimize_real));
    }

    #[test]
    fn maximize_true_prefers_larger_value() {
        let low = Metric::scalar(1.0, true);
        let high = Metric::scalar(2.0, true);
        assert!(high.better_than(&low));
        assert!(!low.better_than(&high));
    }

    #[test]
    fn maximize_false_prefers_smaller_value() {
        let low = Metric::scalar(1.0, false);
        let high = Metric::scalar(2.0, false);
        assert!(low.better_than(&high));
        assert!(!high.better_than(&low));
    }

    #[test]
    fn worst_vs_worst_neither_better() {
        let a = Metric::worst();
        let b = Metric::worst();
        assert!(!a.better_than(&b));
        assert!(!b.better_than(&a));
    }

    #[test]
    fn structured_scalar_key_averages_final_values() {
        let v = serde_json::json!({
            "metric_names": [
                {"metric_name": "acc", "data": [
                    {"dataset_name": "a", "final_value": 1.0, "best_value": 1.0},
                    {"dataset_name": "b", "final_value": 3.0, "best_value": 3.0}
                ]}
            ]
        });
        let m = MetricValue::Structured(v);
        assert_eq!(m.scalar_key(), Some(2.0));
    }
}
