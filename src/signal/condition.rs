// =============================================================================
// Condition language -- trigger predicates over indicator/tick fields
// =============================================================================
//
// A condition is a tree of:
//   { "type": "always" }
//   { "type": "leaf", "field": "price", "op": ">=", "value": 105.0 }
//   { "type": "all", "all": [ ... ] }
//   { "type": "any", "any": [ ... ] }
//   { "type": "not", "not": { ... } }
//   { "type": "cross_up",   "fast": "macd_value", "slow": "macd_signal" }
//   { "type": "cross_down", "fast": "ema_20",     "slow": "ema_50" }
//
// Fields are the indicator wire names plus "price" and "volume". Free-text
// conditions are rejected: a bare JSON string does not deserialize into this
// tree, and `from_json` reports it as a distinct error so signal creation can
// refuse it with a machine-readable reason.
//
// Cross predicates are true on the transition of the current sample relative
// to the immediately preceding sample of the same stream.
// =============================================================================

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::indicators::IndicatorSet;

/// Comparison operator for leaf predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
}

impl CmpOp {
    fn apply(self, left: f64, right: f64) -> bool {
        match self {
            CmpOp::Lt => left < right,
            CmpOp::Le => left <= right,
            CmpOp::Gt => left > right,
            CmpOp::Ge => left >= right,
            CmpOp::Eq => left == right,
        }
    }
}

/// One evaluation input: the fields visible at a point in time for one
/// (instrument, timeframe) stream.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub ts: i64,
    pub fields: HashMap<String, f64>,
}

impl Sample {
    pub fn new(ts: i64) -> Self {
        Self {
            ts,
            fields: HashMap::new(),
        }
    }

    pub fn with(mut self, field: &str, value: f64) -> Self {
        self.fields.insert(field.to_string(), value);
        self
    }
}

/// Validation failure for a condition tree.
#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("free-text conditions are not accepted; use the structured predicate form")]
    FreeText,
    #[error("condition is not a structured predicate: {0}")]
    Malformed(String),
    #[error("unknown field '{0}' in condition")]
    UnknownField(String),
    #[error("non-finite comparison value for field '{0}'")]
    NonFiniteValue(String),
    #[error("empty condition group")]
    EmptyGroup,
}

/// Trigger predicate tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Immediate trigger for market-style entries.
    Always,
    Leaf {
        field: String,
        op: CmpOp,
        value: f64,
    },
    All {
        all: Vec<Condition>,
    },
    Any {
        any: Vec<Condition>,
    },
    Not {
        not: Box<Condition>,
    },
    CrossUp {
        fast: String,
        slow: String,
    },
    CrossDown {
        fast: String,
        slow: String,
    },
}

impl Condition {
    /// Convenience constructor for the common price-threshold leaf.
    pub fn price(op: CmpOp, value: f64) -> Self {
        Condition::Leaf {
            field: "price".to_string(),
            op,
            value,
        }
    }

    /// Parse a condition from raw JSON, mapping a bare string to the
    /// free-text rejection.
    pub fn from_json(value: &Value) -> Result<Condition, ConditionError> {
        if value.is_string() {
            return Err(ConditionError::FreeText);
        }
        let cond: Condition = serde_json::from_value(value.clone())
            .map_err(|e| ConditionError::Malformed(e.to_string()))?;
        cond.validate()?;
        Ok(cond)
    }

    /// Check field names, comparison values, and group arities.
    pub fn validate(&self) -> Result<(), ConditionError> {
        match self {
            Condition::Always => Ok(()),
            Condition::Leaf { field, value, .. } => {
                if !is_known_field(field) {
                    return Err(ConditionError::UnknownField(field.clone()));
                }
                if !value.is_finite() {
                    return Err(ConditionError::NonFiniteValue(field.clone()));
                }
                Ok(())
            }
            Condition::All { all: children } | Condition::Any { any: children } => {
                if children.is_empty() {
                    return Err(ConditionError::EmptyGroup);
                }
                children.iter().try_for_each(Condition::validate)
            }
            Condition::Not { not } => not.validate(),
            Condition::CrossUp { fast, slow } | Condition::CrossDown { fast, slow } => {
                for field in [fast, slow] {
                    if !is_known_field(field) {
                        return Err(ConditionError::UnknownField(field.clone()));
                    }
                }
                Ok(())
            }
        }
    }

    /// Evaluate against `current`, with `previous` supplying the prior sample
    /// of the same stream for cross predicates. A referenced field missing
    /// from the sample makes the predicate false, never an error.
    pub fn eval(&self, current: &Sample, previous: Option<&Sample>) -> bool {
        match self {
            Condition::Always => true,
            Condition::Leaf { field, op, value } => current
                .fields
                .get(field)
                .is_some_and(|left| op.apply(*left, *value)),
            Condition::All { all } => all.iter().all(|c| c.eval(current, previous)),
            Condition::Any { any } => any.iter().any(|c| c.eval(current, previous)),
            Condition::Not { not } => !not.eval(current, previous),
            Condition::CrossUp { fast, slow } => {
                cross(current, previous, fast, slow, true)
            }
            Condition::CrossDown { fast, slow } => {
                cross(current, previous, fast, slow, false)
            }
        }
    }

    /// Collect every field name the tree references (used to index signals
    /// by the streams that can trigger them).
    pub fn referenced_fields(&self, out: &mut HashSet<String>) {
        match self {
            Condition::Always => {}
            Condition::Leaf { field, .. } => {
                out.insert(field.clone());
            }
            Condition::All { all: children } | Condition::Any { any: children } => {
                children.iter().for_each(|c| c.referenced_fields(out));
            }
            Condition::Not { not } => not.referenced_fields(out),
            Condition::CrossUp { fast, slow } | Condition::CrossDown { fast, slow } => {
                out.insert(fast.clone());
                out.insert(slow.clone());
            }
        }
    }
}

/// True on the fast/slow transition between the previous and current sample.
fn cross(current: &Sample, previous: Option<&Sample>, fast: &str, slow: &str, up: bool) -> bool {
    let Some(prev) = previous else { return false };
    let (Some(&pf), Some(&ps), Some(&cf), Some(&cs)) = (
        prev.fields.get(fast),
        prev.fields.get(slow),
        current.fields.get(fast),
        current.fields.get(slow),
    ) else {
        return false;
    };

    if up {
        pf <= ps && cf > cs
    } else {
        pf >= ps && cf < cs
    }
}

fn is_known_field(field: &str) -> bool {
    field == "price" || field == "volume" || IndicatorSet::NAMES.contains(&field)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shapes_roundtrip() {
        let cond = Condition::All {
            all: vec![
                Condition::price(CmpOp::Ge, 105.0),
                Condition::Not {
                    not: Box::new(Condition::Leaf {
                        field: "rsi_14".into(),
                        op: CmpOp::Gt,
                        value: 70.0,
                    }),
                },
            ],
        };
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "all");
        assert_eq!(json["all"][0]["op"], ">=");

        let back: Condition = serde_json::from_value(json).unwrap();
        assert_eq!(back, cond);
    }

    #[test]
    fn free_text_is_rejected() {
        let err = Condition::from_json(&json!("price above entry")).unwrap_err();
        assert_eq!(err, ConditionError::FreeText);
    }

    #[test]
    fn malformed_object_is_rejected() {
        let err = Condition::from_json(&json!({ "kind": "leaf" })).unwrap_err();
        assert!(matches!(err, ConditionError::Malformed(_)));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let err = Condition::from_json(&json!({
            "type": "leaf", "field": "open_interest_zscore", "op": ">", "value": 1.0
        }))
        .unwrap_err();
        assert_eq!(
            err,
            ConditionError::UnknownField("open_interest_zscore".into())
        );
    }

    #[test]
    fn empty_group_is_rejected() {
        let err = Condition::from_json(&json!({ "type": "any", "any": [] })).unwrap_err();
        assert_eq!(err, ConditionError::EmptyGroup);
    }

    #[test]
    fn leaf_ops_evaluate() {
        let sample = Sample::new(0).with("price", 105.0);
        assert!(Condition::price(CmpOp::Ge, 105.0).eval(&sample, None));
        assert!(Condition::price(CmpOp::Le, 105.0).eval(&sample, None));
        assert!(Condition::price(CmpOp::Eq, 105.0).eval(&sample, None));
        assert!(!Condition::price(CmpOp::Gt, 105.0).eval(&sample, None));
        assert!(!Condition::price(CmpOp::Lt, 105.0).eval(&sample, None));
    }

    #[test]
    fn missing_field_is_false_not_error() {
        let sample = Sample::new(0).with("volume", 10.0);
        assert!(!Condition::price(CmpOp::Ge, 1.0).eval(&sample, None));
    }

    #[test]
    fn boolean_combinators() {
        let sample = Sample::new(0).with("price", 100.0).with("rsi_14", 25.0);
        let oversold_dip = Condition::All {
            all: vec![
                Condition::price(CmpOp::Le, 100.0),
                Condition::Leaf {
                    field: "rsi_14".into(),
                    op: CmpOp::Lt,
                    value: 30.0,
                },
            ],
        };
        assert!(oversold_dip.eval(&sample, None));

        let either = Condition::Any {
            any: vec![
                Condition::price(CmpOp::Gt, 200.0),
                Condition::price(CmpOp::Lt, 200.0),
            ],
        };
        assert!(either.eval(&sample, None));

        let negated = Condition::Not {
            not: Box::new(Condition::price(CmpOp::Gt, 50.0)),
        };
        assert!(!negated.eval(&sample, None));
    }

    #[test]
    fn cross_up_fires_only_on_transition() {
        let cond = Condition::CrossUp {
            fast: "macd_value".into(),
            slow: "macd_signal".into(),
        };

        let below = Sample::new(1).with("macd_value", -0.5).with("macd_signal", 0.0);
        let above = Sample::new(2).with("macd_value", 0.4).with("macd_signal", 0.1);

        // No previous sample: cannot establish a transition.
        assert!(!cond.eval(&above, None));
        // Transition from below to above fires.
        assert!(cond.eval(&above, Some(&below)));
        // Staying above does not re-fire.
        let still_above = Sample::new(3).with("macd_value", 0.6).with("macd_signal", 0.2);
        assert!(!cond.eval(&still_above, Some(&above)));
    }

    #[test]
    fn cross_down_is_symmetric() {
        let cond = Condition::CrossDown {
            fast: "ema_20".into(),
            slow: "ema_50".into(),
        };
        let above = Sample::new(1).with("ema_20", 101.0).with("ema_50", 100.0);
        let below = Sample::new(2).with("ema_20", 99.0).with("ema_50", 100.0);
        assert!(cond.eval(&below, Some(&above)));
        assert!(!cond.eval(&above, Some(&below)));
    }

    #[test]
    fn referenced_fields_collects_the_tree() {
        let cond = Condition::All {
            all: vec![
                Condition::price(CmpOp::Ge, 1.0),
                Condition::CrossUp {
                    fast: "macd_value".into(),
                    slow: "macd_signal".into(),
                },
            ],
        };
        let mut fields = HashSet::new();
        cond.referenced_fields(&mut fields);
        assert_eq!(fields.len(), 3);
        assert!(fields.contains("price"));
        assert!(fields.contains("macd_signal"));
    }

    #[test]
    fn always_fires_without_samples() {
        assert!(Condition::Always.eval(&Sample::new(0), None));
    }
}
