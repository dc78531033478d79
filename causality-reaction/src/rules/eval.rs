use regex::Regex;
use serde_json::Value;

use crate::models::{Condition, ConditionOp};

/// Walk a dotted path (`$.field.subfield` or `field.subfield`) through a
/// nested mapping. A missing intermediate key means the path does not exist.
pub fn walk_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix("$.").unwrap_or(path);
    if path.is_empty() {
        return Some(root);
    }

    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// String→float64 coercion used by numeric operators. Booleans and
/// structures never coerce.
fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Comparison string form: bare strings, JSON text for everything else.
fn as_comparison_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Equality with numeric comparison attempted first.
fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_f64(left), as_f64(right)) {
        return a == b;
    }
    as_comparison_string(left) == as_comparison_string(right)
}

/// Evaluate one condition against the rendered envelope. Every failure mode
/// (missing path, failed coercion, bad regex, non-list `in` value) evaluates
/// to false rather than erroring the rule.
pub fn evaluate_condition(root: &Value, condition: &Condition) -> bool {
    let actual = walk_path(root, &condition.path);

    match condition.operator {
        ConditionOp::Exists => return actual.is_some(),
        ConditionOp::NotExists => return actual.is_none(),
        _ => {}
    }

    let actual = match actual {
        Some(actual) => actual,
        None => return false,
    };

    match condition.operator {
        ConditionOp::Exists | ConditionOp::NotExists => unreachable!(),
        ConditionOp::Eq => values_equal(actual, &condition.value),
        ConditionOp::Ne => !values_equal(actual, &condition.value),
        ConditionOp::Gt | ConditionOp::Gte | ConditionOp::Lt | ConditionOp::Lte => {
            let (left, right) = match (as_f64(actual), as_f64(&condition.value)) {
                (Some(l), Some(r)) => (l, r),
                _ => return false,
            };
            match condition.operator {
                ConditionOp::Gt => left > right,
                ConditionOp::Gte => left >= right,
                ConditionOp::Lt => left < right,
                _ => left <= right,
            }
        }
        ConditionOp::Contains => match actual {
            Value::Array(items) => items.iter().any(|item| values_equal(item, &condition.value)),
            other => {
                as_comparison_string(other).contains(&as_comparison_string(&condition.value))
            }
        },
        ConditionOp::Regex => {
            let pattern = match condition.value.as_str() {
                Some(pattern) => pattern,
                None => return false,
            };
            match Regex::new(pattern) {
                Ok(regex) => regex.is_match(&as_comparison_string(actual)),
                // Compile errors are condition failures, never rule errors.
                Err(_) => false,
            }
        }
        ConditionOp::In => match &condition.value {
            Value::Array(options) => options.iter().any(|option| values_equal(actual, option)),
            _ => false,
        },
    }
}

/// All-match (logical AND), short-circuiting on the first false.
pub fn evaluate_conditions(root: &Value, conditions: &[Condition]) -> bool {
    conditions
        .iter()
        .all(|condition| evaluate_condition(root, condition))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> Value {
        json!({
            "id": "evt-1",
            "app_id": "demo",
            "user_id": "u42",
            "timestamp_ms": 1706918400000i64,
            "purchase": {
                "order_id": "o-77",
                "amount": 129.5,
                "currency": "USD",
                "quantity": 2
            },
            "device_context": {"platform": "ios"}
        })
    }

    fn cond(path: &str, operator: ConditionOp, value: Value) -> Condition {
        Condition {
            path: path.to_string(),
            operator,
            value,
        }
    }

    #[test]
    fn walks_dollar_prefixed_paths() {
        let root = event();
        assert_eq!(
            walk_path(&root, "$.purchase.currency").and_then(Value::as_str),
            Some("USD")
        );
        assert_eq!(
            walk_path(&root, "purchase.amount").and_then(Value::as_f64),
            Some(129.5)
        );
        assert!(walk_path(&root, "$.purchase.missing.deeper").is_none());
    }

    #[test]
    fn eq_prefers_numeric_comparison() {
        let root = event();
        assert!(evaluate_condition(
            &root,
            &cond("$.purchase.quantity", ConditionOp::Eq, json!("2"))
        ));
        assert!(evaluate_condition(
            &root,
            &cond("$.purchase.currency", ConditionOp::Eq, json!("USD"))
        ));
        assert!(!evaluate_condition(
            &root,
            &cond("$.purchase.currency", ConditionOp::Eq, json!("EUR"))
        ));
    }

    #[test]
    fn ne_negates_eq() {
        let root = event();
        assert!(evaluate_condition(
            &root,
            &cond("$.purchase.currency", ConditionOp::Ne, json!("EUR"))
        ));
        assert!(!evaluate_condition(
            &root,
            &cond("$.purchase.quantity", ConditionOp::Ne, json!(2))
        ));
    }

    #[test]
    fn ordering_operators_coerce_strings() {
        let root = json!({"metrics": {"value": "10.5"}});
        assert!(evaluate_condition(
            &root,
            &cond("$.metrics.value", ConditionOp::Gt, json!(10))
        ));
        assert!(evaluate_condition(
            &root,
            &cond("$.metrics.value", ConditionOp::Lte, json!("10.5"))
        ));
        assert!(!evaluate_condition(
            &root,
            &cond("$.metrics.value", ConditionOp::Lt, json!(10))
        ));
    }

    #[test]
    fn failed_coercion_is_false() {
        let root = event();
        assert!(!evaluate_condition(
            &root,
            &cond("$.purchase.currency", ConditionOp::Gt, json!(5))
        ));
        assert!(!evaluate_condition(
            &root,
            &cond("$.purchase.amount", ConditionOp::Gte, json!("not-a-number"))
        ));
    }

    #[test]
    fn contains_on_strings_and_arrays() {
        let root = json!({"tags": ["vip", "beta"], "name": "hello world"});
        assert!(evaluate_condition(
            &root,
            &cond("$.name", ConditionOp::Contains, json!("lo wo"))
        ));
        assert!(evaluate_condition(
            &root,
            &cond("$.tags", ConditionOp::Contains, json!("vip"))
        ));
        assert!(!evaluate_condition(
            &root,
            &cond("$.tags", ConditionOp::Contains, json!("admin"))
        ));
    }

    #[test]
    fn regex_matches_and_bad_patterns_are_false() {
        let root = event();
        assert!(evaluate_condition(
            &root,
            &cond("$.purchase.order_id", ConditionOp::Regex, json!("^o-\\d+$"))
        ));
        assert!(!evaluate_condition(
            &root,
            &cond("$.purchase.order_id", ConditionOp::Regex, json!("([unclosed"))
        ));
        assert!(!evaluate_condition(
            &root,
            &cond("$.purchase.order_id", ConditionOp::Regex, json!(42))
        ));
    }

    #[test]
    fn in_requires_a_list() {
        let root = event();
        assert!(evaluate_condition(
            &root,
            &cond(
                "$.purchase.currency",
                ConditionOp::In,
                json!(["USD", "EUR"])
            )
        ));
        assert!(!evaluate_condition(
            &root,
            &cond("$.purchase.currency", ConditionOp::In, json!("USD"))
        ));
        assert!(evaluate_condition(
            &root,
            &cond("$.purchase.quantity", ConditionOp::In, json!([1, "2", 3]))
        ));
    }

    #[test]
    fn exists_consults_presence_only() {
        let root = event();
        assert!(evaluate_condition(
            &root,
            &cond("$.user_id", ConditionOp::Exists, Value::Null)
        ));
        assert!(evaluate_condition(
            &root,
            &cond("$.device_id", ConditionOp::NotExists, Value::Null)
        ));
        assert!(!evaluate_condition(
            &root,
            &cond("$.purchase", ConditionOp::NotExists, Value::Null)
        ));
    }

    #[test]
    fn operators_other_than_exists_require_presence() {
        let root = event();
        assert!(!evaluate_condition(
            &root,
            &cond("$.missing", ConditionOp::Eq, json!("anything"))
        ));
        assert!(!evaluate_condition(
            &root,
            &cond("$.missing", ConditionOp::Regex, json!(".*"))
        ));
    }

    #[test]
    fn all_match_short_circuits() {
        let root = event();
        let conditions = vec![
            cond("$.app_id", ConditionOp::Eq, json!("demo")),
            cond("$.purchase.amount", ConditionOp::Gt, json!(100)),
        ];
        assert!(evaluate_conditions(&root, &conditions));

        let failing = vec![
            cond("$.app_id", ConditionOp::Eq, json!("other")),
            cond("$.purchase.amount", ConditionOp::Gt, json!(100)),
        ];
        assert!(!evaluate_conditions(&root, &failing));
    }
}
