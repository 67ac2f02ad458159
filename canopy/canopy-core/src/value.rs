use serde_json::{Map, Number, Value};

/// Normalises a JSON value for structural comparison.
///
/// Object key order never matters for `serde_json::Value` equality, but the
/// store may hand back `1` for a value written as `1.0`, so integral floats are
/// folded into integers.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Number(n) => Value::Number(canonical_number(n)),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn canonical_number(n: &Number) -> Number {
    if n.is_i64() || n.is_u64() {
        return n.clone();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
            Number::from(f as i64)
        }
        _ => n.clone(),
    }
}

/// The value as the store would keep it: `null` members are dropped and
/// objects left empty disappear. `None` means nothing would be stored.
pub fn stored_form(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let kept: Map<String, Value> = map
                .iter()
                .filter_map(|(k, v)| stored_form(v).map(|v| (k.clone(), v)))
                .collect();
            if kept.is_empty() {
                None
            } else {
                Some(Value::Object(kept))
            }
        }
        other => Some(other.clone()),
    }
}

/// True when writing `value` would leave the key absent.
pub fn is_absent(value: &Value) -> bool {
    stored_form(value).is_none()
}

/// Structural equality after canonicalisation.
pub fn same_value(a: &Value, b: &Value) -> bool {
    canonicalize(a) == canonicalize(b)
}

/// Reads a stored counter. Absent counts as zero; anything that is not an
/// integral number is rejected.
pub fn as_counter(value: Option<&Value>) -> Option<i64> {
    match value {
        None | Some(Value::Null) => Some(0),
        Some(Value::Number(n)) => canonical_number(n).as_i64(),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_and_integral_floats() {
        let a = json!({"name": "alice", "seat": 1, "tags": [1.0, 2]});
        let b: Value = serde_json::from_str(r#"{"tags":[1,2.0],"seat":1.0,"name":"alice"}"#).unwrap();
        assert!(same_value(&a, &b));
        assert!(!same_value(&json!({"seat": 1.5}), &json!({"seat": 1})));
    }

    #[test]
    fn values_that_store_nothing() {
        assert!(is_absent(&Value::Null));
        assert!(is_absent(&json!({})));
        assert!(is_absent(&json!({"alice": null})));
        assert!(is_absent(&json!({"a": {"b": null}, "c": {}})));
        assert!(!is_absent(&json!([])));
        assert!(!is_absent(&json!(0)));
        assert_eq!(
            stored_form(&json!({"user": "u1", "note": null})),
            Some(json!({"user": "u1"}))
        );
    }

    #[test]
    fn counters() {
        assert_eq!(as_counter(None), Some(0));
        assert_eq!(as_counter(Some(&json!(41))), Some(41));
        assert_eq!(as_counter(Some(&json!(7.0))), Some(7));
        assert_eq!(as_counter(Some(&json!(7.5))), None);
        assert_eq!(as_counter(Some(&json!("7"))), None);
    }
}
