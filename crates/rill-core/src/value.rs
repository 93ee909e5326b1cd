use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;

/// Dynamically tagged scalar flowing between selectors, operators and
/// the evaluator.
///
/// `Int` and `Bool` are fully inline. `Str` and the list variants use
/// `Arc` for cheap cloning, and because constants embedded in a compiled
/// program are shared by concurrent evaluations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// The null/absent marker.
    Absent,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    IntList(Arc<Vec<i64>>),
    StrList(Arc<Vec<String>>),
}

impl Value {
    /// Short lowercase tag used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Absent => "absent",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::IntList(_) => "int-list",
            Value::StrList(_) => "string-list",
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_ref()),
            _ => None,
        }
    }
}

/// `Absent` as the default lets the evaluator move values out of stack
/// slots with `mem::take`.
impl Default for Value {
    fn default() -> Self {
        Value::Absent
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Absent => write!(f, "absent"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "\"{s}\""),
            Value::IntList(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Value::StrList(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "\"{item}\"")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s.as_str()))
    }
}

impl From<Vec<i64>> for Value {
    fn from(items: Vec<i64>) -> Self {
        Value::IntList(Arc::new(items))
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::StrList(Arc::new(items))
    }
}

impl From<Value> for JsonValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Absent => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(b),
            Value::Int(n) => JsonValue::from(n),
            Value::Str(s) => JsonValue::String(s.to_string()),
            Value::IntList(items) => {
                JsonValue::Array(items.iter().map(|n| JsonValue::from(*n)).collect())
            }
            Value::StrList(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|s| JsonValue::String(s.clone()))
                    .collect(),
            ),
        }
    }
}

/// JSON → Value, for embedders feeding variable maps from JSON
/// documents. Floats, objects and heterogeneous arrays have no Value
/// counterpart and are reported by name.
impl TryFrom<&JsonValue> for Value {
    type Error = String;

    fn try_from(v: &JsonValue) -> Result<Self, Self::Error> {
        match v {
            JsonValue::Null => Ok(Value::Absent),
            JsonValue::Bool(b) => Ok(Value::Bool(*b)),
            JsonValue::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| format!("unsupported number: {n}")),
            JsonValue::String(s) => Ok(Value::from(s.as_str())),
            JsonValue::Array(items) => {
                if items.iter().all(JsonValue::is_i64) {
                    let ints: Vec<i64> = items.iter().filter_map(JsonValue::as_i64).collect();
                    return Ok(Value::from(ints));
                }
                if items.iter().all(JsonValue::is_string) {
                    let strs: Vec<String> = items
                        .iter()
                        .filter_map(|s| s.as_str().map(str::to_string))
                        .collect();
                    return Ok(Value::from(strs));
                }
                Err("arrays must be all-integer or all-string".to_string())
            }
            JsonValue::Object(_) => Err("objects are not valid rule values".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn display_matches_source_syntax() {
        assert_eq!(Value::from(42).to_string(), "42");
        assert_eq!(Value::from("NYC").to_string(), "\"NYC\"");
        assert_eq!(Value::from(vec![1, 2, 3]).to_string(), "(1 2 3)");
        assert_eq!(
            Value::from(vec!["a".to_string(), "b".to_string()]).to_string(),
            "(\"a\" \"b\")"
        );
        assert_eq!(Value::Absent.to_string(), "absent");
    }

    #[test]
    fn json_round_trip() {
        let v = Value::from(vec!["NYC".to_string(), "SF".to_string()]);
        let j: JsonValue = v.clone().into();
        assert_eq!(j, json!(["NYC", "SF"]));
        assert_eq!(Value::try_from(&j).expect("convert"), v);
    }

    #[test]
    fn json_rejects_floats_and_objects() {
        assert!(Value::try_from(&json!(1.5)).is_err());
        assert!(Value::try_from(&json!({"a": 1})).is_err());
        assert!(Value::try_from(&json!([1, "mixed"])).is_err());
    }

    #[test]
    fn typed_accessors() {
        assert_eq!(Value::from(7).as_int(), Some(7));
        assert_eq!(Value::from(7).as_bool(), None);
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
    }
}
