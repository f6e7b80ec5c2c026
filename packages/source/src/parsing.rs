//! Shared helpers for reading loosely typed JSON payload fields.
//!
//! Both remote APIs are inconsistent about scalar types (numbers arrive as
//! strings and vice versa) and about cardinality (a single result is often
//! returned as a bare object instead of a one-element array).

use riksdata_source_models::MappingError;
use serde_json::Value;

/// Normalizes an array-or-single value into a sequence.
///
/// `None` and `null` yield an empty sequence.
#[must_use]
pub fn one_or_many(value: Option<&Value>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    }
}

/// Reads a scalar field as text. Empty strings are treated as absent.
#[must_use]
pub fn text(item: &Value, key: &str) -> Option<String> {
    match item.get(key)? {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Reads the first non-empty text field among `keys`.
#[must_use]
pub fn first_text(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| text(item, key))
}

/// Reads a required text field, trying each key in order.
///
/// # Errors
///
/// Returns [`MappingError::MissingField`] naming the first key if none is
/// present.
pub fn required_text(item: &Value, keys: &[&str]) -> Result<String, MappingError> {
    first_text(item, keys).ok_or_else(|| MappingError::MissingField {
        field: keys.first().copied().unwrap_or_default().to_string(),
    })
}

/// Reads an integer field that may arrive as a number or a numeric string.
///
/// # Errors
///
/// Returns [`MappingError::InvalidField`] if the field is present but not
/// an integer.
pub fn integer(item: &Value, key: &str) -> Result<Option<i64>, MappingError> {
    let Some(raw) = text(item, key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<i64>()
        .map(Some)
        .map_err(|e| MappingError::InvalidField {
            field: key.to_string(),
            message: format!("{raw:?} is not an integer: {e}"),
        })
}

/// Parses a page or item count reported as a number or a numeric string.
#[must_use]
pub fn count(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Returns a short description of a JSON value's kind, for error messages.
#[must_use]
pub const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Returns the last path segment of a URL, ignoring any query string.
#[must_use]
pub fn file_name(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn single_object_becomes_one_element_sequence() {
        let payload = json!({"dok_id": "H8B1"});
        assert_eq!(one_or_many(Some(&payload)), vec![payload.clone()]);
        assert!(one_or_many(Some(&Value::Null)).is_empty());
        assert!(one_or_many(None).is_empty());
    }

    #[test]
    fn text_accepts_numbers_and_skips_empty() {
        let item = json!({"punkt": 3, "titel": "", "rm": "2023/24"});
        assert_eq!(text(&item, "punkt").as_deref(), Some("3"));
        assert_eq!(text(&item, "titel"), None);
        assert_eq!(text(&item, "rm").as_deref(), Some("2023/24"));
    }

    #[test]
    fn first_text_falls_back_in_order() {
        let item = json!({"id": "abc"});
        assert_eq!(first_text(&item, &["dok_id", "id"]).as_deref(), Some("abc"));
    }

    #[test]
    fn required_text_names_the_primary_key() {
        let err = required_text(&json!({}), &["dok_id", "id"]).unwrap_err();
        assert_eq!(
            err,
            MappingError::MissingField {
                field: "dok_id".to_string()
            }
        );
    }

    #[test]
    fn integer_parses_numeric_strings() {
        let item = json!({"punkt": "12", "bad": "tolv"});
        assert_eq!(integer(&item, "punkt").unwrap(), Some(12));
        assert_eq!(integer(&item, "missing").unwrap(), None);
        assert!(integer(&item, "bad").is_err());
    }

    #[test]
    fn count_reads_string_metadata() {
        assert_eq!(count(Some(&json!("42"))), Some(42));
        assert_eq!(count(Some(&json!(7))), Some(7));
        assert_eq!(count(Some(&json!("n/a"))), None);
    }

    #[test]
    fn file_name_strips_query() {
        assert_eq!(
            file_name("https://www.regeringen.se/a/b/rapport.pdf?v=2"),
            Some("rapport.pdf")
        );
        assert_eq!(file_name("https://www.regeringen.se/a/"), None);
    }
}
