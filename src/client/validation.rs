//! Outbound input validation and sanitization.
//!
//! Limits mirror the downstream API: 2000 characters per text value, 100
//! items per array, 500KB per request payload.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::store::Record;

pub const MAX_IDENTIFIER_LEN: usize = 200;
pub const MAX_FIELD_NAME_LEN: usize = 100;
pub const MAX_TEXT_CHARS: usize = 2000;
pub const MAX_ARRAY_ITEMS: usize = 100;
pub const MAX_PAYLOAD_BYTES: usize = 500 * 1024;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 _.:@/#+()\-]*$").expect("valid identifier regex"));

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));

/// Reject empty, oversized or oddly formed identifiers (keys, collection ids).
pub fn validate_identifier(field: &str, value: &str) -> SyncResult<()> {
    if value.trim().is_empty() {
        return Err(SyncError::validation(field, "identifier is empty"));
    }
    if value.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(SyncError::validation(
            field,
            format!("identifier longer than {} characters", MAX_IDENTIFIER_LEN),
        ));
    }
    if !IDENTIFIER_RE.is_match(value) {
        return Err(SyncError::validation(field, "identifier contains disallowed characters"));
    }
    Ok(())
}

fn validate_field_name(name: &str) -> SyncResult<()> {
    if name.trim().is_empty() {
        return Err(SyncError::validation("<field>", "field name is empty"));
    }
    if name.chars().count() > MAX_FIELD_NAME_LEN {
        return Err(SyncError::validation(name, "field name too long"));
    }
    if name.chars().any(|c| c.is_control() || c == '<' || c == '>') {
        return Err(SyncError::validation(name, "field name contains markup or control characters"));
    }
    Ok(())
}

/// Strip tags, escape stray angle brackets, drop control characters and cap
/// the length. The cap applies to the escaped output; an entity that would
/// cross it is dropped whole.
pub fn sanitize_text(value: &str) -> String {
    let stripped = TAG_RE.replace_all(value, "");
    let mut out = String::with_capacity(stripped.len().min(MAX_TEXT_CHARS * 4));
    let mut chars = 0;

    for c in stripped.trim().chars() {
        let escaped = match c {
            '<' => "&lt;",
            '>' => "&gt;",
            c if c.is_control() && c != '\n' && c != '\t' => continue,
            _ => "",
        };
        let width = escaped.len().max(1);
        if chars + width > MAX_TEXT_CHARS {
            break;
        }
        if escaped.is_empty() {
            out.push(c);
        } else {
            out.push_str(escaped);
        }
        chars += width;
    }
    out
}

fn sanitize_value(field: &str, value: &Value) -> SyncResult<Value> {
    Ok(match value {
        Value::String(s) => Value::String(sanitize_text(s)),
        Value::Array(items) => {
            if items.len() > MAX_ARRAY_ITEMS {
                return Err(SyncError::validation(
                    field,
                    format!("{} items exceeds the limit of {}", items.len(), MAX_ARRAY_ITEMS),
                ));
            }
            Value::Array(
                items
                    .iter()
                    .map(|item| sanitize_value(field, item))
                    .collect::<SyncResult<_>>()?,
            )
        }
        Value::Object(map) => Value::Object(sanitize_record(map)?),
        other => other.clone(),
    })
}

/// Sanitize every value of `record`, recursing into arrays and objects.
pub fn sanitize_record(record: &Record) -> SyncResult<Record> {
    let mut out = Record::new();
    for (name, value) in record {
        validate_field_name(name)?;
        out.insert(name.clone(), sanitize_value(name, value)?);
    }
    Ok(out)
}

/// Reject payloads the API would refuse for size.
pub fn check_payload_size(record: &Record) -> SyncResult<()> {
    let size = serde_json::to_vec(record)?.len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(SyncError::validation(
            "<payload>",
            format!("{} bytes exceeds the limit of {}", size, MAX_PAYLOAD_BYTES),
        ));
    }
    Ok(())
}

/// Validate an upsert request and return the sanitized payload with the key
/// field set.
pub fn prepare_upsert(collection: &str, key_field: &str, key: &str, payload: &Record) -> SyncResult<Record> {
    validate_identifier("collection", collection)?;
    validate_identifier("key_field", key_field)?;
    validate_identifier(key_field, key)?;

    let mut fields = sanitize_record(payload)?;
    fields.insert(key_field.to_string(), Value::String(key.to_string()));
    check_payload_size(&fields)?;
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identifier_rules() {
        assert!(validate_identifier("serial", "SN-0001").is_ok());
        assert!(validate_identifier("email", "ops@example.com").is_ok());
        assert!(validate_identifier("serial", "").is_err());
        assert!(validate_identifier("serial", "   ").is_err());
        assert!(validate_identifier("serial", &"x".repeat(MAX_IDENTIFIER_LEN + 1)).is_err());
        assert!(validate_identifier("serial", "<script>").is_err());
        assert!(validate_identifier("serial", "-leading-dash").is_err());
    }

    #[test]
    fn test_markup_is_stripped_and_escaped() {
        assert_eq!(sanitize_text("<b>Server</b> down"), "Server down");
        assert_eq!(sanitize_text("a < b"), "a &lt; b");
        assert_eq!(sanitize_text("line\u{0007}one\nline two"), "lineone\nline two");
    }

    #[test]
    fn test_text_is_truncated() {
        let long = "a".repeat(MAX_TEXT_CHARS + 50);
        assert_eq!(sanitize_text(&long).chars().count(), MAX_TEXT_CHARS);
    }

    #[test]
    fn test_escaped_text_stays_within_limit() {
        let brackets = sanitize_text(&"<".repeat(MAX_TEXT_CHARS));
        assert_eq!(brackets.chars().count(), MAX_TEXT_CHARS);
        assert!(brackets.ends_with("&lt;"));

        let payload = json!({"notes": "a<b".repeat(700)});
        let fields = prepare_upsert("devices", "serial", "SN-1", payload.as_object().unwrap()).unwrap();
        let notes = fields["notes"].as_str().unwrap();
        // 333 escaped "a<b" blocks fill 1998 chars, one more 'a' fits, the next entity does not
        assert_eq!(notes.chars().count(), 1999);
        assert!(notes.ends_with("&lt;ba"));
    }

    #[test]
    fn test_arrays_are_bounded() {
        let ok = json!({"tags": vec!["x"; MAX_ARRAY_ITEMS]});
        assert!(sanitize_record(ok.as_object().unwrap()).is_ok());

        let too_many = json!({"tags": vec!["x"; MAX_ARRAY_ITEMS + 1]});
        let err = sanitize_record(too_many.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, SyncError::Validation { ref field, .. } if field == "tags"));
    }

    #[test]
    fn test_nested_values_are_sanitized() {
        let rec = json!({"Name": {"title": [{"text": {"content": "<i>edge-01</i>"}}]}, "count": 3});
        let clean = sanitize_record(rec.as_object().unwrap()).unwrap();
        assert_eq!(clean["Name"]["title"][0]["text"]["content"], "edge-01");
        assert_eq!(clean["count"], 3);
    }

    #[test]
    fn test_prepare_sets_key_field() {
        let payload = json!({"Name": "<b>edge</b>"});
        let fields = prepare_upsert("devices", "Serial Number", "SN-1", payload.as_object().unwrap()).unwrap();
        assert_eq!(fields["Serial Number"], "SN-1");
        assert_eq!(fields["Name"], "edge");
        assert!(prepare_upsert("", "serial", "SN-1", payload.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_payload_size_limit() {
        let big = json!({"blob": "x".repeat(MAX_PAYLOAD_BYTES)});
        assert!(check_payload_size(big.as_object().unwrap()).is_err());
        let small = json!({"a": 1});
        assert!(check_payload_size(small.as_object().unwrap()).is_ok());
    }
}
