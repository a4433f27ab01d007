//! Source record → target payload.
//!
//! Renames fields per `field_map` and rewrites relation fields from upstream
//! keys to downstream record ids using the `KeyIndex` built while earlier
//! jobs ran.

use std::collections::HashMap;

use serde_json::Value;

use crate::client::validation::MAX_ARRAY_ITEMS;
use crate::error::{SyncError, SyncResult};
use crate::store::Record;
use crate::sync::job::SyncJobDescriptor;

/// (entity type, upsert key) → downstream record id.
#[derive(Debug, Default, Clone)]
pub struct KeyIndex {
    ids: HashMap<String, HashMap<String, String>>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity_type: &str, key: impl Into<String>, remote_id: impl Into<String>) {
        self.ids
            .entry(entity_type.to_string())
            .or_default()
            .insert(key.into(), remote_id.into());
    }

    pub fn get(&self, entity_type: &str, key: &str) -> Option<&str> {
        self.ids
            .get(entity_type)
            .and_then(|keys| keys.get(key))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Relation keys in `record` that are not indexed yet, as
    /// (entity type, key) pairs.
    pub fn missing(&self, job: &SyncJobDescriptor, record: &Record) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for relation in &job.relations {
            let Some(value) = record.get(&relation.field) else {
                continue;
            };
            for key in relation_keys(value) {
                if self.get(&relation.entity_type, &key).is_none()
                    && !out.iter().any(|(e, k)| e == &relation.entity_type && k == &key)
                {
                    out.push((relation.entity_type.clone(), key));
                }
            }
        }
        out
    }
}

/// A record ready for `find_or_create`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRecord {
    pub key: String,
    /// Target property holding the key.
    pub key_field: String,
    pub fields: Record,
}

fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn relation_keys(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(scalar_key).collect(),
        other => scalar_key(other).into_iter().collect(),
    }
}

/// Upsert key of a source record, if present.
pub fn record_key(job: &SyncJobDescriptor, record: &Record) -> Option<String> {
    record.get(&job.upsert_key).and_then(scalar_key)
}

fn resolve(index: &KeyIndex, entity_type: &str, field: &str, key: &str) -> SyncResult<Value> {
    index
        .get(entity_type, key)
        .map(|id| Value::String(id.to_string()))
        .ok_or_else(|| {
            SyncError::validation(field, format!("no synced {} with key '{}'", entity_type, key))
        })
}

/// Map one source record onto the job's target schema.
pub fn transform(job: &SyncJobDescriptor, record: &Record, index: &KeyIndex) -> SyncResult<TransformedRecord> {
    let key = record_key(job, record)
        .ok_or_else(|| SyncError::validation(&job.upsert_key, "missing upsert key"))?;

    let mut fields = Record::new();
    for (name, value) in record {
        let value = match job.relations.iter().find(|r| &r.field == name) {
            None => value.clone(),
            Some(relation) => match value {
                Value::Null => Value::Null,
                Value::Array(items) => {
                    if items.len() > MAX_ARRAY_ITEMS {
                        return Err(SyncError::validation(
                            name,
                            format!("{} related items exceeds the limit of {}", items.len(), MAX_ARRAY_ITEMS),
                        ));
                    }
                    let ids = items
                        .iter()
                        .enumerate()
                        .map(|(i, item)| {
                            let k = scalar_key(item).ok_or_else(|| {
                                SyncError::validation(name, format!("related item {} is not a key", i))
                            })?;
                            resolve(index, &relation.entity_type, name, &k)
                        })
                        .collect::<SyncResult<Vec<_>>>()?;
                    Value::Array(ids)
                }
                other => {
                    let k = scalar_key(other)
                        .ok_or_else(|| SyncError::validation(name, "relation value is not a key"))?;
                    resolve(index, &relation.entity_type, name, &k)?
                }
            },
        };
        let target = job.field_map.get(name).unwrap_or(name);
        fields.insert(target.clone(), value);
    }

    Ok(TransformedRecord {
        key,
        key_field: job.target_key_field().to_string(),
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn devices() -> SyncJobDescriptor {
        SyncJobDescriptor::new("devices", "serial")
            .depends_on("clients")
            .map_field("serial", "Serial Number")
            .map_field("hostname", "Name")
            .relation("client", "clients")
    }

    #[test]
    fn test_fields_are_renamed_and_relations_resolved() {
        let mut index = KeyIndex::new();
        index.insert("clients", "Acme", "page-acme");

        let out = transform(
            &devices(),
            &rec(json!({"serial": "SN-1", "hostname": "edge-01", "client": "Acme", "os": "linux"})),
            &index,
        )
        .unwrap();

        assert_eq!(out.key, "SN-1");
        assert_eq!(out.key_field, "Serial Number");
        assert_eq!(out.fields["Name"], "edge-01");
        assert_eq!(out.fields["client"], "page-acme");
        assert_eq!(out.fields["os"], "linux");
        assert!(out.fields.get("hostname").is_none());
    }

    #[test]
    fn test_array_relations_and_unresolved_keys() {
        let mut index = KeyIndex::new();
        index.insert("clients", "Acme", "p1");
        index.insert("clients", "Globex", "p2");

        let ok = transform(&devices(), &rec(json!({"serial": 7, "client": ["Acme", "Globex"]})), &index).unwrap();
        assert_eq!(ok.key, "7");
        assert_eq!(ok.fields["client"], json!(["p1", "p2"]));

        let record = rec(json!({"serial": "SN-2", "client": "Initech"}));
        assert_eq!(index.missing(&devices(), &record), vec![("clients".to_string(), "Initech".to_string())]);
        let err = transform(&devices(), &record, &index).unwrap_err();
        assert!(matches!(err, SyncError::Validation { ref field, .. } if field == "client"));
    }

    #[test]
    fn test_non_key_array_items_are_rejected() {
        let mut index = KeyIndex::new();
        index.insert("clients", "Acme", "p1");

        for bad in [json!(["Acme", {}]), json!(["Acme", true]), json!(["Acme", "  "])] {
            let err = transform(&devices(), &rec(json!({"serial": "SN-3", "client": bad})), &index).unwrap_err();
            assert!(
                matches!(err, SyncError::Validation { ref field, ref reason } if field == "client" && reason.contains("item 1")),
                "{err}"
            );
        }
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let err = transform(&devices(), &rec(json!({"hostname": "x"})), &KeyIndex::new()).unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
    }
}
