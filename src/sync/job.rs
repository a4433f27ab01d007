//! Sync job declarations and dependency ordering.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::{JobConfig, RelationConfig};
use crate::error::{SyncError, SyncResult};

/// One entity type to push downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJobDescriptor {
    pub entity_type: String,
    /// Target collection id.
    pub collection: String,
    /// Entity types whose jobs must complete first.
    pub depends_on: Vec<String>,
    /// Field holding the stable logical key.
    pub upsert_key: String,
    /// Source field → target property renames.
    pub field_map: HashMap<String, String>,
    pub relations: Vec<RelationConfig>,
}

impl SyncJobDescriptor {
    pub fn new(entity_type: impl Into<String>, upsert_key: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        Self {
            collection: entity_type.clone(),
            entity_type,
            depends_on: Vec::new(),
            upsert_key: upsert_key.into(),
            field_map: HashMap::new(),
            relations: Vec::new(),
        }
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn depends_on(mut self, entity_type: impl Into<String>) -> Self {
        self.depends_on.push(entity_type.into());
        self
    }

    pub fn map_field(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.field_map.insert(from.into(), to.into());
        self
    }

    /// Target property holding the upsert key.
    pub fn target_key_field(&self) -> &str {
        self.field_map
            .get(&self.upsert_key)
            .map(String::as_str)
            .unwrap_or(self.upsert_key.as_str())
    }

    /// Resolve `field` values as upsert keys of `entity_type`.
    pub fn relation(mut self, field: impl Into<String>, entity_type: impl Into<String>) -> Self {
        self.relations.push(RelationConfig {
            field: field.into(),
            entity_type: entity_type.into(),
        });
        self
    }
}

impl From<&JobConfig> for SyncJobDescriptor {
    fn from(config: &JobConfig) -> Self {
        Self {
            entity_type: config.entity_type.clone(),
            collection: config
                .collection
                .clone()
                .unwrap_or_else(|| config.entity_type.clone()),
            depends_on: config.depends_on.clone(),
            upsert_key: config.upsert_key.clone(),
            field_map: config.field_map.clone(),
            relations: config.relations.clone(),
        }
    }
}

/// Order `jobs` so each runs after everything it depends on.
///
/// Ties keep declaration order. Duplicate entity types, unknown dependencies
/// and cycles are rejected before anything runs.
pub fn topological_order(jobs: &[SyncJobDescriptor]) -> SyncResult<Vec<SyncJobDescriptor>> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(jobs.len());
    for (i, job) in jobs.iter().enumerate() {
        if index.insert(job.entity_type.as_str(), i).is_some() {
            return Err(SyncError::OrchestrationConfig(format!(
                "job '{}' is declared more than once",
                job.entity_type
            )));
        }
    }

    let mut in_degree = vec![0usize; jobs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); jobs.len()];

    for (i, job) in jobs.iter().enumerate() {
        let mut seen = HashSet::new();
        for dep in &job.depends_on {
            let Some(&d) = index.get(dep.as_str()) else {
                return Err(SyncError::OrchestrationConfig(format!(
                    "job '{}' depends on unknown job '{}'",
                    job.entity_type, dep
                )));
            };
            if seen.insert(d) {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..jobs.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(jobs.len());

    while let Some(i) = queue.pop_front() {
        order.push(jobs[i].clone());
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() != jobs.len() {
        let mut stuck: Vec<&str> = jobs
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, j)| j.entity_type.as_str())
            .collect();
        stuck.sort_unstable();
        return Err(SyncError::OrchestrationConfig(format!(
            "dependency cycle among jobs: {}",
            stuck.join(", ")
        )));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(jobs: &[SyncJobDescriptor]) -> Vec<&str> {
        jobs.iter().map(|j| j.entity_type.as_str()).collect()
    }

    #[test]
    fn test_dependencies_run_first() {
        let jobs = vec![
            SyncJobDescriptor::new("devices", "serial").depends_on("clients"),
            SyncJobDescriptor::new("tickets", "id").depends_on("clients").depends_on("devices"),
            SyncJobDescriptor::new("clients", "name"),
        ];
        let order = topological_order(&jobs).unwrap();
        assert_eq!(names(&order), vec!["clients", "devices", "tickets"]);
    }

    #[test]
    fn test_independent_jobs_keep_declaration_order() {
        let jobs = vec![
            SyncJobDescriptor::new("b", "k"),
            SyncJobDescriptor::new("a", "k"),
            SyncJobDescriptor::new("c", "k"),
        ];
        assert_eq!(names(&topological_order(&jobs).unwrap()), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let jobs = vec![
            SyncJobDescriptor::new("a", "k").depends_on("c"),
            SyncJobDescriptor::new("b", "k").depends_on("a"),
            SyncJobDescriptor::new("c", "k").depends_on("b"),
            SyncJobDescriptor::new("d", "k"),
        ];
        let err = topological_order(&jobs).unwrap_err();
        match err {
            SyncError::OrchestrationConfig(msg) => assert!(msg.contains("a, b, c"), "{}", msg),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_unknown_and_duplicate_jobs_are_rejected() {
        let unknown = vec![SyncJobDescriptor::new("a", "k").depends_on("ghost")];
        assert!(matches!(topological_order(&unknown), Err(SyncError::OrchestrationConfig(_))));

        let dup = vec![SyncJobDescriptor::new("a", "k"), SyncJobDescriptor::new("a", "k")];
        assert!(matches!(topological_order(&dup), Err(SyncError::OrchestrationConfig(_))));
    }

    #[test]
    fn test_from_config_defaults_collection() {
        let config = JobConfig {
            entity_type: "devices".into(),
            collection: None,
            depends_on: vec!["clients".into()],
            upsert_key: "serial".into(),
            field_map: HashMap::new(),
            relations: Vec::new(),
        };
        let job = SyncJobDescriptor::from(&config);
        assert_eq!(job.collection, "devices");
        assert_eq!(job.depends_on, vec!["clients".to_string()]);
    }
}
