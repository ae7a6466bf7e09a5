//! Metadata store for containers and exec records

use dashmap::DashMap;
use std::time::Duration;

use crate::error::{KdError, Result};
use crate::time::is_older_than;
use crate::types::{Container, ContainerId, Exec};

/// Keyed persistence of Container and Exec records
///
/// Stored containers share their [`TaskRegistry`](crate::tasks::TaskRegistry)
/// with every clone handed out, so cancelling tasks on a fetched copy reaches
/// tasks registered on the copy that started them.
pub trait MetadataStore: Send + Sync {
    /// Look up a container by full id, name or unique id prefix
    fn get_container(&self, id: &str) -> Result<Container>;

    /// Insert or replace a container
    fn save_container(&self, container: &Container);

    /// Remove a container record
    fn delete_container(&self, id: &ContainerId) -> Result<()>;

    /// All stored containers
    fn containers(&self) -> Vec<Container>;

    /// Containers created more than `age` ago
    fn containers_older_than(&self, age: Duration) -> Vec<Container> {
        self.containers()
            .into_iter()
            .filter(|c| is_older_than(c.created, age))
            .collect()
    }

    /// Look up an exec record by id
    fn get_exec(&self, id: &str) -> Result<Exec>;

    /// Insert or replace an exec record
    fn save_exec(&self, exec: &Exec);

    /// Remove an exec record
    fn delete_exec(&self, id: &ContainerId) -> Result<()>;

    /// All stored exec records
    fn execs(&self) -> Vec<Exec>;

    /// Exec records created more than `age` ago
    fn execs_older_than(&self, age: Duration) -> Vec<Exec> {
        self.execs()
            .into_iter()
            .filter(|e| is_older_than(e.created, age))
            .collect()
    }
}

/// In-memory store, lost on restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    containers: DashMap<ContainerId, Container>,
    execs: DashMap<ContainerId, Exec>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

impl MetadataStore for MemoryStore {
    fn get_container(&self, id: &str) -> Result<Container> {
        if let Some(container) = self.containers.get(&ContainerId::from(id)) {
            return Ok(container.clone());
        }

        let by_name = self
            .containers
            .iter()
            .find(|entry| entry.name == id || entry.name.trim_start_matches('/') == id);
        if let Some(entry) = by_name {
            return Ok(entry.value().clone());
        }

        if id.is_empty() {
            return Err(KdError::NotFound(format!("container {id:?}")));
        }

        let mut matches = self
            .containers
            .iter()
            .filter(|entry| entry.key().as_str().starts_with(id));
        match (matches.next(), matches.next()) {
            (Some(entry), None) => Ok(entry.value().clone()),
            (Some(_), Some(_)) => Err(KdError::NotFound(format!(
                "container prefix {id} is ambiguous"
            ))),
            _ => Err(KdError::NotFound(format!("container {id}"))),
        }
    }

    fn save_container(&self, container: &Container) {
        self.containers
            .insert(container.id.clone(), container.clone());
    }

    fn delete_container(&self, id: &ContainerId) -> Result<()> {
        self.containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| KdError::NotFound(format!("container {id}")))
    }

    fn containers(&self) -> Vec<Container> {
        self.containers.iter().map(|r| r.value().clone()).collect()
    }

    fn get_exec(&self, id: &str) -> Result<Exec> {
        self.execs
            .get(&ContainerId::from(id))
            .map(|r| r.value().clone())
            .ok_or_else(|| KdError::NotFound(format!("exec {id}")))
    }

    fn save_exec(&self, exec: &Exec) {
        self.execs.insert(exec.id.clone(), exec.clone());
    }

    fn delete_exec(&self, id: &ContainerId) -> Result<()> {
        self.execs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| KdError::NotFound(format!("exec {id}")))
    }

    fn execs(&self) -> Vec<Exec> {
        self.execs.iter().map(|r| r.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_lookup_by_id_name_and_prefix() {
        let store = MemoryStore::new();
        let mut container = Container::new("redis");
        container.name = "/cache".to_string();
        store.save_container(&container);

        let id = container.id.as_str();
        assert_eq!(store.get_container(id).unwrap().id, container.id);
        assert_eq!(store.get_container("cache").unwrap().id, container.id);
        assert_eq!(store.get_container(&id[..6]).unwrap().id, container.id);
        assert!(store.get_container("nope").unwrap_err().is_not_found());
        assert!(store.get_container("").is_err());
    }

    #[test]
    fn test_clones_share_tasks() {
        let store = MemoryStore::new();
        let container = Container::new("nginx");
        let token = container.tasks.register();
        store.save_container(&container);

        let fetched = store.get_container(container.id.as_str()).unwrap();
        assert_eq!(fetched.tasks.cancel_all(), 1);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.delete_container(&ContainerId::from("gone")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_older_than() {
        let store = MemoryStore::new();
        let mut old = Container::new("old");
        old.created = Utc::now() - chrono::Duration::hours(2);
        let fresh = Container::new("fresh");
        store.save_container(&old);
        store.save_container(&fresh);

        let stale = store.containers_older_than(Duration::from_secs(3600));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);

        let mut exec = Exec::new(fresh.id.clone(), vec!["true".into()]);
        exec.created = Utc::now() - chrono::Duration::minutes(10);
        store.save_exec(&exec);
        assert_eq!(store.execs_older_than(Duration::from_secs(300)).len(), 1);
        store.delete_exec(&exec.id).unwrap();
        assert!(store.execs().is_empty());
    }
}
