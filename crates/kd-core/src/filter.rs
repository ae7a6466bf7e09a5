//! Docker-style `filters` query evaluation
//!
//! Clients send filters as JSON in one of two shapes:
//!
//! ```text
//! {"label": ["app=web", "tier"], "status": ["running"]}
//! {"label": {"app=web": true, "tier": true}, "status": {"running": true}}
//! ```
//!
//! Both decode into the same [`Filters`]. Terms of one kind are OR-ed and
//! kinds are AND-ed.

use std::collections::{BTreeMap, HashMap};

use crate::error::ConfigError;
use crate::traits::Event;
use crate::types::Container;

/// A single `kind` filter term; `label=app=web` has key `app`, value `web`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterTerm {
    pub kind: String,
    pub key: String,
    pub value: Option<String>,
}

impl FilterTerm {
    fn parse(kind: &str, raw: &str) -> Self {
        let (key, value) = match raw.split_once('=') {
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (raw.to_string(), None),
        };
        Self {
            kind: kind.to_string(),
            key,
            value,
        }
    }
}

/// Something that can be tested against a filter term
pub trait Matcher {
    /// Whether this entity satisfies the term `kind` / `key` / `value`
    fn matches(&self, kind: &str, key: &str, value: Option<&str>) -> bool;
}

/// Parsed filter set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    terms: BTreeMap<String, Vec<FilterTerm>>,
}

impl Filters {
    /// Decode a filter query string; an empty string means no filtering
    pub fn parse(query: &str) -> Result<Self, ConfigError> {
        if query.trim().is_empty() {
            return Ok(Self::default());
        }

        // First the list shape, then the legacy map-of-bools shape.
        let list = serde_json::from_str::<HashMap<String, Vec<String>>>(query);
        let raw: BTreeMap<String, Vec<String>> = match list {
            Ok(list) => list.into_iter().collect(),
            Err(_) => {
                let set: HashMap<String, HashMap<String, bool>> = serde_json::from_str(query)
                    .map_err(|e| ConfigError::Invalid(format!("filters: {e}")))?;
                set.into_iter()
                    .map(|(kind, values)| {
                        let mut enabled: Vec<String> = values
                            .into_iter()
                            .filter_map(|(value, on)| on.then_some(value))
                            .collect();
                        enabled.sort();
                        (kind, enabled)
                    })
                    .collect()
            }
        };

        let terms = raw
            .into_iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(kind, values)| {
                let parsed = values.iter().map(|v| FilterTerm::parse(&kind, v)).collect();
                (kind, parsed)
            })
            .collect();

        Ok(Self { terms })
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Terms registered for `kind`
    pub fn terms(&self, kind: &str) -> &[FilterTerm] {
        self.terms.get(kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// Evaluate every kind against `item`
    pub fn matches<M: Matcher + ?Sized>(&self, item: &M) -> bool {
        self.terms.values().all(|terms| {
            terms
                .iter()
                .any(|t| item.matches(&t.kind, &t.key, t.value.as_deref()))
        })
    }
}

impl Matcher for Container {
    fn matches(&self, kind: &str, key: &str, value: Option<&str>) -> bool {
        match kind {
            "id" => self.id.as_str().starts_with(key),
            "name" => self.name.trim_start_matches('/').contains(key.trim_start_matches('/')),
            "label" => match (self.labels.get(key), value) {
                (Some(actual), Some(expected)) => actual == expected,
                (Some(_), None) => true,
                (None, _) => false,
            },
            "status" => self.lifecycle.status() == key,
            "ancestor" => self.image == key,
            _ => {
                tracing::debug!(kind, "unsupported container filter");
                false
            }
        }
    }
}

impl Matcher for Event {
    fn matches(&self, kind: &str, key: &str, _value: Option<&str>) -> bool {
        match kind {
            "type" => self.kind.to_string() == key,
            "event" => self.action.to_string() == key,
            "container" | "image" => self.kind.to_string() == kind && self.id.starts_with(key),
            _ => {
                tracing::debug!(kind, "unsupported event filter");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{EventAction, EventKind};
    use chrono::Utc;

    fn web_container() -> Container {
        let mut container = Container::new("nginx:latest");
        container.name = "/web".to_string();
        container.labels.insert("app".into(), "web".into());
        container.labels.insert("tier".into(), "front".into());
        container.lifecycle.mark_running();
        container
    }

    #[test]
    fn test_parse_both_shapes() {
        let list = Filters::parse(r#"{"label":["app=web"],"status":["running"]}"#).unwrap();
        let set = Filters::parse(r#"{"label":{"app=web":true},"status":{"running":true}}"#).unwrap();
        assert_eq!(list, set);

        let term = &list.terms("label")[0];
        assert_eq!(term.key, "app");
        assert_eq!(term.value.as_deref(), Some("web"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Filters::parse("not json").is_err());
        assert!(Filters::parse(r#"{"label": 3}"#).is_err());
        assert!(Filters::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_disabled_set_entries_are_dropped() {
        let filters = Filters::parse(r#"{"status":{"running":false}}"#).unwrap();
        assert!(filters.is_empty());
    }

    #[test]
    fn test_or_within_kind_and_across_kinds() {
        let container = web_container();

        let either = Filters::parse(r#"{"label":["app=db","app=web"]}"#).unwrap();
        assert!(either.matches(&container));

        let both = Filters::parse(r#"{"label":["app=web"],"status":["exited"]}"#).unwrap();
        assert!(!both.matches(&container));

        let key_only = Filters::parse(r#"{"label":["tier"],"name":["web"]}"#).unwrap();
        assert!(key_only.matches(&container));

        assert!(Filters::default().matches(&container));
    }

    #[test]
    fn test_container_id_and_ancestor() {
        let container = web_container();
        let query = format!(r#"{{"id":["{}"],"ancestor":["nginx:latest"]}}"#, container.short_id());
        assert!(Filters::parse(&query).unwrap().matches(&container));
    }

    #[test]
    fn test_event_matcher() {
        let event = Event {
            id: "abcdef".into(),
            kind: EventKind::Container,
            action: EventAction::Die,
            time: Utc::now(),
        };

        let filters = Filters::parse(r#"{"type":["container"],"event":["start","die"]}"#).unwrap();
        assert!(filters.matches(&event));

        let filters = Filters::parse(r#"{"container":["abc"]}"#).unwrap();
        assert!(filters.matches(&event));

        let filters = Filters::parse(r#"{"image":["abc"]}"#).unwrap();
        assert!(!filters.matches(&event));
    }
}
