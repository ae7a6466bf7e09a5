//! Naming and parsing rules for cluster objects
//!
//! These rules are relied upon by existing deployments and by the reaper's
//! label sweeps, so they must stay stable.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::ConfigError;
use crate::types::{Container, PortSpec};

/// Maximum length of a DNS label
pub const MAX_NAME_LEN: usize = 63;

/// Placeholder used when normalization leaves nothing
pub const UNDEFINED_NAME: &str = "undef";

/// Name of the main workload container
pub const MAIN_CONTAINER: &str = "main";

/// Name of the volume-staging init container
pub const SETUP_CONTAINER: &str = "setup";

/// Turn an arbitrary string into a DNS-label-safe identifier
///
/// Lowercases, strips leading non-alphanumerics, drops characters outside
/// `[a-z0-9-]`, truncates to 63 characters and strips trailing hyphens.
pub fn normalize_name(input: &str) -> String {
    let lowered = input.to_ascii_lowercase();
    let name: String = lowered
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .take(MAX_NAME_LEN)
        .collect();
    let name = name.trim_end_matches('-');

    if name.is_empty() {
        UNDEFINED_NAME.to_string()
    } else {
        name.to_string()
    }
}

/// Parse one `source:target[:mode]` bind into `(target, source)`
pub fn parse_bind(bind: &str) -> Result<(String, String), ConfigError> {
    let mut parts = bind.splitn(3, ':');
    let source = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();

    if source.is_empty() || target.is_empty() {
        return Err(ConfigError::InvalidBind(bind.to_string()));
    }

    Ok((target.to_string(), source.to_string()))
}

/// Parse binds into a target → source map, skipping malformed entries
pub fn parse_binds(binds: &[String]) -> BTreeMap<String, String> {
    binds
        .iter()
        .filter_map(|bind| match parse_bind(bind) {
            Ok(pair) => Some(pair),
            Err(error) => {
                tracing::warn!(%error, "ignoring bind mount");
                None
            }
        })
        .collect()
}

fn alias_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("alias pattern is a valid regex")
    })
}

/// Check that a network alias can be used as a Service name
pub fn validate_alias(alias: &str) -> Result<(), ConfigError> {
    if alias.len() > MAX_NAME_LEN || !alias_pattern().is_match(alias) {
        return Err(ConfigError::InvalidAlias(alias.to_string()));
    }
    Ok(())
}

/// Network aliases of `container` usable as Service names
///
/// Invalid aliases are dropped with a warning.
pub fn valid_aliases(container: &Container) -> Vec<String> {
    let mut aliases = Vec::new();
    for alias in &container.network_aliases {
        match validate_alias(alias) {
            Ok(()) if !aliases.contains(alias) => aliases.push(alias.clone()),
            Ok(()) => {}
            Err(error) => {
                tracing::warn!(id = %container.short_id(), %error, "ignoring network alias");
            }
        }
    }
    aliases
}

/// Ports a Service for `container` should expose, as source → target
///
/// The union of image ports and container ports (exposed on the same
/// number) and host bindings. A missing or zero host port means "same as
/// the container port"; negative host ports are not exposed. Only TCP
/// ports are considered.
pub fn service_ports(container: &Container) -> BTreeMap<u16, u16> {
    let mut ports: BTreeMap<u16, u16> = container
        .image_ports
        .iter()
        .chain(container.exposed_ports.iter())
        .filter(|p| p.is_tcp())
        .map(|p| (p.port, p.port))
        .collect();

    for (spec, host) in &container.port_bindings {
        if !spec.is_tcp() {
            continue;
        }
        match host_port(spec, *host) {
            Some(source) => {
                ports.insert(source, spec.port);
            }
            None => {
                // An explicit "do not expose" also hides the plain declaration.
                if ports.get(&spec.port) == Some(&spec.port) {
                    ports.remove(&spec.port);
                }
            }
        }
    }

    ports
}

fn host_port(spec: &PortSpec, host: Option<i32>) -> Option<u16> {
    match host {
        None | Some(0) => Some(spec.port),
        Some(port) if port < 0 => None,
        Some(port) => u16::try_from(port).ok(),
    }
}
