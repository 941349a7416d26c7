//! Routing rules mapping inbound events to pipeline names.
//!
//! The routing document is JSON:
//!
//! ```json
//! {"defaultPipeline": "pl_default", "routes": {"blob:raw/": "pl_a", "type:emergency": "pl_b"}}
//! ```
//!
//! Keys prefixed with `type:` match on the event type, every other key is a
//! prefix match against the event source. Document order is rule order and
//! the first matching rule wins.
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use thiserror::Error;

use crate::event::InboundEvent;

/// Enumeration of errors raised while loading a routing document.
/// All of them are fatal: a service refuses to start without a valid config,
/// and a running service keeps its previous snapshot on a failed reload.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("routing document is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("routing document has no defaultPipeline")]
    MissingDefaultPipeline,
    #[error("route {pattern} maps to an empty pipeline name")]
    EmptyPipelineName { pattern: String },
    #[error("could not read routing document: {0}")]
    Io(#[from] std::io::Error),
}

/// How a rule's pattern is compared against an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// `pattern` is a prefix of the event source.
    Prefix,
    /// `pattern` equals the event type.
    Type,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub kind: MatchKind,
    pub pattern: String,
    pub pipeline: String,
}

impl Rule {
    fn matches(&self, event: &InboundEvent) -> bool {
        match self.kind {
            MatchKind::Prefix => event
                .source
                .as_deref()
                .is_some_and(|source| source.starts_with(&self.pattern)),
            MatchKind::Type => event.event_type.as_deref() == Some(self.pattern.as_str()),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutingDocument {
    #[serde(default)]
    default_pipeline: Option<String>,
    #[serde(default)]
    routes: serde_json::Map<String, serde_json::Value>,
}

/// An immutable snapshot of the routing rules.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub default_pipeline: String,
    pub rules: Vec<Rule>,
}

impl RoutingConfig {
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let document: RoutingDocument = serde_json::from_str(document)?;

        let default_pipeline = match document.default_pipeline {
            Some(name) if !name.is_empty() => name,
            _ => return Err(ConfigError::MissingDefaultPipeline),
        };

        let mut rules = Vec::with_capacity(document.routes.len());
        for (key, value) in &document.routes {
            let pipeline = match value.as_str() {
                Some(name) if !name.is_empty() => name.to_owned(),
                _ => {
                    return Err(ConfigError::EmptyPipelineName {
                        pattern: key.clone(),
                    })
                }
            };

            let rule = match key.strip_prefix("type:") {
                Some(event_type) => Rule {
                    kind: MatchKind::Type,
                    pattern: event_type.to_owned(),
                    pipeline,
                },
                // Source prefixes keep the whole key: blob event sources
                // carry their scheme, so `blob:raw/` matches `blob:raw/x`.
                None => Rule {
                    kind: MatchKind::Prefix,
                    pattern: key.clone(),
                    pipeline,
                },
            };
            rules.push(rule);
        }

        Ok(Self {
            default_pipeline,
            rules,
        })
    }

    /// Resolve the target pipeline for an event.
    /// Pure: identical inputs always yield the identical pipeline name.
    pub fn route<'a>(&'a self, event: &'a InboundEvent) -> &'a str {
        if let Some(explicit) = event.explicit_pipeline.as_deref() {
            return explicit;
        }

        self.rules
            .iter()
            .find(|rule| rule.matches(event))
            .map(|rule| rule.pipeline.as_str())
            .unwrap_or(&self.default_pipeline)
    }
}

/// Shared handle to the current routing snapshot.
///
/// Readers clone the inner `Arc` and route against a config that can never
/// change underneath them; reloads swap the pointer wholesale.
#[derive(Clone)]
pub struct RouterHandle {
    inner: Arc<RwLock<Arc<RoutingConfig>>>,
}

impl RouterHandle {
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path)?;
        Ok(Self::new(RoutingConfig::from_json(&document)?))
    }

    /// The current snapshot. In-flight dispatches keep routing against the
    /// snapshot they grabbed even if a reload lands mid-flight.
    pub fn snapshot(&self) -> Arc<RoutingConfig> {
        self.inner.read().expect("poisoned RouterHandle lock").clone()
    }

    pub fn swap(&self, config: RoutingConfig) {
        *self.inner.write().expect("poisoned RouterHandle lock") = Arc::new(config);
    }

    /// Re-read the document and swap it in; the previous snapshot stays
    /// active when the new document fails validation.
    pub fn reload_from_path(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let document = std::fs::read_to_string(path)?;
        self.swap(RoutingConfig::from_json(&document)?);
        Ok(())
    }
}
