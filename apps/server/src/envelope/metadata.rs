//! Namespaced key/value metadata
//!
//! Keys take the form `<namespace>.<key>`. Each pipeline stage owns one
//! namespace, so a stage never overwrites another stage's annotations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Listener,
    Parser,
    Validator,
    Transformer,
    Router,
    Connector,
    Pipeline,
}

impl Namespace {
    pub const ALL: [Namespace; 7] = [
        Namespace::Listener,
        Namespace::Parser,
        Namespace::Validator,
        Namespace::Transformer,
        Namespace::Router,
        Namespace::Connector,
        Namespace::Pipeline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Listener => "listener",
            Self::Parser => "parser",
            Self::Validator => "validator",
            Self::Transformer => "transformer",
            Self::Router => "router",
            Self::Connector => "connector",
            Self::Pipeline => "pipeline",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.as_str() == raw)
    }

    pub fn key(&self, key: &str) -> String {
        format!("{}.{}", self.as_str(), key)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Metadata key '{0}' has no namespace")]
    Unqualified(String),

    #[error("Metadata key '{0}' uses an unknown namespace")]
    UnknownNamespace(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, namespace: Namespace, key: &str, value: impl Into<String>) {
        self.0.insert(namespace.key(key), value.into());
    }

    /// Insert a fully qualified `<namespace>.<key>` entry.
    pub fn insert_qualified(
        &mut self,
        key: &str,
        value: impl Into<String>,
    ) -> Result<(), MetadataError> {
        let (namespace, local) = key
            .split_once('.')
            .filter(|(_, local)| !local.is_empty())
            .ok_or_else(|| MetadataError::Unqualified(key.to_string()))?;
        if Namespace::parse(namespace).is_none() {
            return Err(MetadataError::UnknownNamespace(key.to_string()));
        }
        self.0.insert(format!("{namespace}.{local}"), value.into());
        Ok(())
    }

    /// Copy every local key of `entries` under `namespace`.
    pub fn extend_namespaced<'a, I>(&mut self, namespace: Namespace, entries: I)
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in entries {
            self.insert(namespace, key, value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn get_in(&self, namespace: Namespace, key: &str) -> Option<&str> {
        self.get(&namespace.key(key))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
