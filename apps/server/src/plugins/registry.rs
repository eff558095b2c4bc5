//! Plugin registration and lifecycle
//!
//! Plugins come from two places: configuration entries resolved through a
//! static factory table of built-in implementations, and programmatic
//! registration by embedders. Both are collected by
//! [`PluginRegistryBuilder`]; `initialize` runs each plugin's one-time setup
//! and yields an immutable [`PluginRegistry`].

use super::routers::{ContentBasedRouter, DynamicRouter, FilterRouter, RecipientListRouter};
use super::transformers::{ExtractAttachments, Hl7ToJson, PidToFhirPatient, SetMetadata};
use super::validators::{FhirResourceValidator, Hl7StructureValidator};
use super::{PluginError, PluginSettings, Router, Transformer, Validator};
use crate::config::{PluginConfig, PluginKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

enum Pending {
    Validator(Box<dyn Validator>),
    Transformer(Box<dyn Transformer>),
    Router(Box<dyn Router>),
}

impl Pending {
    fn kind(&self) -> PluginKind {
        match self {
            Self::Validator(_) => PluginKind::Validator,
            Self::Transformer(_) => PluginKind::Transformer,
            Self::Router(_) => PluginKind::Router,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Validator(p) => p.name(),
            Self::Transformer(p) => p.name(),
            Self::Router(p) => p.name(),
        }
    }
}

/// Built-in implementations by kind and identifier.
fn instantiate(kind: PluginKind, implementation: &str, name: &str) -> Result<Pending, PluginError> {
    let pending = match (kind, implementation) {
        (PluginKind::Validator, "hl7.structure") => {
            Pending::Validator(Box::new(Hl7StructureValidator::new(name)))
        }
        (PluginKind::Validator, "fhir.resource") => {
            Pending::Validator(Box::new(FhirResourceValidator::new(name)))
        }
        (PluginKind::Transformer, "hl7.to_json") => {
            Pending::Transformer(Box::new(Hl7ToJson::new(name)))
        }
        (PluginKind::Transformer, "hl7.pid_to_fhir_patient") => {
            Pending::Transformer(Box::new(PidToFhirPatient::new(name)))
        }
        (PluginKind::Transformer, "hl7.extract_attachments") => {
            Pending::Transformer(Box::new(ExtractAttachments::new(name)))
        }
        (PluginKind::Transformer, "metadata.set") => {
            Pending::Transformer(Box::new(SetMetadata::new(name)))
        }
        (PluginKind::Router, "content_based") => {
            Pending::Router(Box::new(ContentBasedRouter::new(name)))
        }
        (PluginKind::Router, "recipient_list") => {
            Pending::Router(Box::new(RecipientListRouter::new(name)))
        }
        (PluginKind::Router, "dynamic") => Pending::Router(Box::new(DynamicRouter::new(name))),
        (PluginKind::Router, "filter") => Pending::Router(Box::new(FilterRouter::new(name))),
        _ => {
            return Err(PluginError::UnknownImplementation {
                kind,
                implementation: implementation.to_string(),
            })
        }
    };
    Ok(pending)
}

#[derive(Default)]
pub struct PluginRegistryBuilder {
    pending: Vec<(Pending, PluginSettings)>,
}

impl PluginRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve configured plugins against the built-in table.
    pub fn from_configs(configs: &[PluginConfig]) -> Result<Self, PluginError> {
        let mut builder = Self::new();
        for config in configs {
            let pending = instantiate(config.kind, &config.implementation, &config.name)?;
            builder.push(pending, config.config.clone())?;
        }
        Ok(builder)
    }

    fn push(&mut self, pending: Pending, settings: PluginSettings) -> Result<(), PluginError> {
        let duplicate = self
            .pending
            .iter()
            .any(|(p, _)| p.kind() == pending.kind() && p.name() == pending.name());
        if duplicate {
            return Err(PluginError::Duplicate {
                kind: pending.kind(),
                name: pending.name().to_string(),
            });
        }
        self.pending.push((pending, settings));
        Ok(())
    }

    pub fn validator(
        mut self,
        plugin: impl Validator + 'static,
        settings: PluginSettings,
    ) -> Result<Self, PluginError> {
        self.push(Pending::Validator(Box::new(plugin)), settings)?;
        Ok(self)
    }

    pub fn transformer(
        mut self,
        plugin: impl Transformer + 'static,
        settings: PluginSettings,
    ) -> Result<Self, PluginError> {
        self.push(Pending::Transformer(Box::new(plugin)), settings)?;
        Ok(self)
    }

    pub fn router(
        mut self,
        plugin: impl Router + 'static,
        settings: PluginSettings,
    ) -> Result<Self, PluginError> {
        self.push(Pending::Router(Box::new(plugin)), settings)?;
        Ok(self)
    }

    /// Merge another builder's registrations, e.g. programmatic plugins on
    /// top of configured ones.
    pub fn merge(mut self, other: PluginRegistryBuilder) -> Result<Self, PluginError> {
        for (pending, settings) in other.pending {
            self.push(pending, settings)?;
        }
        Ok(self)
    }

    /// Names of every registered plugin, for configuration validation.
    pub fn registered(&self) -> Vec<(PluginKind, String)> {
        self.pending
            .iter()
            .map(|(p, _)| (p.kind(), p.name().to_string()))
            .collect()
    }

    /// Initialize every plugin once, in registration order. The first
    /// failure shuts down the plugins already initialized and aborts.
    pub async fn initialize(self) -> Result<PluginRegistry, PluginError> {
        let mut registry = PluginRegistry::default();

        for (pending, settings) in self.pending {
            let kind = pending.kind();
            let name = pending.name().to_string();
            let result = match pending {
                Pending::Validator(mut plugin) => {
                    plugin.initialize(&settings).await.map(|_| {
                        registry.validators.insert(name.clone(), Arc::from(plugin));
                    })
                }
                Pending::Transformer(mut plugin) => {
                    plugin.initialize(&settings).await.map(|_| {
                        registry.transformers.insert(name.clone(), Arc::from(plugin));
                    })
                }
                Pending::Router(mut plugin) => plugin.initialize(&settings).await.map(|_| {
                    registry.routers.insert(name.clone(), Arc::from(plugin));
                }),
            };

            if let Err(err) = result {
                tracing::error!(plugin = %name, kind = %kind, error = %err, "Plugin initialization failed");
                registry.shutdown_all().await;
                return Err(err);
            }
            tracing::debug!(plugin = %name, kind = %kind, "Plugin initialized");
        }

        tracing::info!(
            validators = registry.validators.len(),
            transformers = registry.transformers.len(),
            routers = registry.routers.len(),
            "Plugins initialized"
        );
        Ok(registry)
    }
}

#[derive(Default)]
pub struct PluginRegistry {
    validators: HashMap<String, Arc<dyn Validator>>,
    transformers: HashMap<String, Arc<dyn Transformer>>,
    routers: HashMap<String, Arc<dyn Router>>,
    shut_down: AtomicBool,
}

impl PluginRegistry {
    pub fn validator(&self, name: &str) -> Result<Arc<dyn Validator>, PluginError> {
        self.validators
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::Missing {
                kind: PluginKind::Validator,
                name: name.to_string(),
            })
    }

    pub fn transformer(&self, name: &str) -> Result<Arc<dyn Transformer>, PluginError> {
        self.transformers
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::Missing {
                kind: PluginKind::Transformer,
                name: name.to_string(),
            })
    }

    pub fn router(&self, name: &str) -> Result<Arc<dyn Router>, PluginError> {
        self.routers
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::Missing {
                kind: PluginKind::Router,
                name: name.to_string(),
            })
    }

    /// Shut every plugin down. Only the first call has any effect; errors
    /// are logged and do not stop the remaining plugins.
    pub async fn shutdown_all(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let plugins = self
            .validators
            .values()
            .map(|p| p.shutdown())
            .chain(self.transformers.values().map(|p| p.shutdown()))
            .chain(self.routers.values().map(|p| p.shutdown()));

        for result in futures::future::join_all(plugins).await {
            if let Err(err) = result {
                tracing::warn!(error = %err, "Plugin shutdown failed");
            }
        }
        tracing::info!("Plugins shut down");
    }
}
