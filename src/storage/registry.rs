use std::{fmt, sync::Arc};

use super::{open, DynBackend};
use crate::{
    config::{BackendDescriptor, StorageConfig},
    error::{ConfigError, StorageError},
    limits::UploadLimits,
};

struct Entry {
    descriptor: BackendDescriptor,
    backend: DynBackend,
}

/// Opened backends, addressable by name.
///
/// Built once from a [`StorageConfig`] and shared read-only afterwards.
pub struct Backends {
    entries: Vec<Entry>,
    default: usize,
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends")
            .field("names", &self.names().collect::<Vec<_>>())
            .field("default", &self.default_name())
            .finish()
    }
}

impl Backends {
    /// Validates `config` and opens every active backend.
    pub async fn from_config(config: &StorageConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut entries = Vec::new();
        for descriptor in config.active() {
            let backend = open(descriptor).await?;
            entries.push(Entry {
                descriptor: descriptor.clone(),
                backend,
            });
        }

        let default = entries
            .iter()
            .position(|entry| entry.descriptor.default)
            .unwrap_or(0);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            backends = entries.len(),
            default = entries[default].descriptor.name.as_str(),
            "registry: backends opened"
        );

        Ok(Self { entries, default })
    }

    /// Builds a registry around one already opened backend.
    pub fn single(descriptor: BackendDescriptor, backend: DynBackend) -> Self {
        Self {
            entries: vec![Entry {
                descriptor,
                backend,
            }],
            default: 0,
        }
    }

    /// Returns the backend named `name`.
    pub fn get(&self, name: &str) -> Option<DynBackend> {
        self.entry(name).map(|entry| Arc::clone(&entry.backend))
    }

    /// Returns the descriptor the backend `name` was opened from.
    pub fn descriptor(&self, name: &str) -> Option<&BackendDescriptor> {
        self.entry(name).map(|entry| &entry.descriptor)
    }

    /// Returns the default backend.
    pub fn default_backend(&self) -> DynBackend {
        Arc::clone(&self.entries[self.default].backend)
    }

    /// Returns the default backend's name.
    pub fn default_name(&self) -> &str {
        &self.entries[self.default].descriptor.name
    }

    /// Iterates backend names in configuration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.descriptor.name.as_str())
    }

    /// Returns the upload limits declared on the backend descriptor.
    pub fn limits(&self, name: &str) -> Option<UploadLimits> {
        self.descriptor(name).map(|descriptor| UploadLimits {
            max_file_size: descriptor.max_file_size,
            allowed_extensions: descriptor.allowed_extensions.clone(),
        })
    }

    /// Runs every backend's health check.
    pub async fn health(&self) -> Vec<(String, Result<(), StorageError>)> {
        let mut report = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let result = entry.backend.health_check().await;

            #[cfg(feature = "tracing")]
            if let Err(err) = &result {
                tracing::warn!(
                    backend = entry.descriptor.name.as_str(),
                    error = %err,
                    "registry: health check failed"
                );
            }

            report.push((entry.descriptor.name.clone(), result));
        }
        report
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|entry| entry.descriptor.name == name)
    }
}
