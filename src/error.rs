//! Error types for cluster lifecycle operations
//!
//! Errors carry the cluster tag and the resource or setting involved so that
//! every failure is actionable without reading logs.

use std::path::PathBuf;

use thiserror::Error;

use crate::provider::ProviderError;
use crate::validate::ValidationFailure;

/// Main error type for cluster operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The cluster configuration failed validation
    ///
    /// Raised before any mutating provider call is issued. Never retried.
    #[error("invalid configuration for cluster {cluster}: {}", render_failures(.failures))]
    Configuration {
        /// Tag of the cluster being validated
        cluster: String,
        /// Every check that failed, in check order
        failures: Vec<ValidationFailure>,
    },

    /// A provider call failed
    #[error("provider error during {operation} for cluster {cluster}: {source}")]
    Provider {
        /// Tag of the cluster the call was made for
        cluster: String,
        /// Operation that issued the call (e.g., "launch master")
        operation: String,
        /// The tagged provider failure
        #[source]
        source: ProviderError,
    },

    /// The durable volume could not be attached to the master node
    #[error("volume {volume} attachment failed: {message}")]
    VolumeAttachment {
        /// Volume id
        volume: String,
        /// What went wrong
        message: String,
    },

    /// The durable volume could not be detached during teardown
    #[error("volume {volume} detach failed: {message}")]
    VolumeDetach {
        /// Volume id
        volume: String,
        /// What went wrong
        message: String,
    },

    /// A wait was cancelled by the caller
    #[error("cancelled while waiting for {0}")]
    Cancelled(String),

    /// The requested node does not exist in the cluster
    #[error("cluster {cluster} has no node at index {index} ({available} active)")]
    NodeNotFound {
        /// Tag of the cluster
        cluster: String,
        /// Requested index
        index: usize,
        /// Number of active nodes
        available: usize,
    },

    /// The settings file could not be loaded or lacks a template
    #[error("config file {}: {message}", .path.display())]
    ConfigFile {
        /// Path of the settings file
        path: PathBuf,
        /// What went wrong
        message: String,
    },

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a provider error with the operation that issued the call
    pub fn provider(
        cluster: impl Into<String>,
        operation: impl Into<String>,
        source: ProviderError,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Create a configuration error from accumulated validation failures
    pub fn configuration(cluster: impl Into<String>, failures: Vec<ValidationFailure>) -> Self {
        Self::Configuration {
            cluster: cluster.into(),
            failures,
        }
    }

    /// Create a volume attachment error
    pub fn volume_attachment(volume: impl Into<String>, message: impl Into<String>) -> Self {
        Self::VolumeAttachment {
            volume: volume.into(),
            message: message.into(),
        }
    }

    /// Create a volume detach error
    pub fn volume_detach(volume: impl Into<String>, message: impl Into<String>) -> Self {
        Self::VolumeDetach {
            volume: volume.into(),
            message: message.into(),
        }
    }

    /// Create a cancellation error naming the interrupted wait
    pub fn cancelled(what: impl Into<String>) -> Self {
        Self::Cancelled(what.into())
    }

    /// Create a config file error
    pub fn config_file(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigFile {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether repeating the operation may succeed without user action
    ///
    /// Only transient provider failures qualify; configuration problems need
    /// the settings fixed first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

fn render_failures(failures: &[ValidationFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
