//! Cumulus - lifecycle controller for ad-hoc compute clusters
//!
//! Cumulus brings a cluster of cloud instances from a validated configuration
//! to a running, reachable state and back down again. Every provider
//! interaction goes through an abstract gateway, so the controller logic runs
//! unchanged against a real cloud or the in-memory simulated provider.
//!
//! # Lifecycle
//!
//! - validate the configuration against the schema and live provider lookups
//! - launch one master and a batch of workers into the cluster's security group
//! - poll until every node is visible and accepts connections
//! - attach the durable volume to the master
//! - on stop, detach the volume and terminate the nodes
//!
//! # Modules
//!
//! - [`config`] - Cluster settings, settings schema and the YAML settings file
//! - [`catalog`] - Instance types, supported shells and group naming
//! - [`provider`] - Provider gateway abstraction and the simulated provider
//! - [`validate`] - Configuration validation
//! - [`cluster`] - Launch, readiness, volume, teardown and the controller
//! - [`wait`] - Cancellable polling helpers
//! - [`telemetry`] - Logging initialization
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod catalog;
pub mod cluster;
pub mod config;
pub mod error;
pub mod provider;
pub mod telemetry;
pub mod validate;
pub mod wait;

pub use cluster::{ClusterController, ControllerOptions, StartOptions, StartReport};
pub use config::{ClusterConfig, ConfigFile};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable naming the settings file when `--config` is not given
pub const CONFIG_PATH_ENV: &str = "CUMULUS_CONFIG";

/// Settings file looked up in the home directory by default
pub const DEFAULT_CONFIG_FILE: &str = ".cumulus/config.yaml";
