//! Fleet Bootstrap - layered deployment configuration resolver
//!
//! This crate resolves layered deployment configuration (property files
//! plus JSON document layers) for a fleet of application instances and
//! renders runnable artifacts: configuration trees, launch scripts, and
//! process-launch argument vectors.

pub mod builder;
pub mod deployment;
pub mod document;
pub mod location;
pub mod manifest;
pub mod properties;
pub mod runner;

pub use builder::{CommandBuilder, ContainerCommandBuilder, PlatformCommandBuilder};
pub use deployment::{Deployment, DeploymentError, Identity};
pub use document::{ConfigDocument, ConfigKind};
pub use location::Location;
pub use properties::{PropertyStore, SavePolicy};
pub use runner::{DeploymentRunner, Settings};
