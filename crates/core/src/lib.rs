//! Core domain models and contracts for plughost
//!
//! This crate contains the domain layer of the plugin host:
//! - PluginPackage, InstalledPlugin, PluginInstallRecord, PluginInstallAudit
//! - Contracts: PluginStore, LoadStatusReporter, UsageReporter
//! - MemoryControlPlane reference implementation

pub mod contracts;
pub mod domain;
pub mod memory;

pub use contracts::*;
pub use domain::*;
pub use memory::MemoryControlPlane;

/// Re-export common types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
