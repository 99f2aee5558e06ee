//! hostwall - host firewall compiler
//!
//! Compiles one declarative ruleset into nftables, iptables, firewalld or ufw
//! configuration and applies it atomically, with verification and automatic
//! rollback to a pre-apply snapshot.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, validation, rendering, backends and the apply engine
//! - [`audit`] - Audit log of every privileged operation
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Engine configuration persistence
//! - [`elevation`] - Privilege escalation for native tools
//! - [`utils`] - Utility functions (XDG directories, atomic writes)
//!
//! # Safety Features
//!
//! - SSH guard keeps the management port reachable under restrictive policies
//! - Pre-apply snapshot of the live backend state, SHA-256 checksummed
//! - Native dry run (`nft --check`, `iptables-restore --test`)
//! - Post-apply read-back verification with rollback on mismatch
//! - Exclusive apply lock, transaction timeout and cancellation
//! - Atomic file operations with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use crate::core::backend::Backend;
pub use crate::core::backup::{BackupStore, Snapshot, SnapshotId};
pub use crate::core::engine::{
    ApplyContext, ApplyEngine, ApplyLock, ApplyMode, ApplyOptions, ApplyReport, ApplyState,
    CancelToken,
};
pub use crate::core::error::{Error, Result};
pub use crate::core::model::{Action, Chain, Family, Protocol, Rule, RuleSet};
pub use crate::core::render::{BackendKind, CompiledArtifact, Document, Renderer};
