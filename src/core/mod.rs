//! Core firewall compilation and apply functionality
//!
//! This module turns a declarative [`model::RuleSet`] into native firewall
//! configuration and applies it transactionally. It provides:
//!
//! - [`model`]: Data structures for rules, policies, services and groups
//! - [`validate`]: Structured findings for a ruleset before compilation
//! - [`plan`]: Backend-neutral compiled form and first-match evaluation
//! - [`guard`]: Management (SSH) lock-out prevention
//! - [`render`]: nftables, iptables, firewalld and ufw renderers
//! - [`backend`]: Live backend capability interface and native backends
//! - [`backup`]: Checksummed snapshots of live backend state
//! - [`engine`]: The apply state machine with verification and rollback
//! - [`exec`]: Bounded execution of native firewall tools
//! - [`error`]: Error types for firewall operations

pub mod backend;
pub mod backup;
pub mod engine;
pub mod error;
pub mod exec;
pub mod guard;
pub mod model;
pub mod plan;
pub mod render;
pub mod validate;

#[cfg(test)]
pub mod test_helpers;
