//! `virtscope` provisions ephemeral hypervisor domains from XML templates and guarantees their
//! teardown.
//!
//! # Overview
//!
//! A domain is rendered from a template, created on the hypervisor, waited on until it reports
//! active, handed to the caller, and removed again however the caller's work ends. It handles:
//! - template rendering with `$KEY` placeholders
//! - idempotent, name-addressed domain creation and deletion
//! - snapshot creation, listing and revert
//! - lifecycle scopes with cleanup on success, error, panic and cancellation
//! - fetching and converting disk images
//!
//! # Lifecycle Scopes
//!
//! | Strategy             | Provision                         | Cleanup                      |
//! |----------------------|-----------------------------------|------------------------------|
//! | `CreateOnly`         | transient create (running)        | stop and delete              |
//! | `DefineOnly`         | define (stopped)                  | delete                       |
//! | `DefineWithSnapshot` | define, then snapshot `main`      | revert to snapshot, delete   |
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use virtscope::{config::ManagerConfig, lifecycle::{ScopeKind, ScopeOptions}, manager::VmManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ManagerConfig::builder()
//!         .image_path("images/disk.qcow2")
//!         .build();
//!
//!     let manager = VmManager::open(config)?;
//!     manager
//!         .with_scope(ScopeKind::Create, ScopeOptions::default(), |domain| async move {
//!             println!("{} active: {}", domain.name(), domain.is_active()?);
//!             Ok::<_, virtscope::VirtscopeError>(())
//!         })
//!         .await?;
//!
//!     manager.close()?;
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - `libvirt` - Enables the libvirt backend for `qemu:///system` style URIs. Without it only
//!   `memory:///` sessions can be opened.
//!
//! # Modules
//!
//! - [`cli`] - Command-line interface and argument parsing
//! - [`config`] - Manager configuration and defaults
//! - [`hypervisor`] - Hypervisor session trait and backends
//! - [`image`] - Disk image fetching and conversion
//! - [`lifecycle`] - Lifecycle strategies and scopes
//! - [`manager`] - The `VmManager` entry point
//! - [`repository`] - Domain and snapshot repositories
//! - [`template`] - Template rendering
//! - [`utils`] - Common utilities and helpers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod config;
pub mod hypervisor;
pub mod image;
pub mod lifecycle;
pub mod manager;
pub mod repository;
pub mod template;
pub mod utils;

pub use error::*;
