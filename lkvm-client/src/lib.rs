//! # lkvm client
//!
//! Lifecycle management for virtual machines run by the `lkvm` command line
//! tool (kvmtool).
//!
//! The tool is the source of truth: the client shells out to it, parses what
//! it prints, and keeps an in-memory registry reconciled with those
//! observations.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                Client                   │
//! │  (create, start, stop, pause, destroy)  │
//! └──────┬──────────────┬──────────────┬────┘
//!        │              │              │
//!        ▼              ▼              ▼
//! ┌─────────────┐ ┌────────────┐ ┌──────────────────┐
//! │  Instance   │ │   Output   │ │ ProcessInvoker   │
//! │  Registry   │ │   Parser   │ │ (System | Mock)  │
//! └─────────────┘ └────────────┘ └──────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lkvm_client::{Client, ClientConfig, InstanceSpec};
//!
//! #[tokio::main]
//! async fn main() -> lkvm_client::Result<()> {
//!     let client = Client::from_config(ClientConfig::default())?;
//!
//!     let spec = InstanceSpec::new("vm1", 512, 1).with_disk("/var/lib/lkvm/vm1.img");
//!     client.create(&spec).await?;
//!     client.pause("vm1").await?;
//!
//!     for instance in client.list_instances().await? {
//!         println!("{} {}", instance.name, instance.state);
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod mock;
pub mod parser;
pub mod process;
pub mod procinfo;
pub mod registry;
pub mod traits;
pub mod types;

pub use client::Client;
pub use config::{ClientConfig, ToolCommands};
pub use error::{ClientError, ParseError, ProcessError, Result, StateError};
pub use mock::MockTool;
pub use parser::{OutputSchema, TableVersion};
pub use process::SystemInvoker;
pub use registry::{InstanceRegistry, NameGuard, ReconcileDiff};
pub use traits::{Invocation, ProcessInvoker};
pub use types::*;
