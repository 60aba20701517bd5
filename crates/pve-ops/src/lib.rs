//! Proxmox VM provisioning for the hosting platform.
//!
//! This crate turns an operator request into a running, cloud-init
//! configured VM on the local Proxmox host, and applies post-provision role
//! profiles (`app`, `bastion`) to running VMs over SSH.
//!
//! # Example
//!
//! ```rust,ignore
//! use pve_ops::{params, PlatformConfig, Provisioner, QmCli, TemplateEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PlatformConfig::load(None)?;
//!     let request = params::resolve(&raw_args, &config)?;
//!
//!     let hypervisor = QmCli::default();
//!     let engine = TemplateEngine::new()?;
//!     let outcome = Provisioner::new(&hypervisor, &config, &engine)
//!         .provision(&request)
//!         .await?;
//!
//!     println!("{}", outcome.connection);
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod builder;
pub mod cloudinit;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod image;
pub mod lifecycle;
pub mod params;
pub mod provision;
pub mod proxy;
pub mod remote;
pub mod role;
pub mod templates;
pub mod ui;

pub use config::PlatformConfig;
pub use error::{ProvisionError, Result};
pub use hypervisor::{Hypervisor, QmCli, StorageKind};
pub use params::{ProvisionRequest, RawProvisionArgs};
pub use provision::{ProvisionOutcome, Provisioner};
pub use proxy::ProxySite;
pub use remote::{RemoteExecutor, SshSession};
pub use role::{RolePlan, RoleProfile};
pub use templates::TemplateEngine;
