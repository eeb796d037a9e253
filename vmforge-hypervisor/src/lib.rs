//! # vmforge Hypervisor
//!
//! Provider-agnostic virtual machine lifecycle.
//!
//! Every backend implements the [`VirtualMachine`] trait on a per-VM handle:
//! - **vSphere** - template upload, clone pipeline, guest power operations
//! - **Cloud deployment** - static Linux deployment document and parameters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         VirtualMachine Trait            │
//! │ (provision, start, halt, destroy, ...)  │
//! └─────────────────────┬───────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │    VsphereVm      │     │  arm documents    │
//! │ (via VimClient)   │     │ (template+params) │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vmforge_hypervisor::{Session, VirtualMachine, VmSpec, VsphereVm};
//! use vmforge_hypervisor::vsphere::{mock::MockVimClient, VimClient};
//!
//! #[tokio::main]
//! async fn main() {
//!     let spec = VmSpec::load("vm.yaml").unwrap();
//!     let client: Arc<dyn VimClient> = Arc::new(MockVimClient::new());
//!     let session = Session::connect(&spec.connection, |_, _| Ok(client)).unwrap();
//!
//!     let mut vm = VsphereVm::new(session, spec);
//!     vm.provision().await.unwrap();
//!     println!("{:?}", vm.ips().await.unwrap());
//! }
//! ```

pub mod arm;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;
pub mod vsphere;

pub use config::{ConnectionConfig, Timeouts, VmSpec};
pub use error::{HypervisorError, Result};
pub use traits::{ProviderCapabilities, VirtualMachine};
pub use types::*;
pub use vsphere::{SearchFilter, Session, VsphereVm};
