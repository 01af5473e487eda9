//! kubefirst installer library.
//!
//! Brings up a GitOps management cluster (cloud infrastructure, ArgoCD,
//! Vault, the gitops and metaphor repositories) and tears it down again.
//! Every step is guarded by a checkpoint in the configuration store, so an
//! interrupted run resumes where it stopped.
//!
//! # Example
//!
//! ```ignore
//! use k1_cli::orchestrator::{install_plan, InstallExecutor, Pipeline, PlanShape, Session};
//! use k1_cli::state::{InstallationState, K1Paths};
//! use k1_cli::store::ConfigStore;
//!
//! let mut store = ConfigStore::open("/home/me/.kubefirst")?;
//! let state = InstallationState::from_store(&mut store)?;
//! let shape = PlanShape { cloud: state.cloud, git: state.git };
//! let mut executor = InstallExecutor::new(Session::new(state, K1Paths::from_home()?, deps));
//! Pipeline::new("Installation", install_plan(shape))
//!     .run(&mut executor, &mut store)
//!     .await?;
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Allow async functions that don't use await (trait-shaped call sites)
#![allow(clippy::unused_async)]
// Allow imports after statements in functions
#![allow(clippy::items_after_statements)]

pub mod argocd;
pub mod commands;
pub mod dns;
pub mod error;
pub mod exec;
pub mod kube;
pub mod logging;
pub mod orchestrator;
pub mod ssh;
pub mod state;
pub mod store;
pub mod template;
pub mod terraform;
pub mod tools;
pub mod ui;
pub mod vault;

pub use error::InstallError;
pub use state::{InstallationState, K1Paths, RetryConfig};
pub use store::ConfigStore;
