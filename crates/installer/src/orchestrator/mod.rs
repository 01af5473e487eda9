//! Install and destroy orchestration.
//!
//! - [`plan`] builds the ordered step list for an installation shape
//! - [`pipeline`] runs a plan, skipping steps whose checkpoint is recorded
//! - [`session`] holds the per-run context (clients, tunnels, tool paths)
//! - [`install`] and [`destroy`] implement the steps

pub mod destroy;
pub mod install;
pub mod pipeline;
pub mod plan;
pub mod session;

pub use destroy::DestroyExecutor;
pub use install::InstallExecutor;
pub use pipeline::{Pipeline, RunReport, StepExecutor};
pub use plan::{destroy_plan, install_plan, DestroyOptions, PlanShape, Step, StepId, StepKind};
pub use session::{Collaborators, Session};
