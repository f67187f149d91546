//! weka-reconcile: declarative reconciliation of Weka cluster entities.
//!
//! Users, KMS configuration, filesystems, filesystem groups, S3 buckets, S3
//! access policies and user-policy bindings are converged against the Weka
//! management REST API. The [`driver::Driver`] is the entry point; the
//! [`host`] module is a small file-backed host built on it.

pub mod apply;
pub mod config;
pub mod driver;
pub mod error;
pub mod host;
pub mod policy;
pub mod reconciler;
pub mod session;
pub mod state;
pub mod transport;

#[cfg(test)]
mod test_util;

pub use config::ProviderConfig;
pub use driver::Driver;
pub use error::{ReconcileError, Result, UpdateFailure};
pub use policy::{ChangePlan, EntityKind};
pub use session::Session;
pub use state::{DeclaredState, Resource};
