//! The workload reconciliation loop.

mod gc;
mod reconciler;
mod status;

use error_stack::Report;

use crate::infrastructure::store::StoreError;
use crate::provision::ProvisionError;

pub use gc::Collection;
pub use gc::GarbageCollector;
pub use reconciler::error_policy;
pub use reconciler::reconcile;
pub use reconciler::run;
pub use reconciler::Context;
pub use status::StatusError;
pub use status::StatusReconciler;

/// Error type handed back to the controller runtime; its error policy
/// schedules the retry.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{0}")]
    Provision(Report<ProvisionError>),
    #[error("{0}")]
    Status(Report<StatusError>),
    #[error("store request failed: {0}")]
    Store(#[from] StoreError),
}

impl From<Report<ProvisionError>> for ReconcileError {
    fn from(report: Report<ProvisionError>) -> Self {
        ReconcileError::Provision(report)
    }
}

impl From<Report<StatusError>> for ReconcileError {
    fn from(report: Report<StatusError>) -> Self {
        ReconcileError::Status(report)
    }
}

impl ReconcileError {
    /// Permanent failures stop requeueing entirely; the operator would loop
    /// forever on an unsatisfiable request otherwise.
    pub fn is_permanent(&self) -> bool {
        match self {
            ReconcileError::Provision(report) => crate::provision::is_permanent(report),
            _ => false,
        }
    }
}
