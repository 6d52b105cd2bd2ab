//! Controller module for Vault configuration resources
//!
//! Contains the generic reconciler, the token cache, the work queue and the
//! Kubernetes runtime glue that feeds them.

pub mod auth;
pub mod backoff;
pub mod conditions;
pub mod finalizers;
pub mod identity;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod object;
pub mod queue;
mod reconciler;
mod runtime;

pub use auth::{AuthManager, TokenCacheKey};
pub use backoff::BackoffPolicy;
pub use finalizers::{KubeStatusSink, VAULT_CLEANUP_FINALIZER};
pub use identity::{IdentityTokenSource, KubeTokenRequest};
pub use object::{ConditionsAware, ManagedObject, ObjectKey, RemoteObject, StatusSink};
pub use queue::{GenerationLedger, WorkQueue};
pub use reconciler::{CycleOutcome, Phase, Reconciler, ReconcilerSettings};
pub use runtime::{run_controller, ControllerSettings, ControllerState};
