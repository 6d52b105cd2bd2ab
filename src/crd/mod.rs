//! Custom Resource Definitions for the Vault config operator
//!
//! Every kind declares a piece of Vault configuration and implements
//! [`crate::controller::RemoteObject`], so one reconciler manages them all.

mod database_role;
mod database_static_role;
mod kubernetes_auth_role;
pub mod types;

#[cfg(test)]
mod tests;

pub use database_role::{DatabaseSecretEngineRole, DatabaseSecretEngineRoleSpec};
pub use database_static_role::{
    DatabaseSecretEngineStaticRole, DatabaseSecretEngineStaticRoleSpec, MIN_ROTATION_PERIOD_SECS,
};
pub use kubernetes_auth_role::{KubernetesAuthEngineRole, KubernetesAuthEngineRoleSpec};
pub use types::*;
