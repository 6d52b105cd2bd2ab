//! Vault Config Operator: declarative HashiCorp Vault configuration for Kubernetes
//!
//! This crate provides a Kubernetes operator that keeps Vault objects such as
//! database roles and Kubernetes auth roles in sync with custom resources.

pub mod controller;
pub mod crd;
pub mod error;
pub mod vault;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
