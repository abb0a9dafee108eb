//! Dex Operator
//!
//! This operator provisions Dex identity-provider servers in Kubernetes from
//! `DexServer` custom resources: configuration, gRPC mTLS credentials,
//! services, RBAC, deployment and ingress.

pub mod adapters;
pub mod cluster;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;

pub use error::{Error, Result};
