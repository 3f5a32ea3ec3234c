//! SANtricity CSI Driver Library
//!
//! Kubernetes CSI driver that implements the Container Storage Interface
//! and provisions iSCSI volumes on NetApp E-Series / SANtricity arrays.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - A typed client for the SANtricity Web Services REST API
//! - iSCSI initiator and mount/format helpers for the node side

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod array;
pub mod config;
pub mod controller;
pub mod driver;
pub mod identity;
pub mod iscsi;
pub mod metrics;
pub mod node;
pub mod platform;
pub mod types;

pub use array::{ArrayClient, RestArrayClient};
pub use config::{ArrayConfig, Config, PortalStrategy};
pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::NodeService;
