//! Process configuration.
//!
//! Everything is resolved once at startup (flags, environment, locally read
//! initiator identity) and passed into constructors as plain values. No
//! component reads the environment after this point.

use std::time::Duration;

use crate::types::Endpoint;

/// How the controller picks the iSCSI data portal handed to nodes.
#[derive(Debug, Clone)]
pub enum PortalStrategy {
    /// Operator-supplied data-network portal.
    Explicit(Endpoint),
    /// First address of the first controller reported by the array, falling
    /// back to `fallback` when the array lists none.
    ArrayInterfaces { fallback: Endpoint },
}

/// Connection settings for the SANtricity Web Services API.
#[derive(Debug, Clone)]
pub struct ArrayConfig {
    pub api_url: String,
    pub username: String,
    pub password: String,
    /// Storage-system identifier within Web Services ("1" for embedded).
    pub array_id: String,
    /// Host-type index assigned to hosts the driver creates.
    pub host_type_index: u32,
    pub verify_tls: bool,
    pub timeout: Duration,
}

/// Fully resolved driver configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// CSI endpoint URI (`unix://...` or `tcp://host:port`).
    pub endpoint: String,
    /// Node identity reported to the orchestrator. When the node service is
    /// enabled this is the locally read initiator IQN where available.
    pub node_id: String,
    pub controller: bool,
    pub node: bool,
    /// Absent when running node-only without array access.
    pub array: Option<ArrayConfig>,
    pub portals: PortalStrategy,
}
