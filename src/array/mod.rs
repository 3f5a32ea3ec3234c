//! SANtricity array data model and client abstraction.
//!
//! The controller service talks to the array exclusively through the
//! [`ArrayClient`] trait; [`rest::RestArrayClient`] is the production
//! implementation against the Web Services REST API. Tests substitute an
//! in-memory implementation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod rest;

pub use rest::RestArrayClient;

/// Errors surfaced by array operations.
///
/// `NotFound` is distinguished so callers can apply idempotency rules
/// (deleting an absent volume or mapping is treated as success at the RPC
/// layer). `Api` carries the HTTP status so duplicate-creation conflicts can
/// be recognized as "already satisfied".
#[derive(Debug, Error)]
pub enum ArrayError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("array API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl ArrayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ArrayError::NotFound(_))
    }

    /// True for duplicate-creation style conflicts. A concurrent caller got
    /// there first; the desired state already exists.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ArrayError::Api { status: 409 | 422, .. })
    }
}

pub type Result<T> = std::result::Result<T, ArrayError>;

/// A provisioned volume as reported by the array.
///
/// The array string-encodes capacities on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeEx {
    pub volume_ref: String,
    pub label: String,
    /// Size in bytes, string-encoded.
    #[serde(default)]
    pub capacity: String,
    pub volume_group_ref: String,
    #[serde(default)]
    pub world_wide_name: String,
    #[serde(default)]
    pub list_of_mappings: Vec<LunMapping>,
}

impl VolumeEx {
    /// Current size in bytes; 0 when the array returned no parsable capacity.
    pub fn capacity_bytes(&self) -> i64 {
        self.capacity.parse().unwrap_or(0)
    }
}

/// A LUN mapping binding a volume to a host or host group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LunMapping {
    pub lun_mapping_ref: String,
    pub lun: u32,
    /// Host or host-group ref the volume is mapped to.
    pub map_ref: String,
    #[serde(default)]
    pub volume_ref: String,
}

/// A storage pool (volume group or dynamic disk pool).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePool {
    pub volume_group_ref: String,
    pub label: String,
    /// Free capacity in bytes, string-encoded.
    #[serde(default)]
    pub free_space: String,
    #[serde(default)]
    pub drive_media_type: String,
    #[serde(default)]
    pub raid_level: String,
}

impl StoragePool {
    pub fn free_bytes(&self) -> u64 {
        self.free_space.parse().unwrap_or(0)
    }
}

/// Initiator identity attached to a host record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInitiator {
    #[serde(default)]
    pub node_name: InitiatorNodeName,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatorNodeName {
    #[serde(default)]
    pub io_interface_type: String,
    #[serde(default)]
    pub iscsi_node_name: String,
}

/// A host object representing one node's initiator identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub host_ref: String,
    pub label: String,
    /// Host group this host belongs to, empty when ungrouped.
    #[serde(default)]
    pub cluster_ref: String,
    #[serde(default)]
    pub initiators: Vec<HostInitiator>,
}

impl Host {
    /// True if any of this host's initiators carries the given iSCSI IQN.
    pub fn has_iqn(&self, iqn: &str) -> bool {
        self.initiators.iter().any(|i| {
            i.node_name.io_interface_type.eq_ignore_ascii_case("iscsi")
                && i.node_name.iscsi_node_name == iqn
        })
    }
}

/// iSCSI target identity configured on the array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IscsiTargetSettings {
    #[serde(default)]
    pub node_name: TargetNodeName,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetNodeName {
    #[serde(default)]
    pub iscsi_node_name: String,
}

/// Storage-system summary, including controller network addresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSystem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub controllers: Vec<ControllerInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInfo {
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}

/// Volume creation parameters. `metadata` is forwarded to the array as
/// volume meta tags (PVC name/namespace, PV name).
#[derive(Debug, Clone, Default)]
pub struct CreateVolumeParams {
    pub name: String,
    pub pool_ref: String,
    pub size_bytes: u64,
    pub raid_level: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Pool search criteria used when no explicit pool ID is given.
#[derive(Debug, Clone, Default)]
pub struct PoolCriteria {
    pub media_type: String,
    pub min_free_bytes: u64,
    pub name: Option<String>,
}

/// Typed operations against the storage array.
///
/// Every method re-reads or mutates array state; no implementation caches
/// authoritative state between calls. The array is the single source of
/// truth for volumes, hosts, and mappings.
#[async_trait::async_trait]
pub trait ArrayClient: Send + Sync {
    /// Fetch a volume with its current mappings.
    async fn get_volume(&self, volume_ref: &str) -> Result<VolumeEx>;

    async fn create_volume(&self, params: CreateVolumeParams) -> Result<VolumeEx>;

    async fn delete_volume(&self, volume_ref: &str) -> Result<()>;

    /// Grow a volume by `additional_bytes`. The array's expansion parameter
    /// is a relative increment, not an absolute target size.
    async fn expand_volume(&self, volume_ref: &str, additional_bytes: u64) -> Result<()>;

    async fn get_pool(&self, pool_ref: &str) -> Result<StoragePool>;

    /// List pools matching the criteria, in the array's returned order.
    async fn list_pools(&self, criteria: &PoolCriteria) -> Result<Vec<StoragePool>>;

    /// Look up the host carrying the given initiator IQN, if any.
    async fn get_host_by_iqn(&self, iqn: &str) -> Result<Option<Host>>;

    async fn create_host(&self, label: &str, iqn: &str) -> Result<Host>;

    /// Map a volume to a host or host group. `lun: None` requests an
    /// array-assigned LUN.
    async fn map_volume(
        &self,
        volume_ref: &str,
        target_ref: &str,
        lun: Option<u32>,
    ) -> Result<LunMapping>;

    async fn delete_mapping(&self, mapping_ref: &str) -> Result<()>;

    async fn target_settings(&self) -> Result<IscsiTargetSettings>;

    async fn storage_system(&self) -> Result<StorageSystem>;
}
