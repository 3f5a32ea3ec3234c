//! CSI Controller Service Implementation
//!
//! Handles volume lifecycle and host mapping operations against the
//! SANtricity array.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::array::{ArrayClient, ArrayError, CreateVolumeParams, Host, PoolCriteria, StoragePool};
use crate::config::PortalStrategy;
use crate::csi;
use crate::metrics::OperationTimer;
use crate::types::{ISCSI_PORT, normalize_volume_name};

// StorageClass parameter keys
const PARAM_POOL_ID: &str = "poolID";
const PARAM_POOL_NAME: &str = "poolName";
const PARAM_MEDIA_TYPE: &str = "mediaType";
const PARAM_FS_TYPE: &str = "fsType";
const PARAM_RAID_LEVEL: &str = "raidLevel";

// Metadata keys injected by the external-provisioner sidecar
const META_PVC_NAME: &str = "csi.storage.k8s.io/pvc/name";
const META_PVC_NAMESPACE: &str = "csi.storage.k8s.io/pvc/namespace";
const META_PV_NAME: &str = "csi.storage.k8s.io/pv/name";

/// Default volume size: 1GiB
const DEFAULT_VOLUME_SIZE: i64 = 1024 * 1024 * 1024;

const DEFAULT_MEDIA_TYPE: &str = "hdd";
const DEFAULT_FS_TYPE: &str = "xfs";

/// Per-volume serialization for check-then-act flows (publish, unpublish,
/// expand). This only orders callers within this process; the array's own
/// uniqueness constraints remain the final arbiter across replicas.
struct VolumeLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VolumeLocks {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, volume_id: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().await;
            map.entry(volume_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}

/// CSI Controller Service
///
/// Implements the CSI Controller service which handles:
/// - Volume creation, deletion and expansion
/// - Volume publishing (host creation and LUN mapping)
/// - Capability reporting
pub struct ControllerService {
    /// Array client; absent when the driver runs without array access, in
    /// which case every array-touching RPC fails with FailedPrecondition.
    client: Option<Arc<dyn ArrayClient>>,
    portals: PortalStrategy,
    locks: VolumeLocks,
}

impl ControllerService {
    pub fn new(client: Option<Arc<dyn ArrayClient>>, portals: PortalStrategy) -> Self {
        Self {
            client,
            portals,
            locks: VolumeLocks::new(),
        }
    }

    fn client(&self) -> Result<&Arc<dyn ArrayClient>, Status> {
        self.client.as_ref().ok_or_else(|| {
            Status::failed_precondition("Array client is not configured on this driver instance")
        })
    }

    fn internal(operation: &str, err: ArrayError) -> Status {
        error!(error = %err, operation = %operation, "Array operation failed");
        Status::internal(format!("{operation}: {err}"))
    }

    /// Get required volume size from capacity range.
    fn get_volume_size(capacity_range: Option<&csi::CapacityRange>) -> i64 {
        capacity_range
            .map(|range| {
                if range.required_bytes > 0 {
                    range.required_bytes
                } else if range.limit_bytes > 0 {
                    range.limit_bytes
                } else {
                    DEFAULT_VOLUME_SIZE
                }
            })
            .unwrap_or(DEFAULT_VOLUME_SIZE)
    }

    /// Collect the PVC/PV metadata the provisioner sidecar attaches, for
    /// tagging the volume on the array.
    fn extract_metadata(parameters: &HashMap<String, String>) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        if let Some(v) = parameters.get(META_PVC_NAME) {
            metadata.insert("pvcName".to_string(), v.clone());
        }
        if let Some(v) = parameters.get(META_PVC_NAMESPACE) {
            metadata.insert("pvcNamespace".to_string(), v.clone());
        }
        if let Some(v) = parameters.get(META_PV_NAME) {
            metadata.insert("pvName".to_string(), v.clone());
        }
        metadata
    }

    /// Resolve the pool a new volume should land in.
    ///
    /// An explicit `poolID` is looked up directly and a miss is an error.
    /// Otherwise pools are searched by media type and free capacity, with an
    /// optional `poolName` filter, and the first match in array order wins.
    async fn select_pool(
        &self,
        parameters: &HashMap<String, String>,
        size_bytes: i64,
    ) -> Result<StoragePool, Status> {
        let client = self.client()?;

        if let Some(pool_id) = parameters.get(PARAM_POOL_ID) {
            return match client.get_pool(pool_id).await {
                Ok(pool) => Ok(pool),
                Err(e) if e.is_not_found() => Err(Status::not_found(format!(
                    "Storage pool {pool_id} not found"
                ))),
                Err(e) => Err(Self::internal("get storage pool", e)),
            };
        }

        let criteria = PoolCriteria {
            media_type: parameters
                .get(PARAM_MEDIA_TYPE)
                .cloned()
                .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string()),
            min_free_bytes: size_bytes.max(0) as u64,
            name: parameters.get(PARAM_POOL_NAME).cloned(),
        };

        let pools = client
            .list_pools(&criteria)
            .await
            .map_err(|e| Self::internal("list storage pools", e))?;

        pools.into_iter().next().ok_or_else(|| {
            Status::resource_exhausted(format!(
                "No storage pool with media type {} and {} bytes free",
                criteria.media_type, criteria.min_free_bytes
            ))
        })
    }

    /// Find or create the host object for a node's initiator IQN.
    ///
    /// Creation races with other replicas; a duplicate-create conflict means
    /// someone else won, so the lookup is retried.
    async fn ensure_host(&self, iqn: &str) -> Result<Host, Status> {
        let client = self.client()?;

        if let Some(host) = client
            .get_host_by_iqn(iqn)
            .await
            .map_err(|e| Self::internal("look up host", e))?
        {
            return Ok(host);
        }

        let label = normalize_volume_name(iqn);
        info!(iqn = %iqn, label = %label, "Creating host for initiator");
        match client.create_host(&label, iqn).await {
            Ok(host) => Ok(host),
            Err(e) if e.is_conflict() => client
                .get_host_by_iqn(iqn)
                .await
                .map_err(|e| Self::internal("look up host", e))?
                .ok_or_else(|| {
                    Status::internal(format!("Host for {iqn} exists on the array but has no match"))
                }),
            Err(e) => Err(Self::internal("create host", e)),
        }
    }

    /// Resolve the iSCSI data portal handed to nodes via PublishContext.
    async fn resolve_portal(&self) -> Result<String, Status> {
        match &self.portals {
            PortalStrategy::Explicit(endpoint) => Ok(endpoint.to_string()),
            PortalStrategy::ArrayInterfaces { fallback } => {
                let client = self.client()?;
                let system = client
                    .storage_system()
                    .await
                    .map_err(|e| Self::internal("get storage system", e))?;
                let address = system
                    .controllers
                    .iter()
                    .flat_map(|c| c.ip_addresses.iter())
                    .next();
                match address {
                    Some(ip) => Ok(format!("{ip}:{ISCSI_PORT}")),
                    None => {
                        warn!(fallback = %fallback, "Array lists no controller addresses, using fallback portal");
                        Ok(fallback.to_string())
                    }
                }
            }
        }
    }

    fn publish_context(
        lun: u32,
        target_iqn: String,
        portal: String,
        volume_id: &str,
    ) -> HashMap<String, String> {
        HashMap::from([
            ("lun".to_string(), lun.to_string()),
            ("targetIQN".to_string(), target_iqn),
            ("targetPortal".to_string(), portal),
            ("volumeID".to_string(), volume_id.to_string()),
        ])
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    /// Create a new volume.
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let timer = OperationTimer::new("create_volume");
        let req = request.into_inner();

        if req.name.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume name is required"));
        }

        let name = normalize_volume_name(&req.name);
        let size_bytes = Self::get_volume_size(req.capacity_range.as_ref());

        info!(name = %name, requested = %req.name, size_bytes = size_bytes, "CreateVolume request");

        let pool = match self.select_pool(&req.parameters, size_bytes).await {
            Ok(pool) => pool,
            Err(e) => {
                timer.failure(&e.code().to_string());
                return Err(e);
            }
        };

        // The node formats from the volume capability at stage time; the tag
        // records what the StorageClass asked for.
        let mut metadata = Self::extract_metadata(&req.parameters);
        let fs_type = req
            .parameters
            .get(PARAM_FS_TYPE)
            .cloned()
            .unwrap_or_else(|| DEFAULT_FS_TYPE.to_string());
        metadata.insert("fsType".to_string(), fs_type);

        let params = CreateVolumeParams {
            name,
            pool_ref: pool.volume_group_ref.clone(),
            size_bytes: size_bytes.max(0) as u64,
            raid_level: req.parameters.get(PARAM_RAID_LEVEL).cloned(),
            metadata,
        };

        let client = match self.client() {
            Ok(c) => c,
            Err(e) => {
                timer.failure(&e.code().to_string());
                return Err(e);
            }
        };

        let volume = match client.create_volume(params).await {
            Ok(v) => v,
            Err(e) => {
                let status = Self::internal("create volume", e);
                timer.failure(&status.code().to_string());
                return Err(status);
            }
        };

        info!(
            volume_id = %volume.volume_ref,
            label = %volume.label,
            pool = %pool.label,
            "Volume created successfully"
        );

        let volume_context = HashMap::from([
            ("poolID".to_string(), volume.volume_group_ref.clone()),
            ("label".to_string(), volume.label.clone()),
            ("wwn".to_string(), volume.world_wide_name.clone()),
        ]);

        timer.success();
        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(csi::Volume {
                capacity_bytes: size_bytes,
                volume_id: volume.volume_ref,
                volume_context,
            }),
        }))
    }

    /// Delete a volume. Deleting a volume the array no longer knows is a
    /// success.
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let timer = OperationTimer::new("delete_volume");
        let req = request.into_inner();
        let volume_id = &req.volume_id;

        if volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        info!(volume_id = %volume_id, "DeleteVolume request");

        let client = match self.client() {
            Ok(c) => c,
            Err(e) => {
                timer.failure(&e.code().to_string());
                return Err(e);
            }
        };

        match client.delete_volume(volume_id).await {
            Ok(()) => {
                info!(volume_id = %volume_id, "Volume deleted successfully");
            }
            Err(e) if e.is_not_found() => {
                warn!(volume_id = %volume_id, "Volume not found, treating as already deleted");
            }
            Err(e) => {
                let status = Self::internal("delete volume", e);
                timer.failure(&status.code().to_string());
                return Err(status);
            }
        }

        timer.success();
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    /// Map a volume to the requesting node's host and hand back the iSCSI
    /// coordinates the node needs to stage it.
    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("controller_publish_volume");
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.node_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Node ID is required"));
        }

        info!(volume_id = %req.volume_id, node_id = %req.node_id, "ControllerPublishVolume request");

        let result = self.publish_inner(&req.volume_id, &req.node_id).await;
        match result {
            Ok(publish_context) => {
                timer.success();
                Ok(Response::new(csi::ControllerPublishVolumeResponse {
                    publish_context,
                }))
            }
            Err(e) => {
                timer.failure(&e.code().to_string());
                Err(e)
            }
        }
    }

    /// Remove a volume's LUN mappings.
    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("controller_unpublish_volume");
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        info!(volume_id = %req.volume_id, node_id = %req.node_id, "ControllerUnpublishVolume request");

        let result = self.unpublish_inner(&req.volume_id, &req.node_id).await;
        match result {
            Ok(()) => {
                timer.success();
                Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
            }
            Err(e) => {
                timer.failure(&e.code().to_string());
                Err(e)
            }
        }
    }

    /// Expand a volume on the array.
    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let timer = OperationTimer::new("controller_expand_volume");
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        let required_bytes = match req.capacity_range.as_ref() {
            Some(range) if range.required_bytes > 0 => range.required_bytes,
            Some(range) if range.limit_bytes > 0 => range.limit_bytes,
            _ => {
                timer.failure("invalid_argument");
                return Err(Status::invalid_argument(
                    "Capacity range with positive required or limit bytes is required",
                ));
            }
        };

        info!(volume_id = %req.volume_id, required_bytes = required_bytes, "ControllerExpandVolume request");

        let result = self.expand_inner(&req.volume_id, required_bytes).await;
        match result {
            Ok(capacity_bytes) => {
                timer.success();
                Ok(Response::new(csi::ControllerExpandVolumeResponse {
                    capacity_bytes,
                    node_expansion_required: true,
                }))
            }
            Err(e) => {
                timer.failure(&e.code().to_string());
                Err(e)
            }
        }
    }

    /// Report the controller capabilities.
    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        let rpc_types = [
            csi::controller_service_capability::rpc::Type::CreateDeleteVolume,
            csi::controller_service_capability::rpc::Type::PublishUnpublishVolume,
            csi::controller_service_capability::rpc::Type::ExpandVolume,
        ];

        let capabilities = rpc_types
            .into_iter()
            .map(|t| csi::ControllerServiceCapability {
                r#type: Some(csi::controller_service_capability::Type::Rpc(
                    csi::controller_service_capability::Rpc { r#type: t as i32 },
                )),
            })
            .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn validate_volume_capabilities(
        &self,
        _request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        Err(Status::unimplemented(
            "ValidateVolumeCapabilities is not supported",
        ))
    }

    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        Err(Status::unimplemented("ListVolumes is not supported"))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        Err(Status::unimplemented("GetCapacity is not supported"))
    }

    async fn create_snapshot(
        &self,
        _request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("CreateSnapshot is not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("DeleteSnapshot is not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("ListSnapshots is not supported"))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerGetVolume is not supported"))
    }

    async fn controller_modify_volume(
        &self,
        _request: Request<csi::ControllerModifyVolumeRequest>,
    ) -> Result<Response<csi::ControllerModifyVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerModifyVolume is not supported",
        ))
    }
}

impl ControllerService {
    async fn publish_inner(
        &self,
        volume_id: &str,
        node_id: &str,
    ) -> Result<HashMap<String, String>, Status> {
        let client = self.client()?;
        let _guard = self.locks.lock(volume_id).await;

        let host = self.ensure_host(node_id).await?;

        let volume = match client.get_volume(volume_id).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => {
                return Err(Status::not_found(format!("Volume {volume_id} not found")));
            }
            Err(e) => return Err(Self::internal("get volume", e)),
        };

        // A volume already mapped to this host keeps its LUN.
        let lun = if let Some(mapping) = volume
            .list_of_mappings
            .iter()
            .find(|m| m.map_ref == host.host_ref)
        {
            debug!(volume_id = %volume_id, lun = mapping.lun, "Volume already mapped to host");
            mapping.lun
        } else {
            match client.map_volume(&volume.volume_ref, &host.host_ref, None).await {
                Ok(mapping) => {
                    info!(volume_id = %volume_id, host = %host.label, lun = mapping.lun, "Volume mapped to host");
                    mapping.lun
                }
                Err(e) if e.is_conflict() => {
                    // A concurrent publisher created the mapping first.
                    let volume = client
                        .get_volume(volume_id)
                        .await
                        .map_err(|e| Self::internal("get volume", e))?;
                    volume
                        .list_of_mappings
                        .iter()
                        .find(|m| m.map_ref == host.host_ref)
                        .map(|m| m.lun)
                        .ok_or_else(|| {
                            Status::internal(format!(
                                "Mapping conflict for volume {volume_id} but no mapping to host {} found",
                                host.label
                            ))
                        })?
                }
                Err(e) => return Err(Self::internal("map volume", e)),
            }
        };

        let target_iqn = client
            .target_settings()
            .await
            .map_err(|e| Self::internal("get target settings", e))?
            .node_name
            .iscsi_node_name;
        if target_iqn.is_empty() {
            return Err(Status::internal("Array reports no iSCSI target IQN"));
        }

        let portal = self.resolve_portal().await?;

        Ok(Self::publish_context(lun, target_iqn, portal, volume_id))
    }

    async fn unpublish_inner(&self, volume_id: &str, node_id: &str) -> Result<(), Status> {
        let client = self.client()?;
        let _guard = self.locks.lock(volume_id).await;

        let volume = match client.get_volume(volume_id).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => {
                warn!(volume_id = %volume_id, "Volume not found, treating as already unpublished");
                return Ok(());
            }
            Err(e) => return Err(Self::internal("get volume", e)),
        };

        // Without a node ID the orchestrator wants the volume unmapped
        // everywhere.
        let mappings: Vec<_> = if node_id.is_empty() {
            volume.list_of_mappings
        } else {
            match client
                .get_host_by_iqn(node_id)
                .await
                .map_err(|e| Self::internal("look up host", e))?
            {
                Some(host) => volume
                    .list_of_mappings
                    .into_iter()
                    .filter(|m| m.map_ref == host.host_ref)
                    .collect(),
                None => {
                    warn!(node_id = %node_id, "Host not found, nothing to unpublish");
                    return Ok(());
                }
            }
        };

        for mapping in mappings {
            match client.delete_mapping(&mapping.lun_mapping_ref).await {
                Ok(()) => {
                    info!(volume_id = %volume_id, lun = mapping.lun, "Mapping removed");
                }
                Err(e) if e.is_not_found() => {
                    debug!(volume_id = %volume_id, "Mapping already removed");
                }
                Err(e) => return Err(Self::internal("delete mapping", e)),
            }
        }

        Ok(())
    }

    async fn expand_inner(&self, volume_id: &str, required_bytes: i64) -> Result<i64, Status> {
        let client = self.client()?;
        let _guard = self.locks.lock(volume_id).await;

        let volume = match client.get_volume(volume_id).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => {
                return Err(Status::not_found(format!("Volume {volume_id} not found")));
            }
            Err(e) => return Err(Self::internal("get volume", e)),
        };

        let current_bytes = volume.capacity_bytes();
        if required_bytes <= current_bytes {
            info!(
                volume_id = %volume_id,
                current_bytes = current_bytes,
                required_bytes = required_bytes,
                "Volume already at or above requested size"
            );
            return Ok(current_bytes);
        }

        // The array grows volumes by a relative increment.
        let additional = (required_bytes - current_bytes) as u64;
        client
            .expand_volume(&volume.volume_ref, additional)
            .await
            .map_err(|e| Self::internal("expand volume", e))?;

        info!(
            volume_id = %volume_id,
            additional_bytes = additional,
            new_size_bytes = required_bytes,
            "Volume expansion submitted"
        );

        Ok(required_bytes)
    }
}
