//! CSI Node Service Implementation
//!
//! Handles per-node volume operations: iSCSI session establishment, device
//! staging (format + mount), bind-mount publishing, and filesystem growth.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::csi;
use crate::iscsi::IscsiInitiator;
use crate::platform;

/// How long to wait for the kernel to surface a freshly logged-in LUN.
const DEVICE_WAIT_ATTEMPTS: u32 = 10;
const DEVICE_WAIT_INTERVAL: Duration = Duration::from_millis(500);

/// CSI Node Service
///
/// Operations are keyed on the PublishContext produced by the controller:
/// `lun`, `targetIQN`, `targetPortal` and `volumeID`.
pub struct NodeService {
    node_id: String,
    initiator: Arc<dyn IscsiInitiator>,
}

/// Validated iSCSI coordinates extracted from a PublishContext.
#[derive(Debug)]
struct StagingTarget {
    lun: u32,
    target_iqn: String,
    portal: String,
}

impl NodeService {
    pub fn new(node_id: String, initiator: Arc<dyn IscsiInitiator>) -> Self {
        Self { node_id, initiator }
    }

    /// Validate a path parameter for safe usage in commands.
    fn validate_path(path: &str) -> Result<(), Status> {
        if path.is_empty() {
            return Err(Status::invalid_argument("Path cannot be empty"));
        }

        if !path.starts_with('/') {
            return Err(Status::invalid_argument("Path must be absolute"));
        }

        // Disallow dangerous characters that could enable shell injection
        let dangerous_chars = [
            ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
        ];
        for c in dangerous_chars {
            if path.contains(c) {
                return Err(Status::invalid_argument(format!(
                    "Path contains dangerous character: '{}'",
                    c
                )));
            }
        }

        // Disallow path traversal
        if path.contains("..") {
            return Err(Status::invalid_argument(
                "Path cannot contain '..' (path traversal)",
            ));
        }

        Ok(())
    }

    /// Validate an IQN or portal parameter for safe usage in commands.
    fn validate_iscsi_name(name: &str) -> Result<(), Status> {
        if name.is_empty() {
            return Err(Status::invalid_argument("iSCSI name cannot be empty"));
        }

        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-' | '_' | '[' | ']'));

        if !valid {
            return Err(Status::invalid_argument(
                "iSCSI name contains invalid characters",
            ));
        }

        Ok(())
    }

    /// Extract and validate the iSCSI coordinates from a PublishContext.
    fn staging_target(publish_context: &std::collections::HashMap<String, String>)
    -> Result<StagingTarget, Status> {
        let lun = publish_context
            .get("lun")
            .ok_or_else(|| Status::invalid_argument("Publish context is missing 'lun'"))?
            .parse::<u32>()
            .map_err(|_| Status::invalid_argument("Publish context 'lun' is not a number"))?;

        let target_iqn = publish_context
            .get("targetIQN")
            .ok_or_else(|| Status::invalid_argument("Publish context is missing 'targetIQN'"))?
            .clone();
        Self::validate_iscsi_name(&target_iqn)?;

        let portal = publish_context
            .get("targetPortal")
            .ok_or_else(|| Status::invalid_argument("Publish context is missing 'targetPortal'"))?
            .clone();
        Self::validate_iscsi_name(&portal)?;

        Ok(StagingTarget {
            lun,
            target_iqn,
            portal,
        })
    }

    /// Stable udev path for a LUN behind an iSCSI session.
    fn device_by_path(target: &StagingTarget) -> String {
        format!(
            "/dev/disk/by-path/ip-{}-iscsi-{}-lun-{}",
            target.portal, target.target_iqn, target.lun
        )
    }

    /// Wait for the by-path link to appear and resolve it to the real block
    /// device node. Sleeps on the runtime timer so other RPCs keep running
    /// while the kernel settles.
    async fn wait_for_device(by_path: &str) -> Result<String, Status> {
        for attempt in 0..DEVICE_WAIT_ATTEMPTS {
            match fs::canonicalize(by_path) {
                Ok(device) => return Ok(device.to_string_lossy().to_string()),
                Err(_) if attempt + 1 < DEVICE_WAIT_ATTEMPTS => {
                    debug!(device = %by_path, attempt = attempt, "Waiting for device to appear");
                    tokio::time::sleep(DEVICE_WAIT_INTERVAL).await;
                }
                Err(e) => {
                    error!(device = %by_path, error = %e, "Device never appeared");
                }
            }
        }
        Err(Status::internal(format!(
            "Device {by_path} did not appear after iSCSI login"
        )))
    }

    /// Requested filesystem from the volume capability, defaulting when the
    /// capability names none.
    fn fs_type_from_capability(capability: Option<&csi::VolumeCapability>) -> Result<&'static str, Status> {
        let requested = match capability.and_then(|c| c.access_type.as_ref()) {
            Some(csi::volume_capability::AccessType::Mount(m)) => m.fs_type.as_str(),
            Some(csi::volume_capability::AccessType::Block(_)) => {
                return Err(Status::invalid_argument(
                    "Raw block volumes are not supported",
                ));
            }
            None => "",
        };
        platform::validate_fs_type(requested)
    }

    /// Get the current capacity of a mounted volume.
    fn get_volume_capacity(path: &str) -> Result<i64, Status> {
        Self::validate_path(path)?;

        let output = std::process::Command::new("df")
            .args(["-k", path])
            .output()
            .map_err(|e| {
                error!(error = %e, "Failed to execute df");
                Status::internal(format!("Failed to get volume capacity: {}", e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);

        // Parse df output (second line, second column is total size in KB)
        if let Some(line) = stdout.lines().nth(1)
            && let Some(size_kb) = line.split_whitespace().nth(1)
            && let Ok(size) = size_kb.parse::<i64>()
        {
            return Ok(size * 1024);
        }

        Err(Status::internal("Could not parse volume capacity"))
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    /// Stage a volume: establish the iSCSI session, format the LUN if it is
    /// blank, and mount it at the staging path.
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        Self::validate_path(&req.staging_target_path)?;
        let target = Self::staging_target(&req.publish_context)?;
        let fs_type = Self::fs_type_from_capability(req.volume_capability.as_ref())?;

        info!(
            volume_id = %req.volume_id,
            target_iqn = %target.target_iqn,
            portal = %target.portal,
            lun = target.lun,
            "NodeStageVolume request"
        );

        if platform::is_mounted(&req.staging_target_path)? {
            info!(staging_path = %req.staging_target_path, "Volume already staged");
            return Ok(Response::new(csi::NodeStageVolumeResponse {}));
        }

        // Discovery keeps the node database fresh; a drifted record is a
        // warning, not a failure, because the login below is authoritative.
        match self.initiator.discover(&target.portal) {
            Ok(targets) if !targets.contains(&target.target_iqn) => {
                warn!(
                    target_iqn = %target.target_iqn,
                    portal = %target.portal,
                    "Discovery did not advertise the expected target"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(portal = %target.portal, error = %e, "iSCSI discovery failed");
            }
        }

        let sessions = self.initiator.sessions()?;
        let session_exists = sessions
            .iter()
            .any(|s| s.target == target.target_iqn && s.portal == target.portal);
        if !session_exists {
            self.initiator.login(&target.target_iqn, &target.portal)?;
        } else {
            debug!(target_iqn = %target.target_iqn, "Reusing existing iSCSI session");
        }

        let by_path = Self::device_by_path(&target);
        let device = Self::wait_for_device(&by_path).await?;

        if platform::needs_formatting(&device)? {
            platform::format_device(&device, fs_type)?;
        } else {
            debug!(device = %device, "Device already has a filesystem");
        }

        platform::mount_device(&device, &req.staging_target_path, fs_type)?;

        info!(
            volume_id = %req.volume_id,
            device = %device,
            staging_path = %req.staging_target_path,
            "Volume staged successfully"
        );

        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    /// Unstage a volume: unmount the staging path.
    ///
    /// The iSCSI session is left alone. Sessions are shared by every volume
    /// behind the same target, so teardown belongs to node lifecycle, not to
    /// individual volumes.
    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        Self::validate_path(&req.staging_target_path)?;

        info!(volume_id = %req.volume_id, staging_path = %req.staging_target_path, "NodeUnstageVolume request");

        platform::unmount(&req.staging_target_path)?;

        if Path::new(&req.staging_target_path).exists()
            && let Err(e) = fs::remove_dir(&req.staging_target_path)
        {
            debug!(staging_path = %req.staging_target_path, error = %e, "Could not remove staging directory");
        }

        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    /// Publish a volume: bind mount the staging path into the pod's target
    /// path.
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        Self::validate_path(&req.staging_target_path)?;
        Self::validate_path(&req.target_path)?;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            readonly = req.readonly,
            "NodePublishVolume request"
        );

        if !platform::is_mounted(&req.staging_target_path)? {
            return Err(Status::failed_precondition(format!(
                "Volume is not staged at {}",
                req.staging_target_path
            )));
        }

        if platform::is_mounted(&req.target_path)? {
            info!(target_path = %req.target_path, "Volume already published");
            return Ok(Response::new(csi::NodePublishVolumeResponse {}));
        }

        platform::bind_mount(&req.staging_target_path, &req.target_path)?;

        if req.readonly {
            let output = std::process::Command::new("mount")
                .args(["-o", "remount,ro,bind", &req.target_path])
                .output()
                .map_err(|e| Status::internal(format!("Failed to remount read-only: {e}")))?;
            if !output.status.success() {
                warn!(
                    target_path = %req.target_path,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "Read-only remount failed"
                );
            }
        }

        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    /// Unpublish a volume: remove the bind mount.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        Self::validate_path(&req.target_path)?;

        info!(volume_id = %req.volume_id, target_path = %req.target_path, "NodeUnpublishVolume request");

        platform::unmount(&req.target_path)?;

        if Path::new(&req.target_path).exists()
            && let Err(e) = fs::remove_dir(&req.target_path)
        {
            debug!(target_path = %req.target_path, error = %e, "Could not remove target directory");
        }

        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("NodeGetVolumeStats is not supported"))
    }

    /// Grow the filesystem after a controller-side expansion.
    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        Self::validate_path(&req.volume_path)?;

        info!(volume_id = %req.volume_id, volume_path = %req.volume_path, "NodeExpandVolume request");

        let (device, fs_type) = platform::device_for_mount(&req.volume_path)?;

        // The kernel caches the old capacity until the device is rescanned.
        platform::rescan_device(&device);

        platform::grow_filesystem(&device, &req.volume_path, &fs_type)?;

        let capacity_bytes = Self::get_volume_capacity(&req.volume_path)?;
        info!(
            volume_id = %req.volume_id,
            capacity_bytes = capacity_bytes,
            "Filesystem grown successfully"
        );

        Ok(Response::new(csi::NodeExpandVolumeResponse {
            capacity_bytes,
        }))
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let rpc_types = [
            csi::node_service_capability::rpc::Type::StageUnstageVolume,
            csi::node_service_capability::rpc::Type::ExpandVolume,
        ];

        let capabilities = rpc_types
            .into_iter()
            .map(|t| csi::NodeServiceCapability {
                r#type: Some(csi::node_service_capability::Type::Rpc(
                    csi::node_service_capability::Rpc { r#type: t as i32 },
                )),
            })
            .collect();

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Report node identity.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
        }))
    }
}
