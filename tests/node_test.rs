//! Node service request validation and capability reporting.

use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Code, Request, Status};

use santricity_csi::NodeService;
use santricity_csi::csi;
use santricity_csi::csi::node_server::Node;
use santricity_csi::iscsi::{IscsiInitiator, IscsiSession};

const NODE_IQN: &str = "iqn.1994-05.com.redhat:node1";

/// Fails the test if any iSCSI operation is attempted. Used to prove that
/// request validation happens before the initiator is touched.
struct NoTouchInitiator;

impl IscsiInitiator for NoTouchInitiator {
    fn discover(&self, _portal: &str) -> Result<Vec<String>, Status> {
        panic!("discover must not be called for invalid requests");
    }

    fn sessions(&self) -> Result<Vec<IscsiSession>, Status> {
        panic!("sessions must not be called for invalid requests");
    }

    fn login(&self, _target_iqn: &str, _portal: &str) -> Result<(), Status> {
        panic!("login must not be called for invalid requests");
    }
}

fn node_service() -> NodeService {
    NodeService::new(NODE_IQN.to_string(), Arc::new(NoTouchInitiator))
}

fn full_publish_context() -> HashMap<String, String> {
    HashMap::from([
        ("lun".to_string(), "3".to_string()),
        (
            "targetIQN".to_string(),
            "iqn.1992-08.com.netapp:5700".to_string(),
        ),
        ("targetPortal".to_string(), "10.0.0.1:3260".to_string()),
        ("volumeID".to_string(), "vol-1".to_string()),
    ])
}

fn stage_request(publish_context: HashMap<String, String>) -> csi::NodeStageVolumeRequest {
    csi::NodeStageVolumeRequest {
        volume_id: "vol-1".to_string(),
        publish_context,
        staging_target_path: "/var/lib/kubelet/plugins/staging/vol-1".to_string(),
        volume_capability: None,
        secrets: HashMap::new(),
        volume_context: HashMap::new(),
    }
}

#[tokio::test]
async fn test_stage_rejects_missing_context_keys() {
    let service = node_service();

    for key in ["lun", "targetIQN", "targetPortal"] {
        let mut ctx = full_publish_context();
        ctx.remove(key);
        let err = service
            .node_stage_volume(Request::new(stage_request(ctx)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument, "missing {key}");
    }
}

#[tokio::test]
async fn test_stage_rejects_bad_lun() {
    let service = node_service();
    let mut ctx = full_publish_context();
    ctx.insert("lun".to_string(), "not-a-number".to_string());
    let err = service
        .node_stage_volume(Request::new(stage_request(ctx)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_stage_rejects_missing_volume_id() {
    let service = node_service();
    let mut req = stage_request(full_publish_context());
    req.volume_id = String::new();
    let err = service
        .node_stage_volume(Request::new(req))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_stage_rejects_bad_staging_path() {
    let service = node_service();

    let mut req = stage_request(full_publish_context());
    req.staging_target_path = "relative/path".to_string();
    let err = service
        .node_stage_volume(Request::new(req))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let mut req = stage_request(full_publish_context());
    req.staging_target_path = "/staging/../escape".to_string();
    let err = service
        .node_stage_volume(Request::new(req))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_stage_rejects_block_capability() {
    let service = node_service();
    let mut req = stage_request(full_publish_context());
    req.volume_capability = Some(csi::VolumeCapability {
        access_mode: None,
        access_type: Some(csi::volume_capability::AccessType::Block(
            csi::volume_capability::BlockVolume {},
        )),
    });
    let err = service
        .node_stage_volume(Request::new(req))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_publish_requires_staged_volume() {
    let service = node_service();
    let req = csi::NodePublishVolumeRequest {
        volume_id: "vol-1".to_string(),
        publish_context: full_publish_context(),
        staging_target_path: "/definitely/not/mounted/staging".to_string(),
        target_path: "/var/lib/kubelet/pods/x/volumes/vol-1".to_string(),
        volume_capability: None,
        readonly: false,
        secrets: HashMap::new(),
        volume_context: HashMap::new(),
    };
    let err = service
        .node_publish_volume(Request::new(req))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn test_unpublish_of_unmounted_path_succeeds() {
    let service = node_service();
    let req = csi::NodeUnpublishVolumeRequest {
        volume_id: "vol-1".to_string(),
        target_path: "/definitely/not/mounted/target".to_string(),
    };
    service.node_unpublish_volume(Request::new(req)).await.unwrap();
}

#[tokio::test]
async fn test_unstage_of_unmounted_path_succeeds() {
    let service = node_service();
    let req = csi::NodeUnstageVolumeRequest {
        volume_id: "vol-1".to_string(),
        staging_target_path: "/definitely/not/mounted/staging".to_string(),
    };
    service.node_unstage_volume(Request::new(req)).await.unwrap();
}

#[tokio::test]
async fn test_node_get_info() {
    let service = node_service();
    let info = service
        .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.node_id, NODE_IQN);
    assert_eq!(info.max_volumes_per_node, 0);
}

#[tokio::test]
async fn test_node_capabilities() {
    let service = node_service();
    let caps = service
        .node_get_capabilities(Request::new(csi::NodeGetCapabilitiesRequest {}))
        .await
        .unwrap()
        .into_inner()
        .capabilities;

    let types: Vec<i32> = caps
        .iter()
        .filter_map(|c| match &c.r#type {
            Some(csi::node_service_capability::Type::Rpc(rpc)) => Some(rpc.r#type),
            None => None,
        })
        .collect();
    assert!(types.contains(
        &(csi::node_service_capability::rpc::Type::StageUnstageVolume as i32)
    ));
    assert!(types.contains(&(csi::node_service_capability::rpc::Type::ExpandVolume as i32)));
}

#[tokio::test]
async fn test_node_get_volume_stats_unimplemented() {
    let service = node_service();
    let err = service
        .node_get_volume_stats(Request::new(csi::NodeGetVolumeStatsRequest {
            volume_id: "vol-1".to_string(),
            volume_path: "/var/lib/kubelet/pods/x".to_string(),
            staging_target_path: String::new(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}
