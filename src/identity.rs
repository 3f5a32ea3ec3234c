//! CSI Identity service: plugin identity and plugin-level capability
//! advertisement. Controller- and node-level capabilities are reported by
//! their own services; this one only states that they exist.

use tonic::{Request, Response, Status};

use crate::csi;

pub const DRIVER_NAME: &str = "csi.santricity.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Plugin-level capabilities: a controller service exists, and volumes grow
/// while mounted (the array expands online and the node grows the
/// filesystem afterwards).
fn plugin_capabilities() -> Vec<csi::PluginCapability> {
    use csi::plugin_capability::{Service, Type, VolumeExpansion, service, volume_expansion};

    vec![
        csi::PluginCapability {
            r#type: Some(Type::Service(Service {
                r#type: service::Type::ControllerService as i32,
            })),
        },
        csi::PluginCapability {
            r#type: Some(Type::VolumeExpansion(VolumeExpansion {
                r#type: volume_expansion::Type::Online as i32,
            })),
        },
    ]
}

pub struct IdentityService;

impl IdentityService {
    pub fn new() -> Self {
        Self
    }
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: DRIVER_NAME.to_string(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities: plugin_capabilities(),
        }))
    }

    /// Liveness only. Array reachability is checked at startup and surfaced
    /// through metrics, not through Probe, so a slow array cannot make the
    /// kubelet restart the driver.
    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}
