//! REST implementation of [`ArrayClient`] against the SANtricity Web
//! Services API (embedded or proxy).

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{
    ArrayClient, ArrayError, CreateVolumeParams, Host, IscsiTargetSettings, LunMapping,
    PoolCriteria, Result, StoragePool, StorageSystem, VolumeEx,
};
use crate::config::ArrayConfig;

pub struct RestArrayClient {
    http: Client,
    /// `{api_url}/devmgr/v2/storage-systems/{array_id}`
    base: String,
    username: String,
    password: String,
    host_type_index: u32,
}

impl RestArrayClient {
    pub fn new(config: &ArrayConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout.max(Duration::from_secs(1)))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        let base = format!(
            "{}/devmgr/v2/storage-systems/{}",
            config.api_url.trim_end_matches('/'),
            config.array_id
        );

        Ok(Self {
            http,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
            host_type_index: config.host_type_index,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn check(&self, path: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ArrayError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ArrayError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!(path = %path, "array GET");
        let resp = self
            .http
            .get(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let resp = self.check(path, resp).await?;
        Ok(resp.json().await?)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        debug!(path = %path, "array POST");
        let resp = self
            .http
            .post(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await?;
        let resp = self.check(path, resp).await?;
        Ok(resp.json().await?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        debug!(path = %path, "array DELETE");
        let resp = self
            .http
            .delete(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        self.check(path, resp).await?;
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetaTag {
    key: String,
    value: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateVolumeBody {
    pool_id: String,
    name: String,
    size_unit: &'static str,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    raid_level: Option<String>,
    meta_tags: Vec<MetaTag>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExpandVolumeBody {
    expansion_size: u64,
    size_unit: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateHostBody {
    name: String,
    host_type: HostTypeRef,
    ports: Vec<HostPortBody>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HostTypeRef {
    index: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HostPortBody {
    #[serde(rename = "type")]
    port_type: &'static str,
    port: String,
    label: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateMappingBody {
    mappable_object_id: String,
    target_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    lun: Option<u32>,
}

#[async_trait::async_trait]
impl ArrayClient for RestArrayClient {
    async fn get_volume(&self, volume_ref: &str) -> Result<VolumeEx> {
        self.get_json(&format!("/volumes/{volume_ref}")).await
    }

    async fn create_volume(&self, params: CreateVolumeParams) -> Result<VolumeEx> {
        let body = CreateVolumeBody {
            pool_id: params.pool_ref,
            name: params.name,
            size_unit: "bytes",
            size: params.size_bytes,
            raid_level: params.raid_level,
            meta_tags: params
                .metadata
                .into_iter()
                .map(|(key, value)| MetaTag { key, value })
                .collect(),
        };
        self.post_json("/volumes", &body).await
    }

    async fn delete_volume(&self, volume_ref: &str) -> Result<()> {
        self.delete(&format!("/volumes/{volume_ref}")).await
    }

    async fn expand_volume(&self, volume_ref: &str, additional_bytes: u64) -> Result<()> {
        let body = ExpandVolumeBody {
            expansion_size: additional_bytes,
            size_unit: "bytes",
        };
        // Expansion responses vary by firmware; only the status matters here.
        let resp = self
            .http
            .post(self.url(&format!("/volumes/{volume_ref}/expand")))
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;
        self.check(&format!("/volumes/{volume_ref}/expand"), resp)
            .await?;
        Ok(())
    }

    async fn get_pool(&self, pool_ref: &str) -> Result<StoragePool> {
        self.get_json(&format!("/storage-pools/{pool_ref}")).await
    }

    async fn list_pools(&self, criteria: &PoolCriteria) -> Result<Vec<StoragePool>> {
        let pools: Vec<StoragePool> = self.get_json("/storage-pools").await?;
        Ok(pools
            .into_iter()
            .filter(|p| {
                p.drive_media_type.eq_ignore_ascii_case(&criteria.media_type)
                    && p.free_bytes() >= criteria.min_free_bytes
                    && criteria.name.as_ref().is_none_or(|n| &p.label == n)
            })
            .collect())
    }

    async fn get_host_by_iqn(&self, iqn: &str) -> Result<Option<Host>> {
        let hosts: Vec<Host> = self.get_json("/hosts").await?;
        Ok(hosts.into_iter().find(|h| h.has_iqn(iqn)))
    }

    async fn create_host(&self, label: &str, iqn: &str) -> Result<Host> {
        let body = CreateHostBody {
            name: label.to_string(),
            host_type: HostTypeRef {
                index: self.host_type_index,
            },
            ports: vec![HostPortBody {
                port_type: "iscsi",
                port: iqn.to_string(),
                label: format!("{label}-port0"),
            }],
        };
        self.post_json("/hosts", &body).await
    }

    async fn map_volume(
        &self,
        volume_ref: &str,
        target_ref: &str,
        lun: Option<u32>,
    ) -> Result<LunMapping> {
        let body = CreateMappingBody {
            mappable_object_id: volume_ref.to_string(),
            target_id: target_ref.to_string(),
            lun,
        };
        self.post_json("/volume-mappings", &body).await
    }

    async fn delete_mapping(&self, mapping_ref: &str) -> Result<()> {
        self.delete(&format!("/volume-mappings/{mapping_ref}")).await
    }

    async fn target_settings(&self) -> Result<IscsiTargetSettings> {
        self.get_json("/iscsi/target-settings").await
    }

    async fn storage_system(&self) -> Result<StorageSystem> {
        let system: StorageSystem = self.get_json("").await?;
        if system.controllers.is_empty() {
            warn!("storage system record lists no controller addresses");
        }
        Ok(system)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ArrayConfig {
        ArrayConfig {
            api_url: "https://array.example.com:8443/".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            array_id: "1".to_string(),
            host_type_index: 28,
            verify_tls: false,
            timeout: Duration::from_secs(90),
        }
    }

    #[test]
    fn test_base_url_strips_trailing_slash() {
        let client = RestArrayClient::new(&test_config()).unwrap();
        assert_eq!(
            client.url("/volumes"),
            "https://array.example.com:8443/devmgr/v2/storage-systems/1/volumes"
        );
    }

    #[test]
    fn test_mapping_body_omits_lun_for_auto_assign() {
        let body = CreateMappingBody {
            mappable_object_id: "0200".to_string(),
            target_id: "8400".to_string(),
            lun: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("lun").is_none());
        assert_eq!(json["mappableObjectId"], "0200");

        let body = CreateMappingBody {
            mappable_object_id: "0200".to_string(),
            target_id: "8400".to_string(),
            lun: Some(5),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["lun"], 5);
    }

    #[test]
    fn test_create_volume_body_shape() {
        let body = CreateVolumeBody {
            pool_id: "0400".to_string(),
            name: "pvc-abc".to_string(),
            size_unit: "bytes",
            size: 1 << 30,
            raid_level: None,
            meta_tags: vec![MetaTag {
                key: "pvcName".to_string(),
                value: "data-0".to_string(),
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["poolId"], "0400");
        assert_eq!(json["sizeUnit"], "bytes");
        assert!(json.get("raidLevel").is_none());
        assert_eq!(json["metaTags"][0]["key"], "pvcName");
    }
}
