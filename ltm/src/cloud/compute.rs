//! Cloud Compute Client (`spec.md` §4.6), grounded on
//! `original_source/.../sharder.py` (`__get_region_info`,
//! `__get_all_region_quotas`) for the quota math and zone-selection
//! subtlety, and on `spec.md` §4.3 for the per-instance monitor operations.
use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("compute API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("region {0} has no available zones")]
    NoAvailableZone(String),
}

/// A region's allocatable capacity, per the `QuotaView` data model in §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionQuota {
    pub zone: String,
    pub cpu_shards: u32,
    pub ip_shards: u32,
}

impl RegionQuota {
    pub fn capacity(&self) -> u32 {
        self.cpu_shards.min(self.ip_shards)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Instance {
    pub status: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialOutput {
    pub start: u64,
    pub next: u64,
    pub contents: String,
}

/// Whether `instances.setMetadata` should only write a key if it is absent
/// (used for `shutdown_reason`, which must not be clobbered on repeat polls).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatusWrite {
    Always,
    OnlyIfAbsent,
}

#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Regions with status `UP`, eligible for fan-out sharding.
    async fn list_up_regions(&self) -> Result<Vec<String>, Error>;

    /// Quota view for one region. The selected zone is the *last* `UP` zone
    /// seen while iterating the region's zone list, matching
    /// `__get_region_info`'s loop (it keeps overwriting `zone` on every `UP`
    /// match rather than breaking on the first).
    async fn region_quota(&self, region: &str) -> Result<RegionQuota, Error>;

    async fn get_instance(&self, name: &str, zone: &str) -> Result<Option<Instance>, Error>;

    async fn set_metadata(
        &self,
        name: &str,
        zone: &str,
        key: &str,
        value: &str,
        write: MonitorStatusWrite,
    ) -> Result<(), Error>;

    async fn delete_instance(&self, name: &str, zone: &str) -> Result<(), Error>;

    async fn get_serial_port_output(&self, name: &str, zone: &str, start: u64) -> Result<SerialOutput, Error>;
}

pub struct GceComputeClient {
    client: reqwest::Client,
    project: String,
    base_url: String,
}

impl GceComputeClient {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            project: project.into(),
            base_url: "https://compute.googleapis.com/compute/v1".to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/projects/{}{path}", self.base_url, self.project)
    }
}

#[derive(Debug, Deserialize)]
struct RegionsListResponse {
    #[serde(default)]
    items: Vec<RegionInfo>,
}

#[derive(Debug, Deserialize)]
struct RegionInfo {
    name: String,
    status: String,
    #[serde(default)]
    zones: Vec<String>,
    #[serde(default)]
    quotas: Vec<Quota>,
}

#[derive(Debug, Deserialize)]
struct Quota {
    metric: String,
    limit: f64,
    usage: f64,
}

#[derive(Debug, Deserialize)]
struct ZoneInfo {
    name: String,
    status: String,
}

#[async_trait]
impl ComputeClient for GceComputeClient {
    async fn list_up_regions(&self) -> Result<Vec<String>, Error> {
        let resp: RegionsListResponse = self.client.get(self.url("/regions")).send().await?.json().await?;
        Ok(resp
            .items
            .into_iter()
            .filter(|r| r.status == "UP")
            .map(|r| r.name)
            .collect())
    }

    async fn region_quota(&self, region: &str) -> Result<RegionQuota, Error> {
        let info: RegionInfo = self
            .client
            .get(self.url(&format!("/regions/{region}")))
            .send()
            .await?
            .json()
            .await?;

        let mut selected_zone = None;
        for zone_url in &info.zones {
            let zone_name = zone_url.rsplit('/').next().unwrap_or(zone_url);
            let zone: ZoneInfo = self
                .client
                .get(self.url(&format!("/zones/{zone_name}")))
                .send()
                .await?
                .json()
                .await?;
            if zone.status == "UP" {
                selected_zone = Some(zone.name);
            }
        }
        let zone = selected_zone.ok_or_else(|| Error::NoAvailableZone(region.to_string()))?;

        let mut available_cpus = 0.0;
        let mut available_ips = 0.0;
        for q in &info.quotas {
            match q.metric.as_str() {
                "CPUS" => available_cpus = q.limit - q.usage,
                "IN_USE_ADDRESSES" => available_ips = q.limit - q.usage,
                _ => {}
            }
        }

        Ok(RegionQuota {
            zone,
            cpu_shards: (available_cpus / 2.0).floor().max(0.0) as u32,
            ip_shards: available_ips.max(0.0) as u32,
        })
    }

    async fn get_instance(&self, name: &str, zone: &str) -> Result<Option<Instance>, Error> {
        let resp = self
            .client
            .get(self.url(&format!("/zones/{zone}/instances/{name}")))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        #[derive(Deserialize)]
        struct Item {
            key: String,
            value: String,
        }
        #[derive(Deserialize)]
        struct MetadataBlock {
            #[serde(default)]
            items: Vec<Item>,
        }
        #[derive(Deserialize)]
        struct InstanceResponse {
            status: String,
            #[serde(default)]
            metadata: MetadataBlock,
        }
        let body: InstanceResponse = resp.json().await?;
        let metadata = body.metadata.items.into_iter().map(|i| (i.key, i.value)).collect();
        Ok(Some(Instance {
            status: body.status,
            metadata,
        }))
    }

    async fn set_metadata(
        &self,
        name: &str,
        zone: &str,
        key: &str,
        value: &str,
        write: MonitorStatusWrite,
    ) -> Result<(), Error> {
        if write == MonitorStatusWrite::OnlyIfAbsent {
            if let Some(instance) = self.get_instance(name, zone).await? {
                if instance.metadata.contains_key(key) {
                    return Ok(());
                }
            }
        }
        self.client
            .post(self.url(&format!("/zones/{zone}/instances/{name}/setMetadata")))
            .json(&serde_json::json!({ "items": [{ "key": key, "value": value }] }))
            .send()
            .await?;
        Ok(())
    }

    async fn delete_instance(&self, name: &str, zone: &str) -> Result<(), Error> {
        self.client
            .delete(self.url(&format!("/zones/{zone}/instances/{name}")))
            .send()
            .await?;
        Ok(())
    }

    async fn get_serial_port_output(&self, name: &str, zone: &str, start: u64) -> Result<SerialOutput, Error> {
        let resp = self
            .client
            .get(self.url(&format!("/zones/{zone}/instances/{name}/serialPort")))
            .query(&[("start", start.to_string())])
            .send()
            .await?;
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct FakeComputeClient {
        pub regions: HashMap<String, RegionQuota>,
        pub instances: Mutex<HashMap<String, Instance>>,
    }

    #[async_trait]
    impl ComputeClient for FakeComputeClient {
        async fn list_up_regions(&self) -> Result<Vec<String>, Error> {
            Ok(self.regions.keys().cloned().collect())
        }

        async fn region_quota(&self, region: &str) -> Result<RegionQuota, Error> {
            self.regions
                .get(region)
                .cloned()
                .ok_or_else(|| Error::NoAvailableZone(region.to_string()))
        }

        async fn get_instance(&self, name: &str, _zone: &str) -> Result<Option<Instance>, Error> {
            Ok(self.instances.lock().await.get(name).cloned())
        }

        async fn set_metadata(
            &self,
            name: &str,
            _zone: &str,
            key: &str,
            value: &str,
            write: MonitorStatusWrite,
        ) -> Result<(), Error> {
            let mut instances = self.instances.lock().await;
            if let Some(instance) = instances.get_mut(name) {
                if write == MonitorStatusWrite::OnlyIfAbsent && instance.metadata.contains_key(key) {
                    return Ok(());
                }
                instance.metadata.insert(key.to_string(), value.to_string());
            }
            Ok(())
        }

        async fn delete_instance(&self, name: &str, _zone: &str) -> Result<(), Error> {
            self.instances.lock().await.remove(name);
            Ok(())
        }

        async fn get_serial_port_output(&self, _name: &str, _zone: &str, start: u64) -> Result<SerialOutput, Error> {
            Ok(SerialOutput {
                start,
                next: start,
                contents: String::new(),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn region_quota_capacity_is_min() {
        let q = RegionQuota {
            zone: "us-central1-a".into(),
            cpu_shards: 5,
            ip_shards: 3,
        };
        assert_eq!(q.capacity(), 3);
    }
}
