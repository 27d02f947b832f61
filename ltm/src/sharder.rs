//! Sharder (`spec.md` §4.2), grounded on
//! `original_source/.../sharder.py` (`__group_all_configs`,
//! `region_sharding`, `local_sharding`, `__get_region_info`,
//! `__get_all_region_quotas`).
use std::path::Path;
use std::sync::Arc;

use ltm_config::ParsedPlan;
use rand::seq::SliceRandom;
use thiserror::Error;

use crate::cloud::compute::{ComputeClient, RegionQuota};
use crate::shard::ShardSpec;

#[derive(Debug, Error)]
pub enum Error {
    #[error("out of quota: the project cannot support a single shard")]
    OutOfQuota,

    #[error("compute API error: {0}")]
    Compute(#[from] crate::cloud::compute::Error),
}

pub struct Sharder {
    compute: Arc<dyn ComputeClient>,
    gce_region: String,
}

impl Sharder {
    pub fn new(compute: Arc<dyn ComputeClient>, gce_region: impl Into<String>) -> Self {
        Self {
            compute,
            gce_region: gce_region.into(),
        }
    }

    /// `all = [fs/cfg for fs in fsconfigs for cfg in fsconfigs[fs] if "dax"
    /// not in cfg]`, then split linearly into `max_groups` near-equal runs.
    fn all_configs(plan: &ParsedPlan) -> Vec<String> {
        plan.fsconfigs
            .iter()
            .flat_map(|(fs, cfgs)| cfgs.iter().map(move |cfg| format!("{fs}/{cfg}")))
            .filter(|cfg| !cfg.contains("dax"))
            .collect()
    }

    fn group_all_configs(all_configs: &[String], max_groups: i64) -> Vec<String> {
        if max_groups <= 0 || all_configs.len() as i64 <= max_groups {
            return all_configs.to_vec();
        }
        let max_groups = max_groups as usize;
        let len = all_configs.len();
        let mut groups = Vec::with_capacity(max_groups);
        let mut start = 0;
        let mut remainder = len % max_groups;
        let quotient = len / max_groups;
        while start < len {
            let size = if remainder > 0 {
                remainder -= 1;
                quotient + 1
            } else {
                quotient
            };
            groups.push(all_configs[start..start + size].join(","));
            start += size;
        }
        groups
    }

    /// Fan-out mode: shard across every region with available quota,
    /// preferring the LTM's own continent.
    pub async fn region_sharding(
        &self,
        plan: &ParsedPlan,
        extra_args: &[String],
        run_id: &str,
        user: &str,
        log_dir: &Path,
    ) -> Result<Vec<ShardSpec>, Error> {
        let quotas = self.all_region_quotas().await?;
        let my_continent = self.gce_region.split('-').next().unwrap_or_default().to_string();

        let (preferred, other): (Vec<_>, Vec<_>) = quotas.into_iter().partition(|(region, _)| region.starts_with(&my_continent));

        let mut total_max_shards: u32 = 0;
        let mut zones_to_use = Vec::new();
        for (_, quota) in &preferred {
            let cap = quota.capacity();
            total_max_shards += cap;
            zones_to_use.extend(std::iter::repeat(quota.zone.clone()).take(cap as usize));
        }
        zones_to_use.shuffle(&mut rand::rng());

        let mut other_zones_to_use = Vec::new();
        for (_, quota) in &other {
            let cap = quota.capacity();
            total_max_shards += cap;
            other_zones_to_use.extend(std::iter::repeat(quota.zone.clone()).take(cap as usize));
        }
        other_zones_to_use.shuffle(&mut rand::rng());

        zones_to_use.extend(other_zones_to_use);

        if total_max_shards == 0 {
            return Err(Error::OutOfQuota);
        }

        let all_configs = Self::all_configs(plan);
        let grouped = Self::group_all_configs(&all_configs, total_max_shards as i64);

        Ok(grouped
            .into_iter()
            .enumerate()
            .map(|(i, cfg)| ShardSpec::new(i, cfg, extra_args, Some(zones_to_use[i].clone()), run_id, user, log_dir))
            .collect())
    }

    /// Local mode: shard only within the LTM's own region.
    pub async fn local_sharding(
        &self,
        plan: &ParsedPlan,
        extra_args: &[String],
        run_id: &str,
        user: &str,
        log_dir: &Path,
        max_shards: i64,
    ) -> Result<Vec<ShardSpec>, Error> {
        let quota = self.compute.region_quota(&self.gce_region).await?;
        let cap = quota.capacity() as i64;
        let max_shards = if max_shards <= 0 { cap } else { max_shards };
        let max_shards = max_shards.min(cap).min(quota.cpu_shards as i64).min(quota.ip_shards as i64);

        if max_shards == 0 {
            return Err(Error::OutOfQuota);
        }

        let all_configs = Self::all_configs(plan);
        let grouped = Self::group_all_configs(&all_configs, max_shards);

        Ok(grouped
            .into_iter()
            .enumerate()
            .map(|(i, cfg)| ShardSpec::new(i, cfg, extra_args, None, run_id, user, log_dir))
            .collect())
    }

    pub async fn get_shards(
        &self,
        plan: &ParsedPlan,
        extra_args: &[String],
        run_id: &str,
        user: &str,
        log_dir: &Path,
        region_shard: bool,
        max_shards: i64,
    ) -> Result<Vec<ShardSpec>, Error> {
        if region_shard {
            self.region_sharding(plan, extra_args, run_id, user, log_dir).await
        } else {
            self.local_sharding(plan, extra_args, run_id, user, log_dir, max_shards).await
        }
    }

    async fn all_region_quotas(&self) -> Result<Vec<(String, RegionQuota)>, Error> {
        let regions = self.compute.list_up_regions().await?;
        let mut quotas = Vec::new();
        for region in regions {
            if let Ok(quota) = self.compute.region_quota(&region).await {
                quotas.push((region, quota));
            }
        }
        Ok(quotas)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn group_all_configs_11_into_4() {
        let all: Vec<String> = (0..11).map(|i| format!("ext4/cfg{i}")).collect();
        let groups = Sharder::group_all_configs(&all, 4);
        let sizes: Vec<usize> = groups.iter().map(|g| g.split(',').count()).collect();
        assert_eq!(sizes, vec![3, 3, 3, 2]);
    }

    #[test]
    fn group_all_configs_concatenation_preserves_order() {
        let all: Vec<String> = (0..7).map(|i| format!("ext4/cfg{i}")).collect();
        let groups = Sharder::group_all_configs(&all, 3);
        let flat: Vec<String> = groups.iter().flat_map(|g| g.split(',').map(str::to_string)).collect();
        assert_eq!(flat, all);
    }

    #[test]
    fn max_groups_zero_or_ge_len_is_one_shard_each() {
        let all: Vec<String> = (0..3).map(|i| format!("ext4/cfg{i}")).collect();
        assert_eq!(Sharder::group_all_configs(&all, 0), all);
        assert_eq!(Sharder::group_all_configs(&all, 10), all);
    }

    #[test]
    fn dax_configs_are_excluded() {
        let mut plan = ParsedPlan::default();
        plan.fsconfigs
            .entry("ext4".to_string())
            .or_default()
            .extend(["4k".to_string(), "dax".to_string()]);
        let all = Sharder::all_configs(&plan);
        assert_eq!(all, vec!["ext4/4k".to_string()]);
    }
}
