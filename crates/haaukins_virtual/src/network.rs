// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::container::{short_id, ContainerRuntime};
use crate::{Closer, VirtualError};
use async_trait::async_trait;
use color_eyre::eyre;
use lazy_static::lazy_static;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const DHCP_OCTET: u8 = 2;
pub const DNS_OCTET: u8 = 3;
const POOL: RangeInclusive<u8> = 30..=254;
const MAX_SUBNET_ATTEMPTS: usize = 64;
const MAX_SUBNETS: usize = 60_000;

lazy_static! {
    static ref SUBNETS: SubnetPool = SubnetPool::default();
}

/// Tracks the `/24` prefixes handed out to lab networks on this host.
#[derive(Default)]
pub(crate) struct SubnetPool {
    used: Mutex<HashSet<String>>,
}

impl SubnetPool {
    /// Reserves a random RFC1918 `/24` prefix (`a.b.c`), weighted by the size of each range.
    pub(crate) fn get(&self) -> Result<String, VirtualError> {
        let mut used = self.used.lock().map_err(|_| VirtualError::NoFreeSubnet)?;
        if used.len() >= MAX_SUBNETS {
            return Err(VirtualError::NoFreeSubnet);
        }
        loop {
            let prefix = random_prefix(&mut rand::rng());
            if used.insert(prefix.clone()) {
                return Ok(prefix);
            }
        }
    }

    pub(crate) fn release(&self, prefix: &str) {
        if let Ok(mut used) = self.used.lock() {
            used.remove(prefix);
        }
    }
}

fn random_prefix(rng: &mut impl Rng) -> String {
    // 172.25-30.x.x, 10.x.x.x and 192.168.x.x in proportion to the number of /24s they offer
    const WEIGHT_172: u32 = 6 * 255;
    const WEIGHT_10: u32 = 255 * 255;
    const WEIGHT_192: u32 = 255;

    let pick = rng.random_range(0..WEIGHT_172 + WEIGHT_10 + WEIGHT_192);
    let third = rng.random_range(0..255u8);
    if pick < WEIGHT_172 {
        format!("172.{}.{third}", rng.random_range(25..=30u8))
    } else if pick < WEIGHT_172 + WEIGHT_10 {
        format!("10.{}.{third}", rng.random_range(0..255u8))
    } else {
        format!("192.168.{third}")
    }
}

/// Last-octet bookkeeping of a single network.
#[derive(Debug)]
pub(crate) struct IpPool {
    free: BTreeSet<u8>,
    attached: BTreeMap<u8, String>,
}

impl Default for IpPool {
    fn default() -> Self {
        IpPool {
            free: POOL.collect(),
            attached: BTreeMap::new(),
        }
    }
}

impl IpPool {
    /// Claims an octet for `container`. Returns the octet and whether it was drawn from the pool.
    pub(crate) fn claim(
        &mut self,
        container: &str,
        preferred: Option<u8>,
    ) -> Result<(u8, bool), VirtualError> {
        let octet = match preferred {
            Some(octet) => {
                if octet == 0 || octet == 255 || self.attached.contains_key(&octet) {
                    return Err(VirtualError::IpInUse(octet));
                }
                self.free.remove(&octet);
                octet
            }
            None => {
                let free = self.free.len();
                if free == 0 {
                    return Err(VirtualError::NoAvailableIps);
                }
                let idx = rand::rng().random_range(0..free);
                let octet = self
                    .free
                    .iter()
                    .nth(idx)
                    .copied()
                    .ok_or(VirtualError::NoAvailableIps)?;
                self.free.remove(&octet);
                octet
            }
        };
        self.attached.insert(octet, container.to_string());
        Ok((octet, preferred.is_none()))
    }

    /// Undoes a failed claim.
    pub(crate) fn unclaim(&mut self, octet: u8, drawn: bool) {
        self.attached.remove(&octet);
        if drawn {
            self.free.insert(octet);
        }
    }

    /// Drops the attachment of `container` but keeps its octet reserved.
    pub(crate) fn forget(&mut self, container: &str) -> Option<u8> {
        let octet = self
            .attached
            .iter()
            .find(|(_, id)| id.as_str() == container)
            .map(|(octet, _)| *octet)?;
        self.attached.remove(&octet);
        Some(octet)
    }

    /// Drops the attachment of `container` and returns its octet to the pool.
    pub(crate) fn release(&mut self, container: &str) -> Option<u8> {
        let octet = self.forget(container)?;
        if POOL.contains(&octet) {
            self.free.insert(octet);
        }
        Some(octet)
    }

    pub(crate) fn attached(&self) -> Vec<(u8, String)> {
        self.attached
            .iter()
            .map(|(octet, id)| (*octet, id.clone()))
            .collect()
    }

    pub(crate) fn is_free(&self, octet: u8) -> bool {
        self.free.contains(&octet)
    }
}

/// An isolated `/24` lab network. Octets 2 and 3 are kept for DHCP and DNS, exercises draw from
/// 30 to 254.
pub struct Network {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    name: String,
    prefix: String,
    ips: Mutex<IpPool>,
}

impl Network {
    pub async fn new(runtime: Arc<dyn ContainerRuntime>) -> Result<Network, VirtualError> {
        Self::with_subnets(runtime, &SUBNETS).await
    }

    async fn with_subnets(
        runtime: Arc<dyn ContainerRuntime>,
        subnets: &SubnetPool,
    ) -> Result<Network, VirtualError> {
        let name = uuid::Uuid::new_v4().to_string();
        for _ in 0..MAX_SUBNET_ATTEMPTS {
            let prefix = subnets.get()?;
            match runtime
                .create_network(&name, &format!("{prefix}.0/24"))
                .await
            {
                Ok(id) => {
                    info! {
                        id = short_id(&id),
                        subnet = %format!("{prefix}.0/24"),
                        "created lab network"
                    }
                    return Ok(Network {
                        runtime,
                        id,
                        name,
                        prefix,
                        ips: Mutex::new(IpPool::default()),
                    });
                }
                Err(VirtualError::SubnetOverlap(subnet)) => {
                    // Leave the prefix reserved, it belongs to somebody else
                    debug!(%subnet, "subnet overlaps, retrying");
                }
                Err(error) => {
                    subnets.release(&prefix);
                    return Err(error);
                }
            }
        }
        Err(VirtualError::NoFreeSubnet)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The network in CIDR notation, e.g. `10.14.3.0/24`.
    pub fn subnet(&self) -> String {
        format!("{}.0/24", self.prefix)
    }

    pub fn format_ip(&self, octet: u8) -> String {
        format!("{}.{octet}", self.prefix)
    }

    /// The host interface VMs bridge onto to join this network.
    pub fn interface(&self) -> String {
        format!("dm-{}", short_id(&self.id))
    }

    fn ips(&self) -> Result<std::sync::MutexGuard<'_, IpPool>, VirtualError> {
        self.ips
            .lock()
            .map_err(|_| VirtualError::Unexpected("ip pool lock poisoned".to_string()))
    }

    /// Connects a container with the given last octet, or with a free one drawn from the pool.
    pub async fn connect(&self, container: &str, octet: Option<u8>) -> Result<u8, VirtualError> {
        let (octet, drawn) = self.ips()?.claim(container, octet)?;
        if let Err(error) = self
            .runtime
            .connect(&self.id, container, &self.format_ip(octet))
            .await
        {
            self.ips()?.unclaim(octet, drawn);
            return Err(error);
        }
        debug! {
            container = short_id(container),
            ip = %self.format_ip(octet),
            "connected container"
        }
        Ok(octet)
    }

    /// Disconnects a container and returns its octet to the pool.
    pub async fn disconnect(&self, container: &str) -> Result<(), VirtualError> {
        self.runtime.disconnect(&self.id, container).await?;
        self.ips()?.release(container);
        Ok(())
    }

    /// Forgets a container removed elsewhere. Its octet stays reserved so a replacement can reuse
    /// it.
    pub fn forget(&self, container: &str) -> Option<u8> {
        self.ips().ok()?.forget(container)
    }

    pub fn attached(&self) -> Vec<(u8, String)> {
        self.ips().map(|ips| ips.attached()).unwrap_or_default()
    }
}

#[async_trait]
impl Closer for Network {
    async fn close(&self) -> eyre::Result<()> {
        for (_, container) in self.attached() {
            if let Err(error) = self.runtime.disconnect(&self.id, &container).await {
                debug! {
                    ?error,
                    container = short_id(&container),
                    "unable to disconnect container"
                }
            }
            self.forget(&container);
        }

        if let Err(error) = self.runtime.remove_network(&self.id).await {
            warn! {
                ?error,
                id = short_id(&self.id),
                "unable to remove network"
            }
            return Err(error.into());
        }
        SUBNETS.release(&self.prefix);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerConfig;
    use crate::testing::FakeRuntime;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn should_pick_private_prefixes() {
        let mut rng = rand::rng();
        for _ in 0..1000 {
            let prefix = random_prefix(&mut rng);
            let parts: Vec<u8> = prefix.split('.').map(|p| p.parse().unwrap()).collect();
            assert_eq!(parts.len(), 3);
            match parts[0] {
                10 => {}
                172 => assert!((25..=30).contains(&parts[1])),
                192 => assert_eq!(parts[1], 168),
                other => panic!("unexpected range {other}"),
            }
        }
    }

    #[test]
    fn should_not_hand_out_a_prefix_twice() {
        let subnets = SubnetPool::default();
        let seen: HashSet<_> = (0..500).map(|_| subnets.get().unwrap()).collect();
        assert_eq!(seen.len(), 500);
    }

    #[test]
    fn should_keep_reserved_octets_out_of_the_pool() {
        let pool = IpPool::default();
        assert!(!pool.is_free(DHCP_OCTET));
        assert!(!pool.is_free(DNS_OCTET));
        assert!(pool.is_free(30));
        assert!(pool.is_free(254));
        assert!(!pool.is_free(255));
    }

    #[test]
    fn should_reject_octets_in_use() {
        let mut pool = IpPool::default();
        pool.claim("a", Some(DNS_OCTET)).unwrap();
        assert!(matches!(
            pool.claim("b", Some(DNS_OCTET)),
            Err(VirtualError::IpInUse(3))
        ));
        pool.forget("a");
        assert_eq!(pool.claim("b", Some(DNS_OCTET)).unwrap(), (3, false));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Connect(Option<u8>),
        Release(usize),
        Forget(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            proptest::option::of(1u8..255).prop_map(Op::Connect),
            any::<usize>().prop_map(Op::Release),
            any::<usize>().prop_map(Op::Forget),
        ]
    }

    proptest! {
        #[test]
        fn should_never_share_an_octet_between_live_containers(
            ops in proptest::collection::vec(op(), 1..200)
        ) {
            let mut pool = IpPool::default();
            let mut live: Vec<String> = Vec::new();
            for (n, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Connect(octet) => {
                        let id = format!("c{n}");
                        if pool.claim(&id, octet).is_ok() {
                            live.push(id);
                        }
                    }
                    Op::Release(idx) if !live.is_empty() => {
                        let id = live.remove(idx % live.len());
                        prop_assert!(pool.release(&id).is_some());
                    }
                    Op::Forget(idx) if !live.is_empty() => {
                        let id = live.remove(idx % live.len());
                        prop_assert!(pool.forget(&id).is_some());
                    }
                    _ => {}
                }

                let attached = pool.attached();
                prop_assert_eq!(attached.len(), live.len());
                for (octet, _) in &attached {
                    prop_assert!(!pool.is_free(*octet));
                }
            }
        }
    }

    #[tokio::test]
    async fn should_retry_overlapping_subnets() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.overlap_next_networks(2);
        let subnets = SubnetPool::default();
        let network = Network::with_subnets(runtime.clone(), &subnets)
            .await
            .unwrap();
        assert!(network.subnet().ends_with(".0/24"));
        assert_eq!(runtime.network_count(), 1);
        assert_eq!(subnets.used.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn should_return_drawn_octets_when_connecting_fails() {
        let runtime = Arc::new(FakeRuntime::default());
        let network = Network::new(runtime.clone()).await.unwrap();

        runtime.fail_next_connect();
        assert!(network.connect("missing", None).await.is_err());
        assert!(network.attached().is_empty());
        assert_eq!(network.ips().unwrap().free.len(), POOL.count());

        let ftp = runtime
            .create(&ContainerConfig {
                image: "aau/ftp".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let octet = network.connect(&ftp, None).await.unwrap();
        assert!(POOL.contains(&octet));
        assert_eq!(network.attached(), vec![(octet, ftp.clone())]);
        assert_eq!(
            runtime.ip_of(network.id(), &ftp),
            Some(network.format_ip(octet))
        );
        network.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_format_addresses_within_the_subnet() {
        let runtime = Arc::new(FakeRuntime::default());
        let network = Network::new(runtime.clone()).await.unwrap();
        let prefix = network.subnet().trim_end_matches(".0/24").to_string();
        assert_eq!(network.format_ip(3), format!("{prefix}.3"));
        assert!(network.interface().starts_with("dm-"));
        network.close().await.unwrap();
        assert_eq!(runtime.network_count(), 0);
    }
}
