// Copyright 2025 The Metalplane Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use core::str::FromStr;
use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use metalplane_error::{Code, Error, ResultExt, error_if, make_err, make_input_err};
use metalplane_util::network::PrefixUsage;
use parking_lot::Mutex;
use tracing::{Level, event};

/// Prefix and address allocation. Implementations are safe to call
/// concurrently and treat each call as atomic.
#[async_trait]
pub trait Ipam: Send + Sync {
    async fn create_prefix(&self, cidr: &str) -> Result<(), Error>;

    /// Fails with `Code::FailedPrecondition` while addresses or child
    /// prefixes are still allocated from `cidr`.
    async fn delete_prefix(&self, cidr: &str) -> Result<(), Error>;

    /// Carves the first free child prefix of `length` out of `parent`.
    async fn allocate_child_prefix(&self, parent: &str, length: u8) -> Result<String, Error>;

    async fn release_child_prefix(&self, child: &str) -> Result<(), Error>;

    /// Allocates the first free address of `prefix`.
    async fn allocate_ip(&self, prefix: &str) -> Result<String, Error>;

    /// Fails with `Code::AlreadyExists` if `address` is taken.
    async fn allocate_specific_ip(&self, prefix: &str, address: &str) -> Result<String, Error>;

    /// Fails with `Code::NotFound` if `address` is not allocated.
    async fn release_ip(&self, address: &str) -> Result<(), Error>;

    async fn prefix_usage(&self, cidr: &str) -> Result<PrefixUsage, Error>;
}

#[derive(Debug)]
struct PrefixState {
    network: IpNetwork,
    parent: Option<String>,
    ips: BTreeSet<IpAddr>,
    children: BTreeSet<String>,
}

fn parse_prefix(cidr: &str) -> Result<IpNetwork, Error> {
    let network = IpNetwork::from_str(cidr).err_tip(|| format!("Parsing prefix {cidr}"))?;
    error_if!(
        network.ip() != network.network(),
        "Prefix {cidr} has host bits set"
    );
    Ok(network)
}

const fn bits(network: &IpNetwork) -> u8 {
    match network {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    }
}

fn to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn from_u128(value: u128, v4: bool) -> Result<IpAddr, Error> {
    if v4 {
        Ok(IpAddr::V4(Ipv4Addr::from(u32::try_from(value)?)))
    } else {
        Ok(IpAddr::V6(Ipv6Addr::from(value)))
    }
}

/// `2^exp`, saturating for a full IPv6 range.
fn block(exp: u8) -> u128 {
    1u128.checked_shl(u32::from(exp)).unwrap_or(u128::MAX)
}

/// First and last address that may be handed out to hosts.
fn host_range(network: &IpNetwork) -> (u128, u128) {
    let first = to_u128(network.network());
    let size = block(bits(network) - network.prefix());
    let last = first.saturating_add(size - 1);
    if network.is_ipv4() && network.prefix() < 31 {
        // Skip network and broadcast address.
        (first + 1, last - 1)
    } else {
        (first, last)
    }
}

/// In memory prefix bookkeeping.
#[derive(Debug, Default)]
pub struct MemoryIpam {
    prefixes: Mutex<BTreeMap<String, PrefixState>>,
}

impl MemoryIpam {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_prefix(
        prefixes: &mut BTreeMap<String, PrefixState>,
        network: IpNetwork,
        parent: Option<String>,
    ) -> Result<String, Error> {
        let cidr = network.to_string();
        if prefixes.contains_key(&cidr) {
            return Err(make_err!(Code::AlreadyExists, "Prefix {cidr} already exists"));
        }
        prefixes.insert(
            cidr.clone(),
            PrefixState {
                network,
                parent,
                ips: BTreeSet::new(),
                children: BTreeSet::new(),
            },
        );
        Ok(cidr)
    }

    fn remove_prefix(
        prefixes: &mut BTreeMap<String, PrefixState>,
        cidr: &str,
    ) -> Result<(), Error> {
        let state = prefixes
            .get(cidr)
            .ok_or_else(|| make_err!(Code::NotFound, "Prefix {cidr} not found"))?;
        if !state.ips.is_empty() || !state.children.is_empty() {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Prefix {cidr} still has {} addresses and {} child prefixes allocated",
                state.ips.len(),
                state.children.len()
            ));
        }
        let parent = state.parent.clone();
        prefixes.remove(cidr);
        if let Some(parent) = parent.and_then(|parent| prefixes.get_mut(&parent)) {
            parent.children.remove(cidr);
        }
        Ok(())
    }
}

#[async_trait]
impl Ipam for MemoryIpam {
    async fn create_prefix(&self, cidr: &str) -> Result<(), Error> {
        let network = parse_prefix(cidr)?;
        Self::insert_prefix(&mut self.prefixes.lock(), network, None)?;
        Ok(())
    }

    async fn delete_prefix(&self, cidr: &str) -> Result<(), Error> {
        let network = parse_prefix(cidr)?;
        Self::remove_prefix(&mut self.prefixes.lock(), &network.to_string())
    }

    async fn allocate_child_prefix(&self, parent: &str, length: u8) -> Result<String, Error> {
        let parent_network = parse_prefix(parent)?;
        let parent_cidr = parent_network.to_string();
        let mut prefixes = self.prefixes.lock();
        let state = prefixes
            .get(&parent_cidr)
            .ok_or_else(|| make_err!(Code::NotFound, "Prefix {parent_cidr} not found"))?;
        error_if!(
            length <= parent_network.prefix() || length > bits(&parent_network),
            "Child prefix length {length} does not fit into {parent_cidr}"
        );

        let children = state
            .children
            .iter()
            .filter_map(|child| prefixes.get(child).map(|c| c.network))
            .collect::<Vec<_>>();
        let step = block(bits(&parent_network) - length);
        let count = block(length - parent_network.prefix());
        let base = to_u128(parent_network.network());
        let v4 = parent_network.is_ipv4();
        let mut found = None;
        for idx in 0..count {
            let candidate = IpNetwork::new(from_u128(base + idx * step, v4)?, length)?;
            let overlaps_child = children.iter().any(|child| {
                child.contains(candidate.network()) || candidate.contains(child.network())
            });
            let overlaps_ip = state.ips.iter().any(|ip| candidate.contains(*ip));
            if !overlaps_child && !overlaps_ip {
                found = Some(candidate);
                break;
            }
        }
        let child = found.ok_or_else(|| {
            make_err!(
                Code::ResourceExhausted,
                "No free /{length} child prefix left in {parent_cidr}"
            )
        })?;
        let child_cidr = Self::insert_prefix(&mut prefixes, child, Some(parent_cidr.clone()))?;
        if let Some(parent) = prefixes.get_mut(&parent_cidr) {
            parent.children.insert(child_cidr.clone());
        }
        event!(Level::DEBUG, parent = %parent_cidr, child = %child_cidr, "Allocated child prefix");
        Ok(child_cidr)
    }

    async fn release_child_prefix(&self, child: &str) -> Result<(), Error> {
        let network = parse_prefix(child)?;
        let cidr = network.to_string();
        let mut prefixes = self.prefixes.lock();
        let is_child = prefixes
            .get(&cidr)
            .is_some_and(|state| state.parent.is_some());
        error_if!(
            !is_child && prefixes.contains_key(&cidr),
            "Prefix {cidr} is not a child prefix"
        );
        Self::remove_prefix(&mut prefixes, &cidr)
    }

    async fn allocate_ip(&self, prefix: &str) -> Result<String, Error> {
        let network = parse_prefix(prefix)?;
        let cidr = network.to_string();
        let mut prefixes = self.prefixes.lock();
        let children = prefixes
            .get(&cidr)
            .ok_or_else(|| make_err!(Code::NotFound, "Prefix {cidr} not found"))?
            .children
            .iter()
            .filter_map(|child| prefixes.get(child).map(|c| c.network))
            .collect::<Vec<_>>();
        let state = prefixes
            .get_mut(&cidr)
            .ok_or_else(|| make_err!(Code::NotFound, "Prefix {cidr} not found"))?;
        let (first, last) = host_range(&network);
        let mut candidate = first;
        while candidate <= last {
            let addr = from_u128(candidate, network.is_ipv4())?;
            if let Some(child) = children.iter().find(|child| child.contains(addr)) {
                // Addresses of child prefixes belong to the child.
                let child_last =
                    to_u128(child.network()) + (block(bits(child) - child.prefix()) - 1);
                candidate = child_last.saturating_add(1);
                continue;
            }
            if state.ips.insert(addr) {
                return Ok(addr.to_string());
            }
            candidate += 1;
        }
        Err(make_err!(
            Code::ResourceExhausted,
            "No free address left in prefix {cidr}"
        ))
    }

    async fn allocate_specific_ip(&self, prefix: &str, address: &str) -> Result<String, Error> {
        let network = parse_prefix(prefix)?;
        let cidr = network.to_string();
        let addr = IpAddr::from_str(address).err_tip(|| format!("Parsing address {address}"))?;
        let (first, last) = host_range(&network);
        let value = to_u128(addr);
        if addr.is_ipv4() != network.is_ipv4() || value < first || value > last {
            return Err(make_input_err!("Address {address} is not usable in prefix {cidr}"));
        }
        let mut prefixes = self.prefixes.lock();
        let state = prefixes
            .get_mut(&cidr)
            .ok_or_else(|| make_err!(Code::NotFound, "Prefix {cidr} not found"))?;
        if !state.ips.insert(addr) {
            return Err(make_err!(
                Code::AlreadyExists,
                "Address {address} is already allocated in {cidr}"
            ));
        }
        Ok(addr.to_string())
    }

    async fn release_ip(&self, address: &str) -> Result<(), Error> {
        let addr = IpAddr::from_str(address).err_tip(|| format!("Parsing address {address}"))?;
        let mut prefixes = self.prefixes.lock();
        let released = prefixes
            .values_mut()
            .filter(|state| state.network.contains(addr))
            .any(|state| state.ips.remove(&addr));
        if !released {
            return Err(make_err!(
                Code::NotFound,
                "Address {address} is not allocated"
            ));
        }
        Ok(())
    }

    async fn prefix_usage(&self, cidr: &str) -> Result<PrefixUsage, Error> {
        let network = parse_prefix(cidr)?;
        let cidr = network.to_string();
        let prefixes = self.prefixes.lock();
        let state = prefixes
            .get(&cidr)
            .ok_or_else(|| make_err!(Code::NotFound, "Prefix {cidr} not found"))?;
        let (first, last) = host_range(&network);
        let usable = last.saturating_sub(first).saturating_add(1);
        let used_ips = state.ips.len() as u128;

        let children = state
            .children
            .iter()
            .filter_map(|child| prefixes.get(child).map(|c| c.network))
            .collect::<Vec<_>>();
        let available_prefixes = children
            .iter()
            .map(IpNetwork::prefix)
            .max()
            .map_or(0, |longest| {
                let total = block(longest - network.prefix());
                let covered = children
                    .iter()
                    .map(|child| block(longest - child.prefix()))
                    .fold(0u128, u128::saturating_add);
                total.saturating_sub(covered)
            });

        Ok(PrefixUsage {
            available_ips: usable.saturating_sub(used_ips),
            used_ips,
            available_prefixes,
            used_prefixes: children.len() as u128,
        })
    }
}
