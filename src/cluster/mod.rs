// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cluster's fixed roster of machines and how they are provisioned.

use std::{fmt, net::Ipv4Addr, str::FromStr};

use anyhow::Context as _;
use ipnetwork::Ipv4Network;

pub mod hypervisor;
pub mod provision;
pub mod summary;

/// The job a machine does in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Controller,
    /// A worker, numbered from 1.
    Worker(u8),
    /// Exports shared storage to the other nodes over NFS.
    Storage,
}

impl NodeRole {
    /// Roster order: the controller, two workers, then the storage node.
    pub const ROSTER: [NodeRole; 4] = [
        NodeRole::Controller,
        NodeRole::Worker(1),
        NodeRole::Worker(2),
        NodeRole::Storage,
    ];

    /// Packages installed on first boot in addition to the base system.
    pub fn packages(&self) -> Vec<String> {
        let packages: &[&str] = match self {
            NodeRole::Controller => &[],
            NodeRole::Worker(_) => &["nfs-common"],
            NodeRole::Storage => &["nfs-kernel-server"],
        };
        packages.iter().map(|p| p.to_string()).collect()
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Controller => write!(f, "controller"),
            NodeRole::Worker(n) => write!(f, "worker-{n}"),
            NodeRole::Storage => write!(f, "storage"),
        }
    }
}

/// Memory, vCPUs, and primary disk size for a machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceAllocation {
    pub memory_mib: u32,
    pub cpus: u32,
    pub disk_mib: u32,
}

impl ResourceAllocation {
    pub const CONTROLLER: Self =
        Self { memory_mib: 4096, cpus: 2, disk_mib: 20480 };
    pub const WORKER: Self = Self { memory_mib: 2048, cpus: 2, disk_mib: 20480 };
    pub const STORAGE: Self =
        Self { memory_mib: 2048, cpus: 1, disk_mib: 40960 };
}

impl fmt::Display for ResourceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.memory_mib, self.cpus, self.disk_mib)
    }
}

/// Parses `MEMORY_MIB:CPUS:DISK_MIB`, e.g. `4096:2:20480`.
impl FromStr for ResourceAllocation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        let [memory, cpus, disk] = fields.as_slice() else {
            anyhow::bail!(
                "expected MEMORY_MIB:CPUS:DISK_MIB, got '{s}'"
            );
        };

        let parse = |what: &str, v: &str| -> anyhow::Result<u32> {
            let n: u32 = v
                .parse()
                .with_context(|| format!("invalid {what} '{v}' in '{s}'"))?;
            anyhow::ensure!(n > 0, "{what} in '{s}' must be positive");
            Ok(n)
        };

        Ok(Self {
            memory_mib: parse("memory", memory)?,
            cpus: parse("vCPU count", cpus)?,
            disk_mib: parse("disk size", disk)?,
        })
    }
}

/// The isolated host-only network the nodes talk to each other on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterNetwork {
    pub cidr: Ipv4Network,
    /// The host's address on the network.
    pub gateway: Ipv4Addr,
    /// Host number of the first node; node `i` in roster order gets
    /// `base_offset + i`.
    pub base_offset: u32,
}

impl ClusterNetwork {
    pub fn new(
        cidr: Ipv4Network,
        gateway: Ipv4Addr,
        base_offset: u32,
    ) -> anyhow::Result<Self> {
        if !cidr.contains(gateway) {
            anyhow::bail!("gateway {gateway} is outside {cidr}");
        }

        Ok(Self { cidr, gateway, base_offset })
    }

    /// The address of the node at `index` in roster order.
    pub fn address_for(&self, index: usize) -> anyhow::Result<Ipv4Addr> {
        let host = u32::try_from(index)
            .ok()
            .and_then(|i| i.checked_add(self.base_offset))
            .with_context(|| format!("node index {index} is out of range"))?;
        let addr = u32::from(self.cidr.network())
            .checked_add(host)
            .map(Ipv4Addr::from)
            .with_context(|| format!("host {host} overflows {}", self.cidr))?;

        if !self.cidr.contains(addr)
            || addr == self.cidr.network()
            || addr == self.cidr.broadcast()
        {
            anyhow::bail!(
                "no usable address for node {index} in {}: host offset {host} \
                is outside the network",
                self.cidr
            );
        }

        if addr == self.gateway {
            anyhow::bail!(
                "address {addr} for node {index} collides with the gateway"
            );
        }

        Ok(addr)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.cidr.mask()
    }
}

/// One machine in the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSpec {
    pub role: NodeRole,
    /// VM name and guest hostname.
    pub name: String,
    pub resources: ResourceAllocation,
    /// Static address on the cluster network, with its prefix.
    pub address: Ipv4Network,
    pub packages: Vec<String>,
}

/// Per-role resources, normally from the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoleResources {
    pub controller: ResourceAllocation,
    pub worker: ResourceAllocation,
    pub storage: ResourceAllocation,
}

impl RoleResources {
    pub fn for_role(&self, role: NodeRole) -> ResourceAllocation {
        match role {
            NodeRole::Controller => self.controller,
            NodeRole::Worker(_) => self.worker,
            NodeRole::Storage => self.storage,
        }
    }
}

impl Default for RoleResources {
    fn default() -> Self {
        Self {
            controller: ResourceAllocation::CONTROLLER,
            worker: ResourceAllocation::WORKER,
            storage: ResourceAllocation::STORAGE,
        }
    }
}

/// Longest hostname label a resolver accepts.
const MAX_HOSTNAME_LEN: usize = 63;

/// Fails unless `name` is usable as a single hostname label: ASCII letters,
/// digits and hyphens, not starting or ending with a hyphen.
fn check_hostname(name: &str) -> anyhow::Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_HOSTNAME_LEN
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if !valid {
        anyhow::bail!(
            "{name:?} is not a valid hostname; use at most \
            {MAX_HOSTNAME_LEN} letters, digits and inner hyphens"
        );
    }

    Ok(())
}

/// Builds the roster: every role in roster order, named `<prefix>-<role>`.
/// Node names double as hostnames, so the prefix must keep them valid.
pub fn roster(
    name_prefix: &str,
    resources: &RoleResources,
    network: &ClusterNetwork,
) -> anyhow::Result<Vec<NodeSpec>> {
    NodeRole::ROSTER
        .iter()
        .enumerate()
        .map(|(i, role)| {
            let name = format!("{name_prefix}-{role}");
            check_hostname(&name)
                .with_context(|| format!("name prefix {name_prefix:?}"))?;
            let ip = network.address_for(i)?;
            let address = Ipv4Network::new(ip, network.cidr.prefix())
                .with_context(|| format!("address for {role}"))?;
            Ok(NodeSpec {
                role: *role,
                name,
                resources: resources.for_role(*role),
                address,
                packages: role.packages(),
            })
        })
        .collect()
}
