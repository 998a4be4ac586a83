use serde::Deserialize;
use std::collections::HashMap;

use crate::host::RemoteHost;

/// A deployable responsibility a host may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Validator,
    NonValidator,
    Explorer,
    OpsMaster,
    OpsWorker,
    CaServer,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Validator,
        Role::NonValidator,
        Role::Explorer,
        Role::OpsMaster,
        Role::OpsWorker,
        Role::CaServer,
    ];

    fn bit(self) -> u8 {
        match self {
            Role::Validator => 1,
            Role::NonValidator => 1 << 1,
            Role::Explorer => 1 << 2,
            Role::OpsMaster => 1 << 3,
            Role::OpsWorker => 1 << 4,
            Role::CaServer => 1 << 5,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Role::Validator => "validator",
            Role::NonValidator => "non-validator",
            Role::Explorer => "explorer",
            Role::OpsMaster => "ops-master",
            Role::OpsWorker => "ops-worker",
            Role::CaServer => "ca-server",
        }
    }
}

/// The set of roles assigned to one host. Validator and non-validator are
/// mutually exclusive; assigning one clears the other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleSet(u8);

impl RoleSet {
    pub fn insert(&mut self, role: Role) {
        match role {
            Role::Validator => self.0 &= !Role::NonValidator.bit(),
            Role::NonValidator => self.0 &= !Role::Validator.bit(),
            _ => {}
        }
        self.0 |= role.bit();
    }

    pub fn remove(&mut self, role: Role) {
        self.0 &= !role.bit();
    }

    pub fn contains(&self, role: Role) -> bool {
        self.0 & role.bit() == role.bit()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Role> + '_ {
        Role::ALL.into_iter().filter(|role| self.contains(*role))
    }
}

impl FromIterator<Role> for RoleSet {
    fn from_iter<T: IntoIterator<Item = Role>>(iter: T) -> Self {
        let mut set = RoleSet::default();
        for role in iter {
            set.insert(role);
        }
        set
    }
}

/// How many hosts each role bucket must hold for the schema to be met.
/// The ops target covers ops-master and ops-worker combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CapacityTargets {
    pub validators: usize,
    pub non_validators: usize,
    pub explorers: usize,
    pub ops: usize,
    pub ca_servers: usize,
}

impl CapacityTargets {
    /// Single validator test cluster.
    pub fn test_single() -> Self {
        Self {
            validators: 1,
            non_validators: 0,
            explorers: 1,
            ops: 1,
            ca_servers: 0,
        }
    }

    /// Four validator test cluster.
    pub fn test_four() -> Self {
        Self {
            validators: 4,
            non_validators: 0,
            explorers: 1,
            ops: 1,
            ca_servers: 0,
        }
    }

    /// Four validator production cluster with a three-node ops tier.
    pub fn prod_four() -> Self {
        Self {
            validators: 4,
            non_validators: 0,
            explorers: 1,
            ops: 3,
            ca_servers: 0,
        }
    }
}

/// Role-to-host assignment plus the capacity targets each role must meet.
///
/// Buckets keep insertion order; a host's address is its natural key and
/// re-inserting an address replaces the prior entry everywhere.
#[derive(Debug, Default)]
pub struct ClusterTopology {
    targets: CapacityTargets,
    validators: Vec<String>,
    non_validators: Vec<String>,
    explorers: Vec<String>,
    ops_masters: Vec<String>,
    ops_workers: Vec<String>,
    ca_servers: Vec<String>,
    hosts: HashMap<String, RemoteHost>,
}

impl ClusterTopology {
    pub fn new(targets: CapacityTargets) -> Self {
        Self {
            targets,
            ..Self::default()
        }
    }

    pub fn targets(&self) -> CapacityTargets {
        self.targets
    }

    pub fn set_targets(&mut self, targets: CapacityTargets) {
        self.targets = targets;
    }

    fn bucket(&self, role: Role) -> &Vec<String> {
        match role {
            Role::Validator => &self.validators,
            Role::NonValidator => &self.non_validators,
            Role::Explorer => &self.explorers,
            Role::OpsMaster => &self.ops_masters,
            Role::OpsWorker => &self.ops_workers,
            Role::CaServer => &self.ca_servers,
        }
    }

    fn bucket_mut(&mut self, role: Role) -> &mut Vec<String> {
        match role {
            Role::Validator => &mut self.validators,
            Role::NonValidator => &mut self.non_validators,
            Role::Explorer => &mut self.explorers,
            Role::OpsMaster => &mut self.ops_masters,
            Role::OpsWorker => &mut self.ops_workers,
            Role::CaServer => &mut self.ca_servers,
        }
    }

    /// Removes any prior entry for the host's address, then inserts the host
    /// into every bucket matching its current roles.
    pub fn upsert_host(&mut self, host: RemoteHost) {
        let address = host.address().to_string();
        self.remove_host(&address);
        for role in host.roles().iter() {
            self.bucket_mut(role).push(address.clone());
        }
        self.hosts.insert(address, host);
    }

    /// Removes the address from every bucket; a no-op for unknown addresses.
    pub fn remove_host(&mut self, address: &str) {
        for role in Role::ALL {
            self.bucket_mut(role).retain(|entry| entry != address);
        }
        self.hosts.remove(address);
    }

    pub fn host(&self, address: &str) -> Option<&RemoteHost> {
        self.hosts.get(address)
    }

    pub fn host_mut(&mut self, address: &str) -> Option<&mut RemoteHost> {
        self.hosts.get_mut(address)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn role_count(&self, role: Role) -> usize {
        self.bucket(role).len()
    }

    /// Hosts holding the role, in bucket insertion order.
    pub fn hosts_in(&self, role: Role) -> impl Iterator<Item = &RemoteHost> + '_ {
        self.bucket(role)
            .iter()
            .filter_map(|address| self.hosts.get(address))
    }

    /// The control point from which automation operations are launched.
    pub fn first_ops_address(&self) -> Option<String> {
        self.ops_masters.first().cloned()
    }

    pub fn first_validator_address(&self) -> Option<&str> {
        self.validators.first().map(String::as_str)
    }

    pub fn has_enough_validators(&self) -> bool {
        self.validators.len() == self.targets.validators
    }

    pub fn has_enough_non_validators(&self) -> bool {
        self.non_validators.len() == self.targets.non_validators
    }

    pub fn has_enough_explorers(&self) -> bool {
        self.explorers.len() == self.targets.explorers
    }

    pub fn has_enough_ops(&self) -> bool {
        self.ops_masters.len() + self.ops_workers.len() == self.targets.ops
    }

    pub fn has_enough_ca_servers(&self) -> bool {
        self.ca_servers.len() == self.targets.ca_servers
    }

    pub fn schema_satisfied(&self) -> bool {
        self.has_enough_validators()
            && self.has_enough_non_validators()
            && self.has_enough_explorers()
            && self.has_enough_ops()
            && self.has_enough_ca_servers()
    }

    /// Releases every host's SSH resources; called when a pipeline run ends.
    pub fn close_all(&mut self) {
        for host in self.hosts.values_mut() {
            host.close();
        }
    }
}
