use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::host::RemoteHost;
use crate::topology::{CapacityTargets, ClusterTopology, Role, RoleSet};

/// Remote directory the playbooks archive is extracted into, `~`-relative so
/// it lands in the ops account's home.
pub const PLAYBOOKS_DIR: &str = "~/.playbooks";
/// Inventory file name generated under the playbooks directory.
pub const INVENTORY_NAME: &str = "trustchain-nodes";

const DEFAULT_RESOURCES_DIR: &str = "resources";

/// Chain, ops and explorer settings written into the automation variables
/// file. Every field has the product default and can be overridden from the
/// plan file's `chain` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub peer_port: String,
    pub rpc_port: String,
    pub proxy_app: String,
    pub chain_home: String,
    pub crypto_with_sm2: bool,
    pub es_port: String,
    pub monitor_home: String,
    pub kibana_port: String,
    pub explorer_port: String,
    pub explorer_home: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            peer_port: "26656".to_string(),
            rpc_port: "26657".to_string(),
            proxy_app: "kvstore".to_string(),
            chain_home: "~/.trustchain".to_string(),
            crypto_with_sm2: true,
            es_port: "9200".to_string(),
            monitor_home: "~/.monitor".to_string(),
            kibana_port: "5601".to_string(),
            explorer_port: "8080".to_string(),
            explorer_home: "~/.explorer".to_string(),
        }
    }
}

/// Local offline archives shipped with the tool plus the remote layout they
/// are installed into.
#[derive(Debug, Clone)]
pub struct Resources {
    pub playbooks_archive: PathBuf,
    pub ansible_rpms_archive: PathBuf,
    pub sshpass_rpms_archive: PathBuf,
    pub playbooks_dir: String,
    pub inventory_name: String,
}

impl Resources {
    pub fn from_dir(dir: &Path) -> Self {
        Self {
            playbooks_archive: dir.join("playbooks.tar.gz"),
            ansible_rpms_archive: dir.join("rpm_ansible.tar.gz"),
            sshpass_rpms_archive: dir.join("rpm_sshpass.tar.gz"),
            playbooks_dir: env_string("CHAINCTL_PLAYBOOKS_DIR", PLAYBOOKS_DIR),
            inventory_name: INVENTORY_NAME.to_string(),
        }
    }
}

/// Which preset fills the capacity targets; `custom` reads them from the
/// plan's `custom` section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaChoice {
    #[default]
    TestSingle,
    TestFour,
    ProdFour,
    Custom,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostEntry {
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub note: String,
    pub roles: Vec<Role>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_username() -> String {
    "root".to_string()
}

/// The deployment plan file: schema choice, host entries with their roles,
/// and optional configuration overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployPlan {
    #[serde(default)]
    pub schema: SchemaChoice,
    #[serde(default)]
    pub custom: Option<CapacityTargets>,
    pub hosts: Vec<HostEntry>,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub resources_dir: Option<PathBuf>,
}

impl DeployPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plan file {}", path.display()))?;
        let plan: DeployPlan = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse plan file {}", path.display()))?;
        Ok(plan)
    }

    pub fn targets(&self) -> Result<CapacityTargets> {
        Ok(match self.schema {
            SchemaChoice::TestSingle => CapacityTargets::test_single(),
            SchemaChoice::TestFour => CapacityTargets::test_four(),
            SchemaChoice::ProdFour => CapacityTargets::prod_four(),
            SchemaChoice::Custom => self
                .custom
                .context("a custom schema needs a \"custom\" section with role counts")?,
        })
    }

    pub fn hosts(&self) -> Result<Vec<RemoteHost>> {
        let mut hosts = Vec::new();
        for entry in &self.hosts {
            let address = entry.address.trim();
            if address.is_empty() {
                bail!("a host entry is missing its address");
            }
            let roles: RoleSet = entry.roles.iter().copied().collect();
            if roles.is_empty() {
                bail!("host {address} has no roles assigned");
            }
            hosts.push(
                RemoteHost::new(
                    address,
                    entry.username.trim(),
                    entry.password.clone(),
                    entry.ssh_port,
                    entry.note.trim(),
                )
                .with_roles(roles),
            );
        }
        Ok(hosts)
    }

    pub fn topology_from(&self, hosts: Vec<RemoteHost>) -> Result<ClusterTopology> {
        let mut topology = ClusterTopology::new(self.targets()?);
        for host in hosts {
            topology.upsert_host(host);
        }
        Ok(topology)
    }

    pub fn build_topology(&self) -> Result<ClusterTopology> {
        let hosts = self.hosts()?;
        self.topology_from(hosts)
    }

    /// Resource directory resolution order: CLI flag, `CHAINCTL_RESOURCES_DIR`,
    /// the plan file, then the bundled default.
    pub fn resources(&self, cli_override: Option<&Path>) -> Resources {
        let dir = cli_override
            .map(Path::to_path_buf)
            .or_else(|| env_optional_string("CHAINCTL_RESOURCES_DIR").map(PathBuf::from))
            .or_else(|| self.resources_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RESOURCES_DIR));
        Resources::from_dir(&dir)
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Role;

    const PLAN: &str = r#"
    {
        "schema": "test-single",
        "hosts": [
            {
                "address": "10.0.0.1",
                "password": "secret",
                "note": "ops",
                "roles": ["validator", "ops-master", "explorer"]
            }
        ],
        "chain": { "peer_port": "26700", "crypto_with_sm2": false }
    }
    "#;

    #[test]
    fn plan_parses_with_defaults() {
        let plan: DeployPlan = serde_json::from_str(PLAN).expect("parse plan");
        assert_eq!(plan.schema, SchemaChoice::TestSingle);
        assert_eq!(plan.hosts[0].ssh_port, 22);
        assert_eq!(plan.hosts[0].username, "root");
        assert_eq!(plan.chain.peer_port, "26700");
        assert!(!plan.chain.crypto_with_sm2);
        // Untouched fields keep the product defaults.
        assert_eq!(plan.chain.rpc_port, "26657");
        assert_eq!(plan.chain.chain_home, "~/.trustchain");
    }

    #[test]
    fn plan_builds_a_satisfied_topology() {
        let plan: DeployPlan = serde_json::from_str(PLAN).expect("parse plan");
        let topology = plan.build_topology().expect("build topology");
        assert!(topology.schema_satisfied());
        assert_eq!(topology.first_ops_address().as_deref(), Some("10.0.0.1"));
        assert_eq!(topology.first_validator_address(), Some("10.0.0.1"));
        assert_eq!(topology.role_count(Role::Explorer), 1);
    }

    #[test]
    fn custom_schema_requires_counts() {
        let plan: DeployPlan = serde_json::from_str(
            r#"{ "schema": "custom", "hosts": [] }"#,
        )
        .expect("parse plan");
        assert!(plan.targets().is_err());

        let plan: DeployPlan = serde_json::from_str(
            r#"{ "schema": "custom", "custom": { "validators": 2, "ops": 1 }, "hosts": [] }"#,
        )
        .expect("parse plan");
        let targets = plan.targets().expect("targets");
        assert_eq!(targets.validators, 2);
        assert_eq!(targets.ops, 1);
        assert_eq!(targets.explorers, 0);
    }

    #[test]
    fn host_entries_need_an_address_and_a_role() {
        let plan: DeployPlan = serde_json::from_str(
            r#"{ "hosts": [ { "address": " ", "password": "x", "roles": ["validator"] } ] }"#,
        )
        .expect("parse plan");
        assert!(plan.hosts().is_err());

        let plan: DeployPlan = serde_json::from_str(
            r#"{ "hosts": [ { "address": "10.0.0.1", "password": "x", "roles": [] } ] }"#,
        )
        .expect("parse plan");
        assert!(plan.hosts().is_err());
    }

    #[test]
    fn load_reads_a_plan_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("plan.json");
        std::fs::write(&path, PLAN)?;
        let plan = DeployPlan::load(&path)?;
        assert_eq!(plan.hosts.len(), 1);
        assert_eq!(plan.hosts[0].address, "10.0.0.1");
        Ok(())
    }

    #[test]
    fn load_names_the_file_when_it_is_missing() {
        let err = DeployPlan::load(Path::new("/nonexistent/plan.json")).unwrap_err();
        assert!(err.to_string().contains("plan.json"));
    }

    #[test]
    fn resources_resolve_from_the_plan_directory() {
        let plan: DeployPlan = serde_json::from_str(
            r#"{ "hosts": [], "resources_dir": "/opt/chainctl/resources" }"#,
        )
        .expect("parse plan");
        let resources = plan.resources(None);
        assert_eq!(
            resources.playbooks_archive,
            PathBuf::from("/opt/chainctl/resources/playbooks.tar.gz")
        );
        assert_eq!(resources.inventory_name, "trustchain-nodes");

        let resources = plan.resources(Some(Path::new("/tmp/res")));
        assert_eq!(
            resources.sshpass_rpms_archive,
            PathBuf::from("/tmp/res/rpm_sshpass.tar.gz")
        );
    }
}
