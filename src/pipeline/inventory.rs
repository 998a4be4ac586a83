use crate::config::ChainConfig;
use crate::host::RemoteHost;
use crate::topology::{ClusterTopology, Role};

/// Builds the single shell command that writes the ansible inventory on the
/// ops host. Sections follow bucket insertion order; chain nodes are named
/// `tcnode<i>` with one index running across validators then non-validators,
/// other sections use the host note (or the address when the note is empty).
pub(super) fn inventory_command(topology: &ClusterTopology, inventory_path: &str) -> String {
    let mut command = format!("echo \"[validators]\" > {inventory_path}");
    let mut index = 0usize;
    for host in topology.hosts_in(Role::Validator) {
        command.push_str(&append_line(&host_line(&format!("tcnode{index}"), host), inventory_path));
        index += 1;
    }

    command.push_str(&append_section("nonvalidators", inventory_path));
    for host in topology.hosts_in(Role::NonValidator) {
        command.push_str(&append_line(&host_line(&format!("tcnode{index}"), host), inventory_path));
        index += 1;
    }

    for (section, role) in [
        ("explorer", Role::Explorer),
        ("ops-master", Role::OpsMaster),
        ("ops-worker", Role::OpsWorker),
        ("ca-server", Role::CaServer),
    ] {
        command.push_str(&append_section(section, inventory_path));
        for host in topology.hosts_in(role) {
            let name = if host.note().is_empty() {
                host.address()
            } else {
                host.note()
            };
            command.push_str(&append_line(&host_line(name, host), inventory_path));
        }
    }

    command.push_str(&format!(
        " && echo -e \"\\n[ops:children]\\nops-master\\nops-worker\\n\\n[chainnodes:children]\\nvalidators\\nnonvalidators\" >> {inventory_path}"
    ));
    command
}

fn append_section(section: &str, inventory_path: &str) -> String {
    format!(" && echo -e \"\\n[{section}]\" >> {inventory_path}")
}

fn append_line(line: &str, inventory_path: &str) -> String {
    format!(" && echo \"{line}\" >> {inventory_path}")
}

fn host_line(name: &str, host: &RemoteHost) -> String {
    format!(
        "{name} ansible_ssh_host={} ansible_ssh_user={} ansible_ssh_port={} ansible_ssh_pass={}",
        host.address(),
        host.username(),
        host.ssh_port(),
        host.password(),
    )
}

/// Builds the chained `sed` command that rewrites the fixed keys of
/// `group_vars/all` in place. The three `*_home` keys keep the file's
/// spaced-colon form; home paths are expanded through the ops account.
pub(super) fn group_vars_command(
    config: &ChainConfig,
    ops: &RemoteHost,
    validator_address: &str,
    group_vars_path: &str,
) -> String {
    let sm2 = if config.crypto_with_sm2 { "true" } else { "false" };
    let assignments = [
        format!("peer_port: \"{}\"", config.peer_port),
        format!("rpc_port: \"{}\"", config.rpc_port),
        format!("proxy_app: \"{}\"", config.proxy_app),
        format!("chain_home : \"{}\"", ops.resolve_home_path(&config.chain_home)),
        format!("es_host: \"{}\"", ops.address()),
        format!("es_port: \"{}\"", config.es_port),
        format!("monitor_home : \"{}\"", ops.resolve_home_path(&config.monitor_home)),
        format!("kibana_port: \"{}\"", config.kibana_port),
        format!("explorer_home : \"{}\"", ops.resolve_home_path(&config.explorer_home)),
        format!("explorer_port: \"{}\"", config.explorer_port),
        format!("explorer_connect_host: \"{validator_address}\""),
        format!("crypto_with_sm2: \"{sm2}\""),
    ];
    assignments
        .iter()
        .map(|assignment| {
            let key_prefix = &assignment[..assignment.find('"').unwrap_or(assignment.len())];
            format!("sed -i '/^{key_prefix}/c\\{assignment}' {group_vars_path}")
        })
        .collect::<Vec<_>>()
        .join(" && ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{CapacityTargets, RoleSet};

    fn host(address: &str, note: &str, roles: &[Role]) -> RemoteHost {
        RemoteHost::new(address, "root", "pw", 22, note)
            .with_roles(roles.iter().copied().collect::<RoleSet>())
    }

    fn sample_topology() -> ClusterTopology {
        let mut topology = ClusterTopology::new(CapacityTargets::test_four());
        topology.upsert_host(host("10.0.0.2", "", &[Role::Validator]));
        topology.upsert_host(host("10.0.0.1", "", &[Role::Validator]));
        topology.upsert_host(host("10.0.0.3", "monitor", &[Role::OpsMaster, Role::Explorer]));
        topology.upsert_host(host("10.0.0.4", "", &[Role::NonValidator]));
        topology
    }

    #[test]
    fn inventory_names_chain_nodes_with_one_running_index() {
        let command = inventory_command(&sample_topology(), "/root/.playbooks/trustchain-nodes");

        assert!(command.starts_with("echo \"[validators]\" > /root/.playbooks/trustchain-nodes"));
        // Insertion order, not address order.
        assert!(command.contains(
            "tcnode0 ansible_ssh_host=10.0.0.2 ansible_ssh_user=root ansible_ssh_port=22 ansible_ssh_pass=pw"
        ));
        assert!(command.contains("tcnode1 ansible_ssh_host=10.0.0.1"));
        // The non-validator continues the index.
        assert!(command.contains("tcnode2 ansible_ssh_host=10.0.0.4"));
    }

    #[test]
    fn inventory_uses_notes_for_non_chain_sections() {
        let command = inventory_command(&sample_topology(), "/root/.playbooks/trustchain-nodes");
        assert!(command.contains("[ops-master]"));
        assert!(command.contains("monitor ansible_ssh_host=10.0.0.3"));
        // The explorer host has a note too, so it appears under both sections.
        assert!(command.contains("[explorer]"));
        assert!(command.contains("[ca-server]"));
        assert!(command.ends_with(
            "echo -e \"\\n[ops:children]\\nops-master\\nops-worker\\n\\n[chainnodes:children]\\nvalidators\\nnonvalidators\" >> /root/.playbooks/trustchain-nodes"
        ));
    }

    #[test]
    fn inventory_falls_back_to_the_address_when_the_note_is_empty() {
        let mut topology = ClusterTopology::new(CapacityTargets::test_single());
        topology.upsert_host(host("10.0.0.9", "", &[Role::OpsMaster]));
        let command = inventory_command(&topology, "/root/.playbooks/trustchain-nodes");
        assert!(command.contains("10.0.0.9 ansible_ssh_host=10.0.0.9"));
    }

    #[test]
    fn group_vars_rewrites_every_fixed_key() {
        let config = ChainConfig::default();
        let ops = host("10.0.0.3", "", &[Role::OpsMaster]);
        let command = group_vars_command(&config, &ops, "10.0.0.1", "/root/.playbooks/group_vars/all");

        assert!(command.contains("sed -i '/^peer_port: /c\\peer_port: \"26656\"' /root/.playbooks/group_vars/all"));
        assert!(command.contains("sed -i '/^chain_home : /c\\chain_home : \"/root/.trustchain\"'"));
        assert!(command.contains("es_host: \"10.0.0.3\""));
        assert!(command.contains("explorer_connect_host: \"10.0.0.1\""));
        assert!(command.contains("crypto_with_sm2: \"true\""));
        assert_eq!(command.matches("sed -i").count(), 12);
    }

    #[test]
    fn group_vars_renders_sm2_false() {
        let config = ChainConfig {
            crypto_with_sm2: false,
            ..ChainConfig::default()
        };
        let ops = host("10.0.0.3", "", &[Role::OpsMaster]);
        let command = group_vars_command(&config, &ops, "10.0.0.1", "/root/.playbooks/group_vars/all");
        assert!(command.contains("crypto_with_sm2: \"false\""));
    }
}
