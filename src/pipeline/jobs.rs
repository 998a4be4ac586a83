use super::context::{exec_logged, ops_host, run_playbook, upload_extract, RunContext, StepFailed, StepResult};
use super::inventory;
use super::types::JobKind;

/// Single executor for the closed job set: each body is a short sequence of
/// sub-steps, and every sub-step checks the abort flag before acting.
pub(super) fn run_job(kind: JobKind, ctx: &mut RunContext<'_>) -> StepResult {
    match kind {
        JobKind::PreparePlaybooks => prepare_playbooks(ctx),
        JobKind::InstallAnsible => install_ansible(ctx),
        JobKind::InstallDocker => playbook_job(ctx, "install docker", "prep_docker"),
        JobKind::CheckComputing => playbook_job(ctx, "check computing resources", "check_computing"),
        JobKind::CheckNetwork => playbook_job(ctx, "check network resources", "check_network"),
        JobKind::CheckStorage => playbook_job(ctx, "check storage resources", "check_storage"),
        JobKind::DeployOps => playbook_job(ctx, "deploy ops platform", "deploy_monitor"),
        JobKind::DeployChain => playbook_job(ctx, "deploy chain nodes", "deploy_chain"),
        JobKind::DeployExplorer => playbook_job(ctx, "deploy chain explorer", "deploy_explorer"),
    }
}

fn playbook_job(ctx: &mut RunContext<'_>, description: &str, playbook: &str) -> StepResult {
    run_playbook(ctx, description, playbook)?;
    ctx.out.progress_forward(100);
    Ok(())
}

fn prepare_playbooks(ctx: &mut RunContext<'_>) -> StepResult {
    if !playbooks_present(ctx)? {
        extract_playbooks(ctx)?;
    }
    generate_inventory(ctx)?;
    update_group_vars(ctx)?;
    Ok(())
}

/// Idempotency check: an existing playbooks directory skips the upload and
/// still advances the step's full progress share.
fn playbooks_present(ctx: &mut RunContext<'_>) -> Result<bool, StepFailed> {
    if ctx.out.aborted() {
        return Ok(true);
    }
    let host = ops_host(ctx.topology, &ctx.out)?;
    let address = host.address().to_string();
    let playbooks_dir = host.resolve_home_path(&ctx.resources.playbooks_dir);
    match host.exec(&format!("ls {playbooks_dir} &> /dev/null")) {
        Ok(result) if result.ok() => {
            ctx.out
                .summary(true, format!("{{{address}}} playbooks already present"));
            ctx.out.progress_forward(80);
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(err) => {
            ctx.out
                .fail(format!("{{{address}}} checking for playbooks failed: {err:#}"));
            Err(StepFailed)
        }
    }
}

fn extract_playbooks(ctx: &mut RunContext<'_>) -> StepResult {
    if ctx.out.aborted() {
        return Ok(());
    }
    let archive = ctx.resources.playbooks_archive.clone();
    let playbooks_dir = ctx.resources.playbooks_dir.clone();
    let host = ops_host(ctx.topology, &ctx.out)?;
    upload_extract(&ctx.out, host, "playbooks", &archive, &playbooks_dir)?;
    ctx.out.progress_forward(80);
    Ok(())
}

fn generate_inventory(ctx: &mut RunContext<'_>) -> StepResult {
    if ctx.out.aborted() {
        return Ok(());
    }
    let inventory_path = {
        let host = ops_host(ctx.topology, &ctx.out)?;
        host.resolve_home_path(&format!(
            "{}/{}",
            ctx.resources.playbooks_dir, ctx.resources.inventory_name
        ))
    };
    let command = inventory::inventory_command(ctx.topology, &inventory_path);
    let host = ops_host(ctx.topology, &ctx.out)?;
    exec_logged(&ctx.out, host, "generate inventory file", &command)?;
    ctx.out.progress_forward(10);
    Ok(())
}

fn update_group_vars(ctx: &mut RunContext<'_>) -> StepResult {
    if ctx.out.aborted() {
        return Ok(());
    }
    let validator = ctx
        .topology
        .first_validator_address()
        .unwrap_or_default()
        .to_string();
    let command = {
        let host = ops_host(ctx.topology, &ctx.out)?;
        let group_vars_path =
            host.resolve_home_path(&format!("{}/group_vars/all", ctx.resources.playbooks_dir));
        inventory::group_vars_command(ctx.config, host, &validator, &group_vars_path)
    };
    let host = ops_host(ctx.topology, &ctx.out)?;
    exec_logged(&ctx.out, host, "update group_vars/all", &command)?;
    ctx.out.progress_forward(10);
    Ok(())
}

fn install_ansible(ctx: &mut RunContext<'_>) -> StepResult {
    if !tool_installed(ctx, "sshpass", 30)? {
        install_rpms(ctx, "sshpass", 30)?;
    }
    if !tool_installed(ctx, "ansible-playbook", 60)? {
        install_rpms(ctx, "ansible", 60)?;
    }
    push_ssh_keys(ctx)?;
    Ok(())
}

fn tool_installed(ctx: &mut RunContext<'_>, binary: &str, share: u32) -> Result<bool, StepFailed> {
    if ctx.out.aborted() {
        return Ok(true);
    }
    let host = ops_host(ctx.topology, &ctx.out)?;
    let address = host.address().to_string();
    match host.exec(&format!("which {binary}")) {
        Ok(result) if result.ok() => {
            ctx.out
                .summary(true, format!("{{{address}}} {binary} already installed"));
            ctx.out.progress_forward(share);
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(err) => {
            ctx.out
                .fail(format!("{{{address}}} checking for {binary} failed: {err:#}"));
            Err(StepFailed)
        }
    }
}

/// Uploads the named offline rpm archive to `/tmp/rpm_<name>` and installs
/// everything in it.
fn install_rpms(ctx: &mut RunContext<'_>, name: &str, share: u32) -> StepResult {
    if ctx.out.aborted() {
        return Ok(());
    }
    let archive = match name {
        "ansible" => ctx.resources.ansible_rpms_archive.clone(),
        _ => ctx.resources.sshpass_rpms_archive.clone(),
    };
    let staging = format!("/tmp/rpm_{name}");
    let host = ops_host(ctx.topology, &ctx.out)?;
    upload_extract(&ctx.out, host, name, &archive, &staging)?;

    let command = format!("yum install -y {staging}/*.rpm && rm -rf {staging}");
    let host = ops_host(ctx.topology, &ctx.out)?;
    exec_logged(&ctx.out, host, &format!("install {name}"), &command)?;
    ctx.out.progress_forward(share);
    Ok(())
}

/// Pushes the ops host's SSH key to every node so ansible can log in
/// without prompting.
fn push_ssh_keys(ctx: &mut RunContext<'_>) -> StepResult {
    if ctx.out.aborted() {
        return Ok(());
    }
    let host = ops_host(ctx.topology, &ctx.out)?;
    let script = host.resolve_home_path(&format!(
        "{}/ssh-copy-id-nodes.sh",
        ctx.resources.playbooks_dir
    ));
    exec_logged(
        &ctx.out,
        host,
        "configure key-based SSH logins",
        &format!("bash {script}"),
    )?;
    ctx.out.progress_forward(10);
    Ok(())
}
