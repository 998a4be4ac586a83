use anyhow::{bail, Context, Result};
use std::io::Write;

use crate::cli::{DeployArgs, PlanArgs, RunArgs};
use crate::config::{ChainConfig, DeployPlan, Resources};
use crate::host::{self, RemoteHost};
use crate::pipeline::{Pipeline, PipelineEvent};
use crate::topology::{ClusterTopology, Role};

pub fn plan(args: &PlanArgs) -> Result<()> {
    let plan = DeployPlan::load(&args.plan)?;
    let topology = plan.build_topology()?;
    let targets = topology.targets();

    let rows = [
        (Role::Validator, targets.validators),
        (Role::NonValidator, targets.non_validators),
        (Role::Explorer, targets.explorers),
        (Role::CaServer, targets.ca_servers),
    ];
    for (role, target) in rows {
        println!("{:>14}: {}/{}", role.label(), topology.role_count(role), target);
    }
    let ops_count =
        topology.role_count(Role::OpsMaster) + topology.role_count(Role::OpsWorker);
    println!("{:>14}: {}/{}", "ops", ops_count, targets.ops);

    if !topology.schema_satisfied() {
        bail!("the plan does not meet the deployment schema");
    }
    println!("the plan meets the deployment schema");
    Ok(())
}

pub async fn probe(args: &PlanArgs) -> Result<()> {
    let plan = DeployPlan::load(&args.plan)?;
    let hosts = plan.hosts()?;
    if hosts.is_empty() {
        bail!("the plan lists no hosts");
    }

    let mut invalid = 0usize;
    for host in hosts {
        let host = probe_one(host).await?;
        println!("{}", host.describe());
        println!("{}", host.report().render());
        println!();
        if !host.is_valid() {
            invalid += 1;
        }
    }
    if invalid > 0 {
        bail!("{invalid} host(s) failed validation");
    }
    Ok(())
}

pub async fn check(args: &RunArgs) -> Result<()> {
    let plan = DeployPlan::load(&args.plan)?;
    let resources = plan.resources(args.resources.as_deref());
    let topology = probe_and_assemble(&plan).await?;
    run_pipeline(Pipeline::checking(), topology, &plan.chain, &resources).await?;
    Ok(())
}

pub async fn deploy(args: &DeployArgs) -> Result<()> {
    let plan = DeployPlan::load(&args.plan)?;
    let resources = plan.resources(args.resources.as_deref());
    let mut topology = probe_and_assemble(&plan).await?;

    if !args.skip_checks {
        topology = run_pipeline(Pipeline::checking(), topology, &plan.chain, &resources).await?;
    }
    run_pipeline(Pipeline::deployment(), topology, &plan.chain, &resources).await?;
    Ok(())
}

async fn probe_one(host: RemoteHost) -> Result<RemoteHost> {
    // One probe at a time on the blocking pool; probing never touches
    // pipeline state.
    host::spawn_probe(host).await.context("probe task panicked")
}

async fn probe_and_assemble(plan: &DeployPlan) -> Result<ClusterTopology> {
    let mut probed = Vec::new();
    for host in plan.hosts()? {
        let host = probe_one(host).await?;
        if !host.is_valid() {
            bail!(
                "host {} failed validation:\n{}",
                host.describe(),
                host.report().render()
            );
        }
        tracing::info!(host = %host.address(), "host validated");
        probed.push(host);
    }

    let topology = plan.topology_from(probed)?;
    if !topology.schema_satisfied() {
        bail!("the plan does not meet the deployment schema");
    }
    Ok(topology)
}

async fn run_pipeline(
    pipeline: Pipeline,
    topology: ClusterTopology,
    config: &ChainConfig,
    resources: &Resources,
) -> Result<ClusterTopology> {
    let mut handle = pipeline.start(topology, config.clone(), resources.clone())?;

    let mut all_passed = false;
    let mut overwriting = false;
    while let Some(event) = handle.next_event().await {
        match event {
            PipelineEvent::Log(line) => {
                if overwriting {
                    println!();
                    overwriting = false;
                }
                println!("{line}");
            }
            PipelineEvent::LogOverwrite(line) => {
                print!("\r{line}");
                std::io::stdout().flush().ok();
                overwriting = true;
            }
            PipelineEvent::Summary { passed, message } => {
                if overwriting {
                    println!();
                    overwriting = false;
                }
                println!("{} {message}", if passed { "[ok]    " } else { "[failed]" });
            }
            PipelineEvent::Progress(value) => {
                if overwriting {
                    println!();
                    overwriting = false;
                }
                println!("[{value:>3}%]");
            }
            PipelineEvent::Finished { all_passed: passed } => {
                if overwriting {
                    println!();
                    overwriting = false;
                }
                all_passed = passed;
            }
        }
    }

    let topology = handle.join().await?;
    if !all_passed {
        bail!("pipeline failed; see the summary above");
    }
    println!("all jobs passed");
    Ok(topology)
}
