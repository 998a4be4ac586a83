use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chainctl", version, about = "TrustChain cluster provisioning CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a deployment plan against its schema targets.
    Plan(PlanArgs),
    /// Probe every host in the plan and print its diagnostic report.
    Probe(PlanArgs),
    /// Run the pre-deployment checking pipeline.
    Check(RunArgs),
    /// Deploy the cluster: ops platform, chain nodes, explorer.
    Deploy(DeployArgs),
}

#[derive(Args)]
pub struct PlanArgs {
    /// Deployment plan file (JSON).
    #[arg(long)]
    pub plan: PathBuf,
}

#[derive(Args)]
pub struct RunArgs {
    /// Deployment plan file (JSON).
    #[arg(long)]
    pub plan: PathBuf,
    /// Directory holding the offline archives (playbooks and rpm bundles).
    #[arg(long)]
    pub resources: Option<PathBuf>,
}

#[derive(Args)]
pub struct DeployArgs {
    /// Deployment plan file (JSON).
    #[arg(long)]
    pub plan: PathBuf,
    /// Directory holding the offline archives (playbooks and rpm bundles).
    #[arg(long)]
    pub resources: Option<PathBuf>,
    /// Deploy without running the checking pipeline first.
    #[arg(long, default_value_t = false)]
    pub skip_checks: bool,
}
