//! `gleitzeit cancel` — cancel a workflow.

use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct CancelArgs {
    /// Workflow id
    pub workflow_id: String,

    /// Do not wait for in-flight provider calls; discard late results
    #[arg(long)]
    pub force: bool,
}

pub async fn execute(args: CancelArgs, storage_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let engine = super::engine_over(super::storage_for(storage_dir)).await?;

    let cancelled = engine
        .cancel_workflow(&args.workflow_id, args.force)
        .await?;
    if cancelled {
        println!("workflow {} cancelled", args.workflow_id);
    } else {
        println!("workflow {} already finished", args.workflow_id);
    }

    Ok(())
}
