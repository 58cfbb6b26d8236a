//! `gleitzeit prune` — delete a finished workflow's persisted state.

use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct PruneArgs {
    /// Workflow id
    pub workflow_id: String,
}

pub async fn execute(args: PruneArgs, storage_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let engine = super::engine_over(super::storage_for(storage_dir)).await?;

    engine.prune_workflow(&args.workflow_id).await?;
    println!("workflow {} pruned", args.workflow_id);
    Ok(())
}
