//! `gleitzeit status` — status of one workflow.

use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct StatusArgs {
    /// Workflow id
    pub workflow_id: String,
}

pub async fn execute(args: StatusArgs, storage_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let engine = super::engine_over(super::storage_for(storage_dir)).await?;

    let report = engine.get_workflow_status(&args.workflow_id).await?;

    println!("{} ({}): {}", report.workflow_id, report.name, report.status);
    for (status, count) in &report.counts {
        println!("  {}: {}", status, count);
    }
    for task in &report.tasks {
        match &task.error {
            Some(error) => println!(
                "  {} [{}] attempt {}: {}",
                task.task_id, task.status, task.attempt, error
            ),
            None => println!("  {} [{}] attempt {}", task.task_id, task.status, task.attempt),
        }
    }

    Ok(())
}
