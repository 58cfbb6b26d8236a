//! `gleitzeit results` — persisted results of one workflow.

use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct ResultsArgs {
    /// Workflow id
    pub workflow_id: String,

    /// Emit raw JSON instead of one line per task
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: ResultsArgs, storage_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let engine = super::engine_over(super::storage_for(storage_dir)).await?;

    let results = engine.get_workflow_results(&args.workflow_id).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        let mut task_ids: Vec<&String> = results.keys().collect();
        task_ids.sort();
        for task_id in task_ids {
            let result = &results[task_id];
            match &result.error {
                Some(error) => println!("{} [{}]: {}", task_id, result.status, error),
                None => println!(
                    "{} [{}]: {}",
                    task_id,
                    result.status,
                    serde_json::to_string(&result.result)?
                ),
            }
        }
    }

    Ok(())
}
