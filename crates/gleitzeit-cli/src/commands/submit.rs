//! `gleitzeit submit` — run a workflow document.

use anyhow::Context;
use clap::Args;
use gleitzeit_core::WorkflowDocument;
use gleitzeit_engine::EngineEvent;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Args)]
pub struct SubmitArgs {
    /// Workflow document (YAML or JSON)
    pub file: PathBuf,

    /// Print task events while the workflow runs
    #[arg(long)]
    pub follow: bool,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 600)]
    pub timeout: u64,
}

pub async fn execute(args: SubmitArgs, storage_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let input = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let document = WorkflowDocument::parse(&input)?;

    let engine = super::engine_for(super::storage_for(storage_dir))?;
    engine.start().await.map_err(anyhow::Error::from)?;
    let mut events = engine.subscribe();

    let workflow_id = engine.submit_workflow(document).await?;
    println!("submitted workflow {}", workflow_id);

    let wait = engine.wait_for_workflow(&workflow_id, Duration::from_secs(args.timeout));
    let status = if args.follow {
        tokio::pin!(wait);
        loop {
            tokio::select! {
                status = &mut wait => break status,
                event = events.next() => {
                    if let Some(event) = event {
                        print_event(&event);
                    }
                }
            }
        }
    } else {
        wait.await
    };

    let status = match status {
        Ok(status) => status,
        Err(err) => {
            engine.stop().await;
            return Err(err.into());
        }
    };

    println!("workflow {} finished: {}", workflow_id, status);

    let results = engine.get_workflow_results(&workflow_id).await?;
    let mut task_ids: Vec<&String> = results.keys().collect();
    task_ids.sort();
    for task_id in task_ids {
        let result = &results[task_id];
        match &result.error {
            Some(error) => println!("  {} [{}]: {}", task_id, result.status, error),
            None => println!(
                "  {} [{}]: {}",
                task_id,
                result.status,
                serde_json::to_string(&result.result)?
            ),
        }
    }

    engine.stop().await;
    Ok(())
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::TaskStarted { task, attempt } => {
            println!("  -> {} started (attempt {})", task.task_id, attempt)
        }
        EngineEvent::TaskCompleted { task, .. } => println!("  -> {} completed", task.task_id),
        EngineEvent::TaskRetrying { task, delay_ms, .. } => {
            println!("  -> {} retrying in {}ms", task.task_id, delay_ms)
        }
        EngineEvent::TaskFailed { task, error, .. } => {
            println!("  -> {} failed: {}", task.task_id, error)
        }
        EngineEvent::TaskCancelled { task } => println!("  -> {} cancelled", task.task_id),
        _ => {}
    }
}
