//! `gleitzeit list` — page through workflows.

use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct ListArgs {
    /// Page size
    #[arg(long, default_value_t = 20)]
    pub limit: usize,

    /// Cursor from a previous page
    #[arg(long)]
    pub cursor: Option<String>,
}

pub async fn execute(args: ListArgs, storage_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let engine = super::engine_over(super::storage_for(storage_dir)).await?;

    let page = engine.list_workflows(args.limit, args.cursor).await?;
    if page.workflows.is_empty() {
        println!("no workflows");
    }
    for workflow in &page.workflows {
        println!(
            "{}  {}  {}  {} task(s)  created {}",
            workflow.id, workflow.name, workflow.status, workflow.task_count, workflow.created_at
        );
    }
    if let Some(cursor) = page.next_cursor {
        println!("next cursor: {}", cursor);
    }

    Ok(())
}
