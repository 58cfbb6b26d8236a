//! `gleitzeit validate` — check a workflow document without running it.

use anyhow::Context;
use clap::Args;
use gleitzeit_core::WorkflowDocument;
use std::path::PathBuf;

#[derive(Args)]
pub struct ValidateArgs {
    /// Workflow document (YAML or JSON)
    pub file: PathBuf,
}

pub async fn execute(args: ValidateArgs) -> anyhow::Result<()> {
    let input = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;

    let document = WorkflowDocument::parse(&input)?;
    let workflow = document.into_workflow()?;

    println!(
        "{}: ok ({} tasks, priority {:?})",
        workflow.name,
        workflow.tasks.len(),
        workflow.priority
    );
    Ok(())
}
