//! `gleitzeit providers` — registered provider records.

use clap::Args;

#[derive(Args)]
pub struct ProvidersArgs {}

pub async fn execute(_args: ProvidersArgs) -> anyhow::Result<()> {
    let engine = super::engine_for(super::storage_for(None))?;

    for record in engine.list_providers() {
        println!(
            "{}  {}  health={}  load={}/{}  methods=[{}]",
            record.provider_id,
            record.protocol_id,
            record.health,
            record.current_load,
            record.capacity,
            record
                .supported_methods
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}
