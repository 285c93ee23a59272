//! Operator tool: replay one aggregate from the event store and print its state.
//!
//! ```text
//! atelier-replay <aggregate-id>
//! ```

use anyhow::Context;
use serde_json::json;

use atelier_core::AggregateId;
use atelier_infra::{Engine, EngineConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    atelier_observability::init();

    let raw_id = std::env::args()
        .nth(1)
        .context("usage: atelier-replay <aggregate-id>")?;
    let aggregate_id: AggregateId = raw_id
        .parse()
        .with_context(|| format!("'{raw_id}' is not a valid aggregate id"))?;

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    if config.database_url.is_none() {
        tracing::warn!("DATABASE_URL not set; replaying against an empty in-memory store");
    }
    let engine = Engine::connect(&config).await?;

    let events = engine.store().get_events(aggregate_id, None).await?;
    let state = atelier_events::replay(&events);
    tracing::info!(%aggregate_id, event_count = events.len(), "aggregate replayed");

    let report = json!({
        "aggregate_id": aggregate_id,
        "event_count": events.len(),
        "version": events.last().map(|e| e.sequence_number).unwrap_or(0),
        "state": state,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
