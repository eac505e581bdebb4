//! Quill simulator binary.
//!
//! Configured through `QUILL_SIM_*` environment variables; prints a JSON
//! summary and exits non-zero if the honest replicas diverge.

use anyhow::{bail, Result};
use quill_sim::{SimConfig, Simulation};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Quill simulator"
    );

    let config = SimConfig::from_env()?;
    let report = Simulation::new(config)?.run().await?;

    let values: serde_json::Map<String, serde_json::Value> = report
        .values
        .iter()
        .map(|(name, value)| (name.clone(), value.to_json()))
        .collect();
    let summary = json!({
        "honest": report.honest,
        "accepted": report.accepted,
        "rejected": report.rejected,
        "refusedEscalations": report.refused_escalations,
        "converged": report.converged,
        "values": values,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !report.converged {
        bail!("honest replicas diverged");
    }
    Ok(())
}
