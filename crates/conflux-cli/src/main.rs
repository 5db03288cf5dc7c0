//! conflux-cli - デモ実行用バイナリ
//!
//! Runs the pipeline with three simulated processing units (random delay,
//! 20% failure rate) and feeds it the signal values given on the command
//! line (defaults to a small batch). Watches the store until every signal
//! completes, then prints the failure log and any dead letters.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conflux_core::impls::SimulatedProcessor;
use conflux_core::{PipelineBuilder, PipelineConfig, SignalId};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let inputs: Vec<String> = {
        let args: Vec<String> = std::env::args().skip(1).collect();
        if args.is_empty() {
            vec!["1".into(), "10".into(), "-3".into()]
        } else {
            args
        }
    };

    let pipeline = PipelineBuilder::new(PipelineConfig::default())
        .register_unit(Arc::new(SimulatedProcessor::new("unit-alpha").with_factor(2)))
        .register_unit(Arc::new(SimulatedProcessor::new("unit-beta").with_factor(3)))
        .register_unit(Arc::new(SimulatedProcessor::new("unit-gamma").with_factor(5)))
        .build()
        .await?;

    let mut submitted: Vec<SignalId> = Vec::new();
    for raw in &inputs {
        match pipeline.submit(raw).await {
            Ok(signal_id) => submitted.push(signal_id),
            Err(e) => warn!(raw = %raw, error = %e, "submission rejected"),
        }
    }

    if submitted.is_empty() {
        warn!("nothing submitted, exiting");
        pipeline.shutdown_and_join().await;
        return Ok(());
    }

    // Wait for every submitted signal to complete, naturally or via the
    // timeout reaper. The reaper guarantees this terminates.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(90);
    loop {
        let counts = pipeline.counts().await?;
        if counts.aggregates.complete >= submitted.len() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(?counts, "deadline reached before all signals completed");
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    for signal_id in &submitted {
        if let Some(agg) = pipeline.aggregate(*signal_id).await? {
            info!(
                %signal_id,
                complete = agg.is_complete,
                sources = agg.distinct_sources(),
                final_result = ?agg.final_result,
                "signal outcome"
            );
        }
    }

    let failures = pipeline.failure_log().await;
    if !failures.is_empty() {
        info!(count = failures.len(), "permanent processing failures");
        for entry in &failures {
            info!(
                signal_id = %entry.signal_id,
                source = %entry.source,
                reason = %entry.reason,
                "failure log entry"
            );
        }
    }

    let dead = pipeline.dead_letters().await?;
    if !dead.is_empty() {
        warn!(count = dead.len(), "dead letters parked");
    }

    pipeline.shutdown_and_join().await;
    Ok(())
}
