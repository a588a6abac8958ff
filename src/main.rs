//! ssh-fleet - Entry point
//!
//! Parses CLI arguments, runs one operation on every given host through a
//! session pool, prints the per-host results and shuts the pool down.

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ssh_fleet::config::{Args, Config};
use ssh_fleet::{Dispatcher, OperationResult, Outcome, SessionPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout only carries results
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::from_args(args)?;

    info!("ssh-fleet v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "{} hosts, max {} connections, timeout: {}ms, host key policy: {:?}",
        config.endpoints.len(),
        config.pool.max_concurrent_connections,
        config.pool.command_timeout.as_millis(),
        config.pool.host_key_policy
    );

    let pool = SessionPool::with_russh(config.pool.clone()).context("Failed to create pool")?;
    let dispatcher = Dispatcher::new(pool.clone());

    let cancel = dispatcher.cancellation_token();
    let shutdown_handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT (Ctrl+C), cancelling...");
            cancel.cancel();
        }
    });

    let stop_sweeper = CancellationToken::new();
    let sweeper = pool.spawn_sweeper(config.pool.sweep_interval, stop_sweeper.clone());

    let results = dispatcher.run_batch(config.requests()).await;
    shutdown_handle.abort();
    stop_sweeper.cancel();
    let _ = sweeper.await;

    if config.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&results).context("Failed to encode results")?
        );
    } else {
        for result in &results {
            print_result(result);
        }
    }

    let report = pool.close_all().await;
    if !report.is_clean() {
        warn!("{} sessions did not close cleanly", report.failures.len());
    }

    let failed = results.iter().filter(|r| !r.is_success()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} operations failed", failed, results.len());
    }
    Ok(())
}

fn print_result(result: &OperationResult) {
    match &result.outcome {
        Outcome::Success { stdout, .. } => {
            println!("[{}] ok: {}", result.endpoint, result.operation);
            if !stdout.is_empty() {
                print!("{}", stdout);
                if !stdout.ends_with('\n') {
                    println!();
                }
            }
        }
        Outcome::Failure(failure) => {
            println!(
                "[{}] FAILED: {}: {}",
                result.endpoint, result.operation, failure.message
            );
            if let Some(output) = &failure.output {
                if !output.stdout.is_empty() {
                    print!("{}", output.stdout);
                }
            }
        }
    }
}
