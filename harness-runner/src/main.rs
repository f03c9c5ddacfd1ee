// Debuggee harness runner
//
// Launches a debuggee, attaches to it, runs a smoke check over the command
// channel, lets it run to completion and prints a JSON verdict.
//
// Usage: jdwp-harness-run [-waittime=N] [-verbose] [-config=file.json] ... -- <debuggee> [args]

use anyhow::{Context, Result};
use jdwp_harness::{HarnessConfig, TestHarness};
use tracing::{info, warn};

mod report;

use report::Verdict;

/// Query the VM over the command channel before letting it run.
async fn smoke_check(harness: &mut TestHarness) -> jdwp_harness::HarnessResult<()> {
    let session = harness.session();

    let version = session.version().await?;
    info!(
        "Debuggee VM: {} {} (protocol {}.{})",
        version.vm_name, version.vm_version, version.jdwp_major, version.jdwp_minor
    );

    let sizes = session.id_sizes().await?;
    if sizes.object_id_size != 8 || sizes.reference_type_id_size != 8 {
        warn!(
            "Debuggee uses {}-byte object ids; only 8-byte ids are decoded",
            sizes.object_id_size
        );
    }

    let threads = session.all_threads().await?;
    info!("{} thread(s) at start", threads.len());

    harness.resume().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = HarnessConfig::from_args(std::env::args().skip(1))
        .context("invalid harness arguments")?;

    // Tracing to stderr only - stdout is reserved for the verdict
    let default_level = if config.verbose {
        "jdwp_harness=debug"
    } else {
        "jdwp_harness=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse()?)
                .add_directive("debuggee=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting debuggee harness...");

    let result = TestHarness::run(config, |h| Box::pin(smoke_check(h))).await;
    let verdict = Verdict::from_result(&result);

    println!("{}", serde_json::to_string(&verdict)?);
    info!("Harness finished: {:?}", verdict.outcome);

    std::process::exit(verdict.exit_code());
}
