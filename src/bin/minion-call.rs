//! minion-call CLI — run a call against a simulated fleet and watch results arrive.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use minion_call::config::{CallOptions, Config};
use minion_call::engine::{Engine, event_feed};
use minion_call::model::{BatchSpec, Call, Target};
use minion_call::sim::SimFleet;
use minion_call::sim::fleet::FleetSpec;
use minion_call::telemetry::{TelemetryConfig, init_telemetry};
use minion_call::transport::Transport;

#[derive(Parser)]
#[command(name = "minion-call", about = "Fan a call out to minions and collect the returns")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a function on a simulated fleet
    Run {
        /// Fleet definition (TOML)
        #[arg(long)]
        fleet: PathBuf,
        /// Function to call, e.g. test.ping
        function: String,
        #[command(flatten)]
        target: TargetArgs,
        /// Positional arguments, each parsed as JSON (falls back to a plain string)
        #[arg(long = "arg")]
        args: Vec<String>,
        /// Batch size: an amount ("2") or a percentage ("25%")
        #[arg(long)]
        batch: Option<BatchSpec>,
        /// Cancel outstanding minions after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List the minions a target matches
    Match {
        /// Fleet definition (TOML)
        #[arg(long)]
        fleet: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Glob over minion ids
    #[arg(long, default_value = "*", conflicts_with_all = ["list", "compound"])]
    glob: String,
    /// Comma-separated minion ids
    #[arg(long, value_delimiter = ',')]
    list: Option<Vec<String>>,
    /// Compound expression, e.g. "web* and not L@web3"
    #[arg(long)]
    compound: Option<String>,
}

impl TargetArgs {
    fn into_target(self) -> Target {
        match (self.list, self.compound) {
            (Some(list), _) => Target::List(list),
            (None, Some(expr)) => Target::Compound(expr),
            (None, None) => Target::Glob(self.glob),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "minion-call".to_string(),
        default_level: config.log_level.clone(),
    })?;

    match cli.command {
        Command::Run {
            fleet,
            function,
            target,
            args,
            batch,
            timeout,
        } => {
            let options = CallOptions {
                batch: batch.unwrap_or(config.call.batch),
                timeout: timeout.map(Duration::from_secs).or(config.call.timeout),
            };
            cmd_run(&config, fleet, function, target.into_target(), args, options).await
        }
        Command::Match { fleet, target } => cmd_match(fleet, target.into_target()).await,
    }
}

async fn cmd_run(
    config: &Config,
    fleet: PathBuf,
    function: String,
    target: Target,
    args: Vec<String>,
    options: CallOptions,
) -> anyhow::Result<()> {
    let spec = FleetSpec::load(&fleet)?;
    let (feed_tx, feed_rx) = event_feed(config.feed_capacity);
    let transport = Arc::new(SimFleet::new(feed_tx, spec.workers));
    let engine = Engine::start(transport, feed_rx);

    let mut call = Call::<serde_json::Value>::new(&function);
    for arg in args {
        let value = serde_json::from_str(&arg).unwrap_or(serde_json::Value::String(arg));
        call = call.arg(value);
    }

    let timeout = options
        .timeout
        .map(|t| format!("{}s", t.as_secs()))
        .unwrap_or_else(|| "none".to_string());
    println!(
        "{function} -> {target} (batch: {}, timeout: {timeout})",
        options.batch
    );

    let pending = engine.call(call, target, &options);
    let first = pending.workers().await?;
    println!("first batch: {} minion(s)", first.len());

    // Print every minion as it returns, including later batches.
    let mut printed = std::collections::HashSet::new();
    let mut printers = Vec::new();
    loop {
        for (worker, handle) in pending.known_workers() {
            if printed.insert(worker) {
                let job = handle.job().clone();
                printers.push(handle.on_complete(move |worker, result| match result {
                    Ok(value) => println!("{worker:<16} {job}  ok     {value}"),
                    Err(err) => println!("{worker:<16} {job}  error  {err}"),
                }));
            }
        }
        if pending.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let outcome = pending.wait().await?;
    for printer in printers {
        let _ = printer.await;
    }

    println!("---");
    println!(
        "{} result(s) over {} batch(es)",
        outcome.results.len(),
        outcome.batches.len()
    );
    if let Some(reason) = &outcome.canceled {
        println!("canceled: {reason}");
    }
    if !outcome.not_dispatched.is_empty() {
        let names: Vec<String> = outcome.not_dispatched.iter().map(|w| w.to_string()).collect();
        println!("not dispatched: {}", names.join(", "));
    }
    if let Some(err) = &outcome.error {
        anyhow::bail!("stopped early: {err}");
    }

    engine.shutdown();
    engine.join().await;
    Ok(())
}

async fn cmd_match(fleet: PathBuf, target: Target) -> anyhow::Result<()> {
    let spec = FleetSpec::load(&fleet)?;
    let (feed_tx, _feed_rx) = event_feed(1);
    let transport = SimFleet::new(feed_tx, spec.workers);

    let matched = transport.resolve_targets(&target).await?;
    if matched.is_empty() {
        println!("No minions matched.");
        return Ok(());
    }
    for worker in &matched {
        println!("{worker}");
    }
    println!("\n{} minion(s)", matched.len());
    Ok(())
}
