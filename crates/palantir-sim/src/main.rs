use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use palantir::{ExpiryPolicy, PoolConfig, PoolError, ResourcePool, TableStrategy, TracingObserver};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

struct Args {
    beings: usize,
    palantiri: Option<usize>,
    gazes: usize,
    lease_ms: Option<u64>,
    gaze_ms: u64,
    table: Option<TableStrategy>,
    revoke: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            beings: 4,
            palantiri: None,
            gazes: 5,
            lease_ms: None,
            gaze_ms: 10,
            table: None,
            revoke: false,
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: palantir-sim [options]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --beings <n>        Concurrent beings [default: 4]");
            eprintln!("  --palantiri <n>     Pool capacity [default: PALANTIR_CAPACITY or 2]");
            eprintln!("  --gazes <n>         Gazes per being [default: 5]");
            eprintln!("  --lease-ms <ms>     Lease duration per gaze [default: none]");
            eprintln!("  --gaze-ms <ms>      Time spent gazing [default: 10]");
            eprintln!("  --table <strategy>  locked or optimistic [default: locked]");
            eprintln!("  --revoke            Reclaim palantiri when a lease expires");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PALANTIR_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("palantir={level},palantir_sim={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    fn number<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> Result<T, String> {
        let value = value.ok_or(format!("{flag} requires a value"))?;
        value
            .parse()
            .map_err(|_| format!("{flag} expects a number, got '{value}'"))
    }

    let mut parsed = Args::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--beings" => {
                i += 1;
                parsed.beings = number(flag, args.get(i))?;
            }
            "--palantiri" => {
                i += 1;
                parsed.palantiri = Some(number(flag, args.get(i))?);
            }
            "--gazes" => {
                i += 1;
                parsed.gazes = number(flag, args.get(i))?;
            }
            "--lease-ms" => {
                i += 1;
                parsed.lease_ms = Some(number(flag, args.get(i))?);
            }
            "--gaze-ms" => {
                i += 1;
                parsed.gaze_ms = number(flag, args.get(i))?;
            }
            "--table" => {
                i += 1;
                let value = args.get(i).ok_or("--table requires a value")?;
                parsed.table = Some(value.parse()?);
            }
            "--revoke" => parsed.revoke = true,
            "--help" | "-h" => return Err(String::new()),
            other => return Err(format!("unexpected argument: {other}")),
        }
        i += 1;
    }

    if parsed.beings == 0 {
        return Err("--beings must be at least 1".to_string());
    }
    Ok(parsed)
}

fn run(args: Args) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(simulate(args))
}

async fn simulate(args: Args) -> anyhow::Result<()> {
    let mut config = PoolConfig::from_env();
    if std::env::var("PALANTIR_CAPACITY").is_err() {
        config = config.with_capacity(2);
    }
    if let Some(capacity) = args.palantiri {
        config = config.with_capacity(capacity);
    }
    if let Some(table) = args.table {
        config = config.with_table(table);
    }
    if args.revoke {
        config = config.with_expiry_policy(ExpiryPolicy::Revoke);
    }

    let pool = ResourcePool::new(config, Arc::new(TracingObserver))
        .context("invalid pool configuration")?;

    {
        let pool = pool.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, shutting the pool down");
                pool.shutdown();
            }
        });
    }

    let lease = args.lease_ms.map(Duration::from_millis);
    let gaze = Duration::from_millis(args.gaze_ms);
    tracing::info!(
        beings = args.beings,
        palantiri = pool.capacity(),
        gazes = args.gazes,
        ?lease,
        ?gaze,
        "Simulation starting"
    );

    let beings: Vec<_> = (0..args.beings)
        .map(|_| tokio::spawn(being(pool.clone(), args.gazes, lease, gaze)))
        .collect();

    let mut completed = 0usize;
    for outcome in futures::future::join_all(beings).await {
        completed += outcome.context("being task panicked")??;
    }

    let snapshot = pool.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    tracing::info!(completed, "Simulation finished");

    if snapshot.free != snapshot.capacity {
        bail!(
            "{} of {} palantiri still leased after the simulation",
            snapshot.capacity - snapshot.free,
            snapshot.capacity
        );
    }
    Ok(())
}

/// Repeatedly acquire, gaze and release. Returns the number of completed gazes.
async fn being(
    pool: ResourcePool,
    gazes: usize,
    lease: Option<Duration>,
    gaze: Duration,
) -> anyhow::Result<usize> {
    let holder = pool.holder();
    let mut completed = 0;

    for _ in 0..gazes {
        let mut granted = match pool.acquire(&holder, lease).await {
            Ok(granted) => granted,
            Err(PoolError::Shutdown | PoolError::Cancelled) => break,
            Err(e) => return Err(e).context("acquire failed"),
        };

        tokio::select! {
            _ = tokio::time::sleep(gaze) => completed += 1,
            _ = granted.interrupted() => {
                tracing::warn!(
                    holder = %holder.id(),
                    resource = %granted.resource_id(),
                    "Gaze interrupted"
                );
            }
        }

        granted.release();
    }

    Ok(completed)
}
