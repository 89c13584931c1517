use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gatehouse::backoff::Backoff;
use gatehouse::config::Config;
use gatehouse::image::ImageDir;
use gatehouse::service::{Origin, Registry};
use gatehouse::{Executor, Policy, Snapshot, TrapId};

/// Origin output chunks buffered ahead of stdout.
const OUTPUT_QUEUE_LEN: usize = 64;

fn print_help() {
    println!(
        "\
gatehouse v{}

Runs a WebAssembly program image in a sandboxed process.

USAGE:
    gatehouse [OPTIONS] IMAGE_DIR

ARGUMENTS:
    IMAGE_DIR    Directory holding image.toml, text and state

OPTIONS:
    -c, --config PATH     TOML configuration file [default: built-in defaults]
    -t, --timeout SECS    Suspend the program after SECS seconds
        --debug           Copy the program's debug output to stderr
    -h, --help            Print this help message and exit
    -V, --version         Print version and exit

The program's origin stream is connected to stdin and stdout. Ctrl-C
suspends the program; a suspended image resumes on the next run.

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, gatehouse=debug,warn)

EXAMPLES:
    gatehouse ./hello                         # built-in defaults
    gatehouse -c /etc/gatehouse.toml ./app    # custom config
    gatehouse -t 5 ./loop                     # suspend after 5 seconds",
        env!("CARGO_PKG_VERSION"),
    );
}

struct Args {
    config: Option<PathBuf>,
    timeout: Option<Duration>,
    debug: bool,
    image: PathBuf,
}

fn parse_args() -> Result<Args> {
    let mut config = None;
    let mut timeout = None;
    let mut debug = false;
    let mut image = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("gatehouse v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--config" | "-c" => {
                let path = args.next().ok_or_else(|| anyhow!("{arg} needs a path"))?;
                config = Some(PathBuf::from(path));
            }
            "--timeout" | "-t" => {
                let secs = args.next().ok_or_else(|| anyhow!("{arg} needs a value"))?;
                let secs: u64 = secs
                    .parse()
                    .with_context(|| format!("invalid timeout {secs:?}"))?;
                timeout = Some(Duration::from_secs(secs));
            }
            "--debug" => debug = true,
            _ if arg.starts_with('-') => bail!("unknown option {arg} (see --help)"),
            _ if image.is_none() => image = Some(PathBuf::from(arg)),
            _ => bail!("unexpected argument {arg}"),
        }
    }

    Ok(Args {
        config,
        timeout,
        debug,
        image: image.ok_or_else(|| anyhow!("missing IMAGE_DIR (see --help)"))?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("gatehouse=info")),
        )
        .init();

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Config::load(path)?
        }
        None => Config::default(),
    };

    let image = ImageDir::open(&args.image)
        .with_context(|| format!("opening image {}", args.image.display()))?;
    if image.check_mutation()? {
        bail!(
            "image {} was left mid-run; its state may be inconsistent",
            args.image.display()
        );
    }

    let mut buffers = match image.read_snapshot()? {
        Some((snapshot, _)) if snapshot.is_terminated() => {
            bail!("image snapshot is terminated ({}), not resumable", snapshot.trap)
        }
        Some((snapshot, buffers)) => {
            info!("Resuming from snapshot (trap: {})", snapshot.trap);
            buffers
        }
        None => Default::default(),
    };

    let Some(executor) = connect(&config).await? else {
        return Ok(());
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, suspending program");
                cancel.cancel();
            }
        });
    }
    if let Some(timeout) = args.timeout.or(config.runtime.timeout()) {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            info!("Timeout of {}s reached, suspending program", timeout.as_secs());
            cancel.cancel();
        });
    }

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_QUEUE_LEN);
    let stdout_writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(chunk) = out_rx.recv().await {
            stdout.write_all(&chunk).await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut registry = Registry::new();
    registry.register(Arc::new(Origin::new(
        Some(Box::new(tokio::io::stdin())),
        out_tx,
    )));

    let policy = Policy {
        time_resolution: config.runtime.time_resolution(),
        debug_log: (args.debug || config.runtime.debug)
            .then(|| Box::new(tokio::io::stderr()) as gatehouse::runtime::DebugLog),
    };

    let process = executor.new_process(&cancel).await?;
    if let Err(e) = process.start(&cancel, &image, &image, policy).await {
        // The sandbox never saw the state.
        image.end_mutation(|_| {})?;
        return Err(e.into());
    }

    let base_time = image.manifest().monotonic_time;
    let started = Instant::now();
    let served = process.serve(&cancel, &registry, Some(&mut buffers)).await;
    let elapsed = started.elapsed().as_nanos() as u64;

    process.close().await;
    drop(registry);
    if let Err(e) = stdout_writer.await? {
        warn!("Writing program output failed: {e}");
    }

    let outcome = match served {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Program failed: {e}");
            let _ = executor.close().await;
            return Err(e.into());
        }
    };

    let snapshot = Snapshot::new(outcome.trap, outcome.result, base_time + elapsed);
    if outcome.trap == TrapId::Suspended {
        image.write_snapshot(&snapshot, &buffers)?;
        image
            .end_suspended_mutation(snapshot.monotonic_time)
            .context("recording the suspended program's state")?;
        info!("Program suspended; snapshot written to {}", args.image.display());
    } else {
        image.remove_snapshot()?;
        image.end_mutation(|_| {})?;
    }

    if let Err(e) = executor.close().await {
        warn!("Executor shutdown: {e}");
    }

    eprintln!("trap: {}", outcome.trap);
    let code = match outcome.trap {
        TrapId::Exit => {
            eprintln!("result: {}", outcome.result);
            outcome.result.value() as i32
        }
        TrapId::Suspended => 0,
        _ => 1,
    };
    std::process::exit(code);
}

/// Connects to the container, retrying transient failures. Returns `None`
/// when interrupted.
async fn connect(config: &Config) -> Result<Option<Executor>> {
    let mut backoff = Backoff::new(&config.reconnect);

    loop {
        info!("Connecting to container (attempt {})...", backoff.attempt() + 1);

        let err = match Executor::new(&config.executor).await {
            Ok(executor) => return Ok(Some(executor)),
            Err(e) => e,
        };

        if !err.is_retriable() {
            error!("Permanent executor error: {err}");
            return Err(anyhow!("Cannot start executor: {err}"));
        }
        warn!("Connection failed: {err}");

        let Some(delay) = backoff.next_delay() else {
            error!(
                "Exceeded {} connection attempts, giving up",
                config.reconnect.max_attempts
            );
            return Err(anyhow!("Cannot start executor: {err}"));
        };
        info!("Retrying in {}s...", delay.as_secs());

        // Allow graceful shutdown during the wait
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received during backoff, exiting");
                return Ok(None);
            }
        }
    }
}
