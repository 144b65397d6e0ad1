use sigprobe::{
    DescriptorStore, Engine, FatalError, JsonLinesSink, LinuxControl, OutcomeSink, PolicyKind,
    ProcessControl, RunConfig, Timing,
};

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::runtime;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// Sends termination signals to configured services in randomized order and
/// reports whether each one shut down.
#[derive(Debug, Parser)]
#[clap(name = "sigprobe", version, about)]
struct Opt {
    /// JSON target configuration
    #[clap(short, long, value_name = "path", env = "SIGPROBE_CONFIG")]
    config: PathBuf,

    /// Append outcome records to this file instead of stdout
    #[clap(short, long, value_name = "path", env = "SIGPROBE_OUTPUT")]
    output: Option<PathBuf>,

    /// Stop after this many rounds
    #[clap(long, value_name = "count")]
    rounds: Option<u64>,

    #[clap(long, value_name = "count")]
    workers: Option<usize>,

    /// Skip every target using this policy (repeatable)
    #[clap(long, value_enum, value_name = "policy")]
    disable: Vec<PolicyKind>,
}

enum AppError {
    Config(anyhow::Error),
    Unavailable(anyhow::Error),
    Other(anyhow::Error),
}

impl AppError {
    fn exit_code(&self) -> ExitCode {
        match self {
            AppError::Config(_) => ExitCode::from(2),
            AppError::Unavailable(_) => ExitCode::from(3),
            AppError::Other(_) => ExitCode::FAILURE,
        }
    }

    fn error(&self) -> &anyhow::Error {
        match self {
            AppError::Config(e) | AppError::Unavailable(e) | AppError::Other(e) => e,
        }
    }
}

impl From<FatalError> for AppError {
    fn from(err: FatalError) -> Self {
        match err {
            FatalError::Task(_) => AppError::Other(err.into()),
            err => AppError::Unavailable(err.into()),
        }
    }
}

fn setup_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, EnvFilter};

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_timer(fmt::time::ChronoLocal::rfc_3339())
        .finish()
        .with(ErrorLayer::default())
        .init();
}

fn load(path: &Path, opt: &Opt) -> Result<RunConfig> {
    let mut config = sigprobe::load_config(path)?;
    if let Some(rounds) = opt.rounds {
        config.rounds = Some(rounds);
    }
    if let Some(workers) = opt.workers {
        config.workers = workers;
    }
    // validated once, after the command line overrides
    let config = config.without_policies(&opt.disable)?;
    config.validate()?;
    Ok(config)
}

fn open_sink(output: Option<&Path>) -> Result<Arc<dyn OutcomeSink>> {
    Ok(match output {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open output: path = {}", path.display()))?;
            Arc::new(JsonLinesSink::new(file))
        }
        None => Arc::new(JsonLinesSink::new(io::stdout())),
    })
}

async fn serve(
    opt: Arc<Opt>,
    config: RunConfig,
    control: Arc<LinuxControl>,
) -> Result<(), AppError> {
    let sink = open_sink(opt.output.as_deref()).map_err(AppError::Other)?;
    let store = Arc::new(DescriptorStore::new(config.targets.clone()));
    let engine = Arc::new(Engine::new(control, Arc::clone(&store), Timing::from(&config), sink));

    let (trigger, shutdown) = sigprobe::shutdown_channel();
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| AppError::Other(e.into()))?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| AppError::Other(e.into()))?;
    let mut sighup = signal(SignalKind::hangup()).map_err(|e| AppError::Other(e.into()))?;

    let watcher = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received, finishing in-flight targets");
                    trigger.trigger();
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, finishing in-flight targets");
                    trigger.trigger();
                    break;
                }
                _ = sighup.recv() => match load(&opt.config, &opt) {
                    Ok(config) => {
                        store.replace(config.targets);
                    }
                    Err(err) => warn!("reload failed, keeping previous targets: {:?}", err),
                },
            }
        }
    });

    let result = engine.run(shutdown).await;
    watcher.abort();
    result.map(|_| ()).map_err(AppError::from)
}

fn run(opt: Opt) -> Result<(), AppError> {
    let config = load(&opt.config, &opt).map_err(AppError::Config)?;

    let control = Arc::new(LinuxControl::new());
    control
        .preflight()
        .context("process control preflight failed")
        .map_err(AppError::Unavailable)?;

    let runtime = runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|e| AppError::Other(e.into()))?;

    runtime.block_on(serve(Arc::new(opt), config, control))
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    setup_tracing();

    let opt = Opt::parse();

    match run(opt) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:?}", err.error());
            err.exit_code()
        }
    }
}
