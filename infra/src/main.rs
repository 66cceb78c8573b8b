//! `infractl`: drive base-infrastructure bootstrap and destroy for one cluster
//! and watch for bootstrap completion.
//!
//! Reads tool settings from `.infra/config.toml` and the cluster description
//! from `.infra/cluster.toml`. Exit codes are listed in [`infra::exit_codes`].

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use infra::core::slot::BASE_INFRASTRUCTURE;
use infra::core::types::ObservationBatch;
use infra::exit_codes;
use infra::io::approval::TerminalApprover;
use infra::io::backend::TerraformBackend;
use infra::io::cluster::{ClusterConfig, load_cluster_config};
use infra::io::config::{InfraConfig, load_config};
use infra::io::marker::{FileMarkerStore, KubectlMarkerStore, MarkerStore};
use infra::io::nodes::{KubectlNodeSource, parse_batch, read_batches};
use infra::io::process::StopHandle;
use infra::io::state_cache::{FsStateCache, StateCache};
use infra::logging;
use infra::pipeline::{Pipeline, PipelineContext, StateSource};
use infra::reconcile::BootstrapReconciler;
use infra::runner::{InfraRunner, RunnerConfig, RunnerConfigBuilder};
use infra::shutdown::ShutdownRegistry;

#[derive(Parser)]
#[command(
    name = "infractl",
    version,
    about = "Cluster base-infrastructure lifecycle orchestration"
)]
struct Cli {
    /// Tool configuration file.
    #[arg(long, global = true, default_value = ".infra/config.toml")]
    config: PathBuf,

    /// Cluster description file.
    #[arg(long, global = true, default_value = ".infra/cluster.toml")]
    cluster: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show what apply would change for a slot.
    Plan {
        #[arg(long, default_value = BASE_INFRASTRUCTURE)]
        slot: String,
        /// Plan from empty state instead of the cached snapshot.
        #[arg(long)]
        no_cache: bool,
    },
    /// Create the base infrastructure.
    Bootstrap(LifecycleArgs),
    /// Tear down the base infrastructure.
    Destroy {
        #[command(flatten)]
        args: LifecycleArgs,
        /// Keep the cached state after a verified teardown.
        #[arg(long)]
        keep_cache: bool,
    },
    /// Inspect or edit the state cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    /// Watch node readiness and record bootstrap completion.
    WatchBootstrap {
        /// Read newline-delimited node batches from stdin instead of kubectl.
        #[arg(long)]
        stdin: bool,
        /// Keep the marker in this file instead of a ConfigMap.
        #[arg(long)]
        marker_file: Option<PathBuf>,
        /// Process a single batch and exit.
        #[arg(long)]
        once: bool,
    },
}

#[derive(Args)]
struct LifecycleArgs {
    #[arg(long, default_value = BASE_INFRASTRUCTURE)]
    slot: String,
    /// Review the plan and confirm before changing anything.
    #[arg(long)]
    sanity_check: bool,
    /// Seed the cache from this state file (ignored if the slot is cached).
    #[arg(long)]
    state_file: Option<PathBuf>,
    /// Seed the cache from state read on stdin (ignored if the slot is cached).
    #[arg(long)]
    state_stdin: bool,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// List cached slots.
    List,
    /// Print a cached snapshot to stdout.
    Show {
        #[arg(long, default_value = BASE_INFRASTRUCTURE)]
        slot: String,
    },
    /// Remove one cached snapshot.
    Delete {
        #[arg(long)]
        slot: String,
    },
    /// Remove every cached snapshot of the cluster.
    Clear,
}

fn main() {
    logging::init();
    let code = match run(Cli::parse()) {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::for_error(&err)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    let registry = ShutdownRegistry::new(config.shutdown_deadline());
    registry.install_signal_handler()?;

    match cli.command {
        Command::Plan { slot, no_cache } => {
            let env = Env::load(config, &cli.cluster)?;
            cmd_plan(&env, &registry, &slot, no_cache)
        }
        Command::Bootstrap(args) => {
            let env = Env::load(config, &cli.cluster)?;
            let pipeline =
                Pipeline::bootstrap("Base infrastructure", env.runner_config(&args.slot)?);
            cmd_lifecycle(&env, &registry, pipeline, &args)
        }
        Command::Destroy { args, keep_cache } => {
            let env = Env::load(config, &cli.cluster)?;
            let pipeline = Pipeline::destroy("Kubernetes cluster", env.runner_config(&args.slot)?)
                .clean_cache_on_success(!keep_cache);
            cmd_lifecycle(&env, &registry, pipeline, &args)
        }
        Command::Cache { command } => {
            let env = Env::load(config, &cli.cluster)?;
            cmd_cache(&env.cache(), command)
        }
        Command::WatchBootstrap {
            stdin,
            marker_file,
            once,
        } => {
            let watch = WatchOptions {
                stdin,
                once,
                poll_interval: Duration::from_secs(config.reconcile.poll_interval_secs),
                kubectl: config.reconcile.kubectl.clone(),
            };
            match marker_file {
                Some(path) => cmd_watch(FileMarkerStore::new(path), &registry, &watch),
                None => cmd_watch(
                    KubectlMarkerStore::new(
                        &config.reconcile.kubectl,
                        &config.reconcile.marker_namespace,
                        &config.reconcile.marker_name,
                    ),
                    &registry,
                    &watch,
                ),
            }
        }
    }
}

/// Loaded tool and cluster configuration.
struct Env {
    config: InfraConfig,
    cluster: ClusterConfig,
}

impl Env {
    fn load(config: InfraConfig, cluster_path: &Path) -> Result<Self> {
        let cluster = load_cluster_config(cluster_path)?;
        Ok(Self { config, cluster })
    }

    fn cache(&self) -> FsStateCache {
        FsStateCache::new(&self.config.cache_dir, &self.cluster.name)
    }

    fn backend(&self) -> TerraformBackend {
        TerraformBackend::new(
            self.config.backend.binary.clone(),
            self.config.work_dir.join(&self.cluster.name),
            self.config.run_limits(),
        )
    }

    fn runner_config(&self, slot: &str) -> Result<RunnerConfigBuilder> {
        let variables = self
            .cluster
            .marshal_variables()
            .context("marshal cluster variables")?;
        Ok(RunnerConfig::builder(&self.cluster.name, slot)
            .step_dir(self.cluster.step_dir(&self.config.layouts_dir, slot))
            .variables(variables)
            .timeout(self.config.run_limits().timeout))
    }
}

fn cmd_plan(
    env: &Env,
    registry: &Arc<ShutdownRegistry>,
    slot: &str,
    no_cache: bool,
) -> Result<()> {
    let config = env
        .runner_config(slot)?
        .allow_cached_state(!no_cache)
        .build()?;
    let backend = env.backend();
    let cache = env.cache();
    let runner = InfraRunner::new(config, &backend, &cache, &TerminalApprover, registry);
    let plan = runner.plan()?;
    println!("{}", plan.summary);
    Ok(())
}

fn cmd_lifecycle(
    env: &Env,
    registry: &Arc<ShutdownRegistry>,
    pipeline: Pipeline,
    args: &LifecycleArgs,
) -> Result<()> {
    let source = StateSource::from_flags(args.state_file.clone(), args.state_stdin)?;
    let caller_state = source.read(std::io::stdin().lock())?;
    let mut pipeline = pipeline
        .sanity_check(args.sanity_check)
        .caller_state(caller_state);

    let backend = env.backend();
    let cache = env.cache();
    let ctx = PipelineContext {
        backend: &backend,
        cache: &cache,
        approver: &TerminalApprover,
        registry,
    };
    let outcome = pipeline.run(&ctx)?;
    println!("{}", outcome.description);
    Ok(())
}

fn cmd_cache(cache: &FsStateCache, command: CacheCommand) -> Result<()> {
    match command {
        CacheCommand::List => {
            for slot in cache.slots()? {
                println!("{slot}");
            }
        }
        CacheCommand::Show { slot } => {
            let state = cache
                .load(&slot)?
                .ok_or_else(|| anyhow!("slot '{slot}' is not cached"))?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&state).context("write state to stdout")?;
            stdout.flush().context("flush stdout")?;
        }
        CacheCommand::Delete { slot } => {
            cache.delete(&slot)?;
            info!(slot, "cached state deleted");
        }
        CacheCommand::Clear => {
            let removed = cache.clear()?;
            println!("removed {removed} cached slots from {}", cache.dir().display());
        }
    }
    Ok(())
}

struct WatchOptions {
    stdin: bool,
    once: bool,
    poll_interval: Duration,
    kubectl: PathBuf,
}

fn cmd_watch<M: MarkerStore>(
    marker: M,
    registry: &Arc<ShutdownRegistry>,
    opts: &WatchOptions,
) -> Result<()> {
    let mut reconciler = BootstrapReconciler::new(marker);
    let source = KubectlNodeSource::new(&opts.kubectl);

    if opts.once {
        let batch = if opts.stdin {
            first_stdin_batch()?
        } else {
            source.fetch(&StopHandle::new())?
        };
        println!("{}", reconciler.observe(&batch)?);
        return Ok(());
    }

    let (tx, rx) = mpsc::channel();
    let stop = StopHandle::new();
    let _poller_guard = if opts.stdin {
        thread::spawn(move || {
            if let Err(err) = read_batches(std::io::stdin().lock(), &tx) {
                warn!(err = %format!("{err:#}"), "reading batches from stdin failed");
            }
        });
        None
    } else {
        let remote = stop.downgrade();
        let guard = registry.register_on_shutdown("node-poller", move || {
            if let Some(handle) = remote.upgrade() {
                handle.raise();
            }
        });
        source.spawn_poller(opts.poll_interval, tx, stop.clone());
        Some(guard)
    };

    let mut last = None;
    let summary = reconciler.run(rx, |signal| {
        if last != Some(signal) {
            println!("{signal}");
            last = Some(signal);
        }
    });
    if summary.failures > 0 {
        warn!(failures = summary.failures, "some batches failed");
    }
    Ok(())
}

fn first_stdin_batch() -> Result<ObservationBatch> {
    for line in std::io::stdin().lock().lines() {
        let line = line.context("read stdin")?;
        if !line.trim().is_empty() {
            return parse_batch(&line);
        }
    }
    Err(anyhow!("no node batch on stdin"))
}
