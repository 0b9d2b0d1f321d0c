//! vrloop - Main Entry Point
//!
//! `vrloop run <settings>` (or `vrloop <settings>`) runs the configured DAG for
//! `main.recording_duration_s`; `vrloop check <settings>` only validates it;
//! without arguments a default session runs until Ctrl-C. The same binary is
//! re-executed as worker process when `VRLOOP_WORKER` is set.
//!
//! Exit codes: 0 success, 1 configuration error, 2 DAG construction or start
//! error, 3 a node failed.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use vrloop::{
    config::{default_session_dir, RuntimeConfig, Settings, SpawnMode},
    error::VrError,
    logging,
    pipeline::{run_worker_from_env, DagBuilder, DagError, NodeRegistry, TopologyStats},
    session::{write_metadata_dump, MetadataDump},
};

const EXIT_CONFIG: u8 = 1;
const EXIT_DAG: u8 = 2;
const EXIT_NODE_FAILED: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "vrloop", version, about = "Real-time processing DAG for closed-loop VR")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Settings file; same as `vrloop run <SETTINGS>`
    settings: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the DAG described by a settings file
    Run {
        settings: PathBuf,

        /// Override main.recording_duration_s (seconds, 0 = until Ctrl-C)
        #[arg(long)]
        duration: Option<f64>,

        /// Run nodes as threads instead of processes
        #[arg(long)]
        threads: bool,
    },
    /// Validate a settings file and print the topology without running it
    Check { settings: PathBuf },
}

fn main() -> ExitCode {
    let registry = NodeRegistry::with_builtin();
    if let Some(result) = run_worker_from_env(&registry) {
        return match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("worker failed: {}", e);
                ExitCode::from(EXIT_NODE_FAILED)
            }
        };
    }

    logging::init_orchestrator();
    let cli = Cli::parse();

    let code = match (cli.command, cli.settings) {
        (Some(Command::Check { settings }), _) => check(&settings, registry),
        (
            Some(Command::Run {
                settings,
                duration,
                threads,
            }),
            _,
        ) => run_file(&settings, duration, threads, registry),
        (None, Some(settings)) => run_file(&settings, None, false, registry),
        (None, None) => run_interactive(registry),
    };
    match code {
        0 => ExitCode::SUCCESS,
        code => ExitCode::from(code),
    }
}

fn load(path: &Path) -> Result<Settings, u8> {
    let settings = Settings::load(path).and_then(|s| s.validate().map(|_| s));
    settings.map_err(|e| {
        tracing::error!("{}", e);
        EXIT_CONFIG
    })
}

fn build_error(e: VrError) -> u8 {
    tracing::error!("{}", e);
    if e.is_config() {
        EXIT_CONFIG
    } else {
        EXIT_DAG
    }
}

fn dag_error(e: DagError) -> u8 {
    tracing::error!("{}", e);
    if e.is_construction() {
        EXIT_DAG
    } else {
        EXIT_NODE_FAILED
    }
}

fn check(path: &Path, registry: NodeRegistry) -> u8 {
    let settings = match load(path) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let runtime = RuntimeConfig::from_settings(&settings);
    let dag = match DagBuilder::from_settings(&settings, runtime, registry).build() {
        Ok(dag) => dag,
        Err(e) => return build_error(e),
    };
    let topology = match dag.check() {
        Ok(t) => t,
        Err(e) => return dag_error(e),
    };

    println!("mode: {}", settings.main.mode);
    println!("{}", describe(&topology.stats));
    for id in &topology.order {
        let node = &dag.nodes()[id.index()];
        println!("  node  {:<16} {}", node.name, node.kind);
    }
    for handle in dag.queue_handles() {
        match handle.schema() {
            Some(schema) => println!("  queue {:<16} {}", handle.name(), schema),
            None => println!("  queue {:<16} metadata", handle.name()),
        }
    }
    0
}

fn describe(stats: &TopologyStats) -> String {
    format!(
        "{} nodes, {} queues, {} data edges, {} metadata edges",
        stats.nodes, stats.queues, stats.data_edges, stats.metadata_edges
    )
}

fn run_file(path: &Path, duration: Option<f64>, threads: bool, registry: NodeRegistry) -> u8 {
    let settings = match load(path) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let seconds = duration.unwrap_or(settings.main.recording_duration_s);
    let limit = (seconds > 0.0).then(|| Duration::from_secs_f64(seconds));
    let mut runtime = RuntimeConfig::from_settings(&settings);
    if threads {
        runtime = runtime.with_spawn_mode(SpawnMode::Thread);
    }
    execute(&settings, runtime, registry, limit)
}

fn run_interactive(registry: NodeRegistry) -> u8 {
    let mut settings = Settings::default();
    settings.main.output_dir = match default_session_dir() {
        Ok(dir) => dir,
        Err(e) => return build_error(e),
    };
    tracing::info!(
        output_dir = ?settings.main.output_dir,
        "no settings file given; running the default session until Ctrl-C"
    );
    let runtime = RuntimeConfig::from_settings(&settings);
    execute(&settings, runtime, registry, None)
}

fn execute(
    settings: &Settings,
    runtime: RuntimeConfig,
    registry: NodeRegistry,
    limit: Option<Duration>,
) -> u8 {
    let output_dir = &settings.main.output_dir;
    if let Err(e) = std::fs::create_dir_all(output_dir) {
        tracing::error!("Failed to create output directory {:?}: {}", output_dir, e);
        return EXIT_CONFIG;
    }

    let mut dag = match DagBuilder::from_settings(settings, runtime, registry).build() {
        Ok(dag) => dag,
        Err(e) => return build_error(e),
    };
    let topology = match dag.check() {
        Ok(t) => t,
        Err(e) => return dag_error(e),
    };
    tracing::info!("{}", describe(&topology.stats));

    let (tx, rx) = crossbeam_channel::bounded::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    }) {
        tracing::warn!("Failed to install Ctrl-C handler: {}", e);
    }

    if let Err(e) = dag.start() {
        return dag_error(e);
    }
    tracing::info!(mode = %settings.main.mode, limit = ?limit, "DAG running");
    let report = match dag.run(limit, Some(&rx)) {
        Ok(report) => report,
        Err(e) => return dag_error(e),
    };

    for queue in &report.queues {
        tracing::info!(
            queue = %queue.name,
            produced = queue.produced,
            consumed = queue.consumed,
            lost = queue.lost,
            "queue summary"
        );
    }
    let dump = MetadataDump::new(settings)
        .with_topology(&topology.stats)
        .with_report(&report);
    if let Err(e) = write_metadata_dump(output_dir, &dump) {
        tracing::warn!("Failed to write metadata dump: {}", e);
    }

    let failed = report.failed();
    if failed.is_empty() {
        tracing::info!(duration = ?report.duration, "run complete");
        0
    } else {
        for worker in failed {
            tracing::error!(node = %worker.name, "node failed");
        }
        EXIT_NODE_FAILED
    }
}
