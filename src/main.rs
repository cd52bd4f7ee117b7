//! agentctl - control plane for per-session coding-agent instances.
//!
//! This is the binary entry point. See the `agentctl` library for the core
//! functionality.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentctl::control::{self, ControlState};
use agentctl::instance::manager::InstanceManager;
use agentctl::interactive::ShellRunner;
use agentctl::{Config, EventBus, Hub, LifecycleManager, MessageQueue, PortAllocator};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

/// Global flag for signal-triggered shutdown.
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(name = "agentctl")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Control plane for per-session coding-agent instances")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane.
    Serve {
        /// Control port override (else AGENTCTL_PORT, else config).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show whether a control plane is running (pid file check).
    Status,
    /// Print the effective configuration as JSON.
    Config,
}

/// Pid file path inside the config directory.
fn pid_file() -> Result<PathBuf> {
    Ok(Config::config_dir()?.join("agentctl.pid"))
}

/// Remove stale artifacts from a previous run before serving.
fn cleanup_stale_files() {
    let Ok(path) = pid_file() else { return };
    if !path.exists() {
        return;
    }
    let stale = std::fs::read_to_string(&path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .is_none_or(|pid| {
            // A pid that no longer exists means the previous run died hard.
            !std::process::Command::new("kill")
                .arg("-0")
                .arg(pid.to_string())
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        });
    if stale {
        log::info!("[control] removing stale pid file {}", path.display());
        let _ = std::fs::remove_file(&path);
    }
}

fn write_pid_file() -> Result<()> {
    let path = pid_file()?;
    std::fs::write(&path, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", path.display()))?;
    Ok(())
}

fn remove_pid_file() {
    if let Ok(path) = pid_file() {
        let _ = std::fs::remove_file(path);
    }
}

/// Run the control plane until a shutdown signal arrives.
fn serve(port_override: Option<u16>) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = port_override {
        config.control_port = port;
    }
    config.validate()?;

    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_serve(config))
}

async fn run_serve(config: Config) -> Result<()> {
    cleanup_stale_files();
    write_pid_file()?;

    // Wire the stack: hub ← bus ← lifecycle ← instances/ports.
    let hub = Arc::new(Hub::new());
    let bus = EventBus::new(Arc::clone(&hub));
    let ports = Arc::new(PortAllocator::new(
        config.instance_port_base,
        config.instance_port_max,
    ));
    let instances = Arc::new(InstanceManager::new(
        ports,
        Arc::new(agentctl::instance::http::router),
    ));
    let shell_runner = Arc::new(ShellRunner::new());
    let lifecycle = LifecycleManager::new(
        config.clone(),
        instances,
        Arc::new(agentctl::client::ClientRegistry::new()),
        Arc::new(MessageQueue::new()),
        bus,
        Arc::clone(&shell_runner) as Arc<dyn agentctl::interactive::InteractiveRunner>,
    );

    let dispatcher = Arc::new(control::Dispatcher::new());
    control::handlers::register_handlers(&dispatcher, &lifecycle, &config);

    let app = control::router(ControlState { dispatcher, hub });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.control_port))
        .await
        .with_context(|| format!("failed to bind control port {}", config.control_port))?;
    log::info!(
        "[control] agentctl v{} listening on 0.0.0.0:{}",
        env!("CARGO_PKG_VERSION"),
        config.control_port
    );
    println!("agentctl listening on port {}", config.control_port);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            log::error!("[control] server error: {e}");
        }
    });

    // Idle loop: wait for a signal.
    while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    println!("Shutting down...");
    log::info!("[control] shutdown requested");

    // Teardown cascade: sessions, auxiliary shells, then the server.
    lifecycle.stop_all().await;
    shell_runner.stop_all().await;
    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
    remove_pid_file();

    Ok(())
}

fn status() -> Result<()> {
    let path = pid_file()?;
    match std::fs::read_to_string(&path) {
        Ok(pid) => println!("agentctl appears to be running (pid {})", pid.trim()),
        Err(_) => println!("agentctl is not running"),
    }
    Ok(())
}

fn main() -> Result<()> {
    // File-target logging keeps the terminal clean for CLI output.
    let log_path = if let Ok(path) = std::env::var("AGENTCTL_LOG_FILE") {
        PathBuf::from(path)
    } else if let Ok(dir) = Config::config_dir() {
        dir.join("agentctl.log")
    } else {
        PathBuf::from("/tmp/agentctl.log")
    };
    match std::fs::File::create(&log_path) {
        Ok(log_file) => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .target(env_logger::Target::Pipe(Box::new(log_file)))
                .format_timestamp_secs()
                .init();
        }
        Err(e) => {
            eprintln!("Warning: cannot open log file {}: {e}", log_path.display());
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .init();
        }
    }

    std::panic::set_hook(Box::new(|panic_info| {
        log::error!("PANIC: {panic_info:?}");
        eprintln!("agentctl panicked: {panic_info}");
    }));

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port } => serve(port)?,
        Commands::Status => status()?,
        Commands::Config => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
