use anyhow::Context;
use clap::{CommandFactory, Parser};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use concentrator::{Config, Engine, LogSink};

const PID_FILE: &str = ".pid";
const START_FILE: &str = ".start";

#[derive(Parser)]
#[command(name = "concentrator", version, about = "TCP port concentrator daemon")]
struct Cli {
    /// Configuration directory
    #[arg(short = 'c', long = "conf", value_name = "DIR")]
    conf: Option<PathBuf>,

    /// Detach and run as a daemon
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    /// Data directory for the pid and start markers
    #[arg(long = "data", value_name = "DIR", default_value = "/data/portconcentrator")]
    data: PathBuf,

    /// Email address for default notifications
    #[arg(short = 'e', long = "email", value_name = "ADDR")]
    email: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.email.is_none() {
        Cli::command().print_help()?;
        return Ok(());
    }

    if cli.daemon {
        daemonize()?;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "concentrator=info".into()),
        )
        .init();

    let config = Config::load(cli.conf.as_deref())?;

    std::fs::create_dir_all(&cli.data)
        .with_context(|| format!("failed to create {}", cli.data.display()))?;
    let pid_path = cli.data.join(PID_FILE);
    std::fs::write(&pid_path, format!("{}\n", std::process::id()))
        .with_context(|| format!("failed to write {}", pid_path.display()))?;
    std::fs::write(cli.data.join(START_FILE), "")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(serve(config));

    if pid_path.exists() {
        let _ = std::fs::remove_file(&pid_path);
    }
    result
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let engine = Engine::new(config, Arc::new(LogSink));
    let handle = engine.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = handle.shutdown_tx.send(());
    let _ = handle.finished_rx.await;
    Ok(())
}

/// Classic double fork; must run before the runtime spawns any thread.
fn daemonize() -> anyhow::Result<()> {
    // SAFETY: fork/setsid on a single-threaded process; the parents exit
    // without touching shared state.
    unsafe {
        match libc::fork() {
            -1 => anyhow::bail!("fork failed: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }
        if libc::setsid() == -1 {
            anyhow::bail!("setsid failed: {}", std::io::Error::last_os_error());
        }
        match libc::fork() {
            -1 => anyhow::bail!("fork failed: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }
    }
    Ok(())
}
