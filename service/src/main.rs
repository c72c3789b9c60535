//! # UDS actor service binary
//!
//! Thin wrapper around `lib_actor`: CLI dispatch, logging bootstrap, signal
//! handling and the dedicated thread that hosts the service runtime.
//!
//! Invocations:
//! - `udsactor` / `udsactor run` — start the service loop
//! - `udsactor debug` — same, with debug logging
//! - `udsactor login <username>` — notify a user login through the private
//!   surface, print `ip,hostname,max_idle,deadline` and keep the session id
//! - `udsactor logout <username>` — notify the logout for that session
//!
//! Usage errors exit with status 2.

#![forbid(unsafe_code)]

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use lib_actor::broker::PrivateClient;
use lib_actor::consts;
use lib_actor::log::{remote_log_channel, RemoteLogForwarder};
use lib_actor::platform::Platform;
use lib_actor::types::login_result_line;
use lib_actor::{stop_flag, ActorService};

#[derive(Parser)]
#[command(name = "udsactor", version = consts::VERSION, about = "UDS endpoint actor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the service loop
    Run,
    /// Start the service loop with debug logging
    Debug,
    /// Notify a user login and print the session parameters
    Login { username: String },
    /// Notify a user logout
    Logout { username: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Rustls 0.23+ needs an explicit crypto provider installed once per
    // process, before any TLS configuration is built.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    match cli.command {
        None | Some(Command::Run) => run_service(false),
        Some(Command::Debug) => run_service(true),
        Some(Command::Login { username }) => client_runtime()?.block_on(client_login(&username)),
        Some(Command::Logout { username }) => client_runtime()?.block_on(client_logout(&username)),
    }
}

// ---------------------------------------------------------------------------
// Service mode
// ---------------------------------------------------------------------------

fn run_service(debug: bool) -> anyhow::Result<()> {
    // --- Phase 1: Logging (file + console + broker forwarder) ---
    let (forwarder, remote_rx) = remote_log_channel();
    let platform = Arc::new(Platform::system());
    let stop = stop_flag();

    let service = ActorService::new(platform, stop.clone()).with_remote_log(&forwarder, remote_rx);
    setup_logging(debug, forwarder)?;
    log::info!("{} starting", consts::VERSION_FULL);

    // --- Phase 2: Service runtime on its own thread ---
    // The main thread stays in charge of the process and its signals.
    let service_thread = std::thread::Builder::new()
        .name("udsactor-service".into())
        .spawn(move || service.run())
        .context("spawning service thread")?;

    // --- Phase 3: Wait for a signal or for the service to finish ---
    let watcher = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    watcher.block_on(async {
        let signal = shutdown_signal();
        tokio::pin!(signal);
        loop {
            tokio::select! {
                _ = &mut signal => {
                    log::info!("Stop requested");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    if service_thread.is_finished() {
                        break;
                    }
                }
            }
        }
    });

    stop.store(true, Ordering::Relaxed);
    let _ = service_thread.join();
    log::info!("{} stopped", consts::VERSION_FULL);
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            log::error!("Could not install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn setup_logging(debug: bool, forwarder: RemoteLogForwarder) -> anyhow::Result<()> {
    let level = if debug || consts::debug_mode() {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let log_file = std::env::temp_dir().join("udsactor.log");

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {} {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                message
            ))
        })
        .level(level)
        // HTTP stack stays quiet unless something is actually wrong
        .level_for("hyper", log::LevelFilter::Warn)
        .level_for("reqwest", log::LevelFilter::Warn)
        .level_for("rustls", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_file).context("opening log file")?)
        .chain(Box::new(forwarder) as Box<dyn log::Log>)
        .apply()
        .context("installing logger")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Client mode (login / logout against the private surface)
// ---------------------------------------------------------------------------

fn client_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building client runtime")
}

async fn client_login(username: &str) -> anyhow::Result<()> {
    let platform = Platform::system();
    let session_type = platform
        .operations
        .session_type()
        .await
        .unwrap_or_else(|_| consts::UNKNOWN.into());

    let client = PrivateClient::new(false)?;
    let result = client
        .user_login(username, &session_type)
        .await
        .context("login against local actor")?;

    println!("{}", login_result_line(&result));

    // The session id survives in a file so a later `logout` can close the
    // same session.
    std::fs::write(
        consts::session_id_file(),
        result.session_id.unwrap_or_default(),
    )
    .context("storing session id")?;
    Ok(())
}

async fn client_logout(username: &str) -> anyhow::Result<()> {
    let platform = Platform::system();
    let session_type = platform
        .operations
        .session_type()
        .await
        .unwrap_or_else(|_| consts::UNKNOWN.into());

    let session_id = std::fs::read_to_string(consts::session_id_file()).unwrap_or_default();

    let client = PrivateClient::new(false)?;
    client
        .user_logout(username, &session_type, session_id.trim())
        .await
        .context("logout against local actor")?;

    let _ = std::fs::remove_file(consts::session_id_file());
    Ok(())
}
