//! CLI entry point: `config`/`server`/`test` modes plus `-v`/`--version`,
//! wired to the Listener Supervisor's restart loop and the signal-driven
//! lifecycle in `server.rs`.

mod config;
mod dns;
mod listeners;
mod observability;
mod server;
mod telemetry;
mod tls;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use server::{ControlMessage, SupervisorState};

#[derive(Parser)]
#[command(name = "dnsproxy", disable_version_flag = true)]
struct Cli {
    #[command(subcommand)]
    mode: Option<Mode>,

    /// Print version/build metadata and exit.
    #[arg(short = 'v', long = "version", global = true)]
    version: bool,
}

#[derive(Subcommand)]
enum Mode {
    /// Print the embedded default configuration to stdout and exit.
    Config,
    /// Run the dnsproxy server.
    Server {
        #[arg(short = 'c', long = "config", default_value = "/etc/dnsproxy/dnsproxy.conf")]
        config: PathBuf,
    },
    /// Validate the configuration and exit 0 if valid, 1 with errors on stderr otherwise.
    Test {
        #[arg(short = 'c', long = "config", default_value = "/etc/dnsproxy/dnsproxy.conf")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!(
            "{} (Variant: {}-{}, Built on: {}, Revision: {})",
            server::VERSION_INFO.version,
            std::env::consts::OS,
            std::env::consts::ARCH,
            server::VERSION_INFO.built_on,
            server::VERSION_INFO.revision,
        );
        std::process::exit(0);
    }

    match cli.mode {
        Some(Mode::Config) => {
            print!("{}", config::DEFAULT_CONFIG);
            std::process::exit(0);
        }
        Some(Mode::Test { config: path }) => match config::load_config(&path) {
            Ok(_) => {
                println!("dnsproxy configuration is valid");
                std::process::exit(0);
            }
            Err(errors) => {
                for e in &errors {
                    eprintln!("{e}");
                }
                std::process::exit(1);
            }
        },
        Some(Mode::Server { config: path }) => run_server(path).await,
        None => {
            eprintln!("a mode is required: config, server, or test");
            std::process::exit(1);
        }
    }
}

/// Install the `tracing` console layer, wire the signal driver, and drive
/// the Listener Supervisor's restart loop for the process's lifetime.
async fn run_server(config_path: PathBuf) {
    telemetry::init();

    let state = Arc::new(SupervisorState::default());
    let (control_tx, mut control_rx) = mpsc::channel::<ControlMessage>(8);

    spawn_signal_driver(control_tx);

    loop {
        let (should_restart, result) = server::start(&config_path, &state, &mut control_rx).await;
        if !should_restart {
            if let Err(e) = result {
                eprintln!("{e:#}");
            }
            std::process::exit(1);
        }
    }
}

/// Translate `INT`/`TERM`/`USR1`/`USR2` into `ControlMessage`s for the
/// running supervisor iteration. These tasks are spawned once and live for
/// the lifetime of the process, not just one Start iteration, so repeated
/// reload/rotate signals are always serviced.
fn spawn_signal_driver(control_tx: mpsc::Sender<ControlMessage>) {
    let shutdown_tx = control_tx.clone();
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        let _ = shutdown_tx.send(ControlMessage::Shutdown).await;
    });

    let reload_tx = control_tx.clone();
    tokio::spawn(async move {
        let mut sigusr2 =
            signal(SignalKind::user_defined2()).expect("failed to register SIGUSR2 handler");
        loop {
            sigusr2.recv().await;
            let _ = reload_tx.send(ControlMessage::Reload).await;
        }
    });

    tokio::spawn(async move {
        let mut sigusr1 =
            signal(SignalKind::user_defined1()).expect("failed to register SIGUSR1 handler");
        loop {
            sigusr1.recv().await;
            let _ = control_tx.send(ControlMessage::Rotate).await;
        }
    });
}
