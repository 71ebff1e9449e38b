//! Command line front end: runs the synchronization engine against the configured mailbox.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use catchbox::collab::{LogNotifier, StaticLockOracle};
use catchbox::connection::ImapConnector;
use catchbox::types::{ConnectionState, Uid};
use catchbox::{Config, ProcessingFacade, Result, SyncService};

#[derive(Parser)]
#[command(name = "catchbox", version, about = "Disposable inboxes on top of one IMAP mailbox")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "CATCHBOX_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep the index in sync and purge old mail until the connection drops
    Run,
    /// Print the inbox of an address as JSON
    Inbox { address: String },
    /// Print one message of an inbox as JSON
    Read {
        address: String,
        uid: Uid,
        /// Print the raw message source instead of the parsed message
        #[arg(long)]
        raw: bool,
    },
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("catchbox: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(config.log_level.as_deref().unwrap_or("info"));

    let locks = Arc::new(StaticLockOracle::new(&config.locks.addresses));
    let facade = ProcessingFacade::from_config(
        &config,
        ImapConnector::new(config.imap.clone()),
        locks,
        Arc::new(LogNotifier),
    );

    let res = match cli.command {
        Commands::Run => cmd_run(&facade, &config),
        Commands::Inbox { address } => cmd_inbox(&facade, &address),
        Commands::Read { address, uid, raw } => cmd_read(&facade, &address, uid, raw),
    };
    match res {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "catchbox failed");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    println!("{}", json);
    Ok(())
}

fn cmd_inbox(facade: &ProcessingFacade, address: &str) -> Result<ExitCode> {
    facade.sync().connect()?;
    facade.sync().run_polling_pass()?;
    print_json(&facade.inbox(address))?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_read(facade: &ProcessingFacade, address: &str, uid: Uid, raw: bool) -> Result<ExitCode> {
    facade.sync().connect()?;
    print_json(&facade.get_one_full_mail(address, uid, raw)?)?;
    Ok(ExitCode::SUCCESS)
}

// Sleep for `duration`, waking early if the connection faults. Returns whether still usable.
fn sleep_while_connected(sync: &SyncService, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if sync.state() == ConnectionState::Faulted {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(Duration::from_secs(1)));
    }
}

fn cmd_run(facade: &ProcessingFacade, config: &Config) -> Result<ExitCode> {
    let sync = facade.sync();
    let initial = sync.connect_and_load_messages()?;
    if initial.join().is_err() {
        warn!("initial load panicked");
    }
    info!(
        inboxes = facade.mail_count(),
        known = sync.known_uid_count(),
        "mailbox mirrored"
    );

    let refresh = config.sync.refresh_interval();
    let push_check = config.sync.push_check().min(refresh);

    thread::scope(|scope| {
        scope.spawn(|| loop {
            let deleted = facade.run_purge_pass();
            if deleted > 0 {
                info!(deleted, "purged old mail");
            }
            if !sleep_while_connected(sync, refresh) {
                break;
            }
        });

        while sleep_while_connected(sync, push_check) {
            let res = match sync.get_seconds_until_next_refresh() {
                Some(0) | None => sync.run_polling_pass(),
                Some(_) => sync.on_push_notification(),
            };
            if let Err(e) = res {
                warn!(error = %e, "polling pass failed");
            }
        }
    });

    error!("connection faulted, exiting");
    Ok(ExitCode::FAILURE)
}
