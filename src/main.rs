// src/main.rs

//! # famon Main Entry Point
//!
//! Monitors directories (or files, with `--file`) and prints change events while
//! accepting commands on standard input:
//!
//! - `ls`: list the known members of the monitored paths.
//! - `q`, `quit`: exit.
//!
//! The monitor stops after `--duration` seconds or on Ctrl-C.

use anyhow::{Context, Result};
use famon::config::AppConfig;
use famon::console::{Command, Listing};
use famon::event_loop::EventLoop;
use famon::session::Session;
use std::cell::RefCell;
use std::io::{BufRead, Write};
use std::rc::Rc;
use std::time::Instant;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// The main entry point for the famon monitor.
///
/// This function performs the following steps:
/// 1. Loads the configuration from CLI, file, and environment.
/// 2. Initializes the tracing subscriber for logging.
/// 3. Opens a session and subscribes every configured path.
/// 4. Runs the event loop with standard input as an auxiliary source until the
///    duration elapses, `quit` is typed, or Ctrl-C is received.
/// 5. Closes the session, cancelling all requests.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let app_config = match AppConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&app_config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_max_level(tracing::Level::TRACE)
        .with_writer(std::io::stderr) // Log to stderr
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Setting default tracing subscriber failed")?;

    tracing::info!("famon starting with configuration: {:?}", app_config);

    if app_config.paths.is_empty() {
        tracing::error!("No paths to monitor. Please specify paths via CLI or in famon.toml.");
        std::process::exit(1);
    }

    let mut session = Session::open_with(&app_config.monitor.identity, &app_config.monitor)
        .context("Couldn't open monitor session")?;
    for path in &app_config.paths {
        let request = if app_config.files {
            session.monitor_file(path)
        } else {
            session.monitor_directory(path)
        };
        request.with_context(|| format!("Couldn't monitor {path}"))?;
    }

    let listing = Rc::new(RefCell::new(Listing::new()));
    let json = app_config.json;

    let stats = {
        let mut event_loop = EventLoop::new(&mut session)
            .with_poll_interval(app_config.monitor.poll_interval())
            .with_deadline(Instant::now() + app_config.duration);
        let stop = event_loop.stop_handle();

        let event_listing = Rc::clone(&listing);
        event_loop.on_event(move |event| {
            let line = event_listing.borrow_mut().apply(&event);
            if json {
                println!("{}", serde_json::to_string(&event)?);
            } else if let Some(line) = line {
                println!("{line}");
                prompt();
            }
            Ok(())
        });

        let (stdin_tx, stdin_source) = event_loop.source_channel::<String>();
        let command_stop = stop.clone();
        let command_listing = Rc::clone(&listing);
        event_loop.add_source("stdin", stdin_source, move |line: String| {
            match Command::parse(&line) {
                Some(Command::List) => {
                    println!("File list: {}", command_listing.borrow().render());
                }
                Some(Command::Quit) => {
                    command_stop.stop();
                    return Ok(());
                }
                Some(Command::Unknown(cmd)) => println!("Unknown command: {cmd}"),
                None => {}
            }
            prompt();
            Ok(())
        });

        // Interactive stdin reads block, so they get a dedicated thread rather than a task.
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if stdin_tx.send(line).is_err() {
                    break;
                }
            }
        });

        let ctrl_c_stop = stop.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Ctrl-C received, initiating shutdown...");
                    ctrl_c_stop.stop();
                }
                Err(err) => tracing::error!("Failed to listen for Ctrl-C signal: {}", err),
            }
        });

        println!("Commands: ls, q, quit");
        prompt();
        event_loop.run().await
    };

    session.close().context("Couldn't close monitor session")?;
    tracing::info!("famon finished: {:?}", stats);
    println!("Done.");
    Ok(())
}
