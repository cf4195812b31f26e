//! saftbusd: the bus daemon.
//!
//! Binds the rendezvous socket, runs the plugin registry, then serves the
//! event loop until a quit request arrives over the bus or via
//! SIGINT/SIGTERM.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use saftbus::{Container, EventLoop, PluginRegistry, Server, socket_path};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let socket_override = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: saftbusd [--socket <path>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!(
                "  --socket <path>  Bus socket path [default: $SAFTBUS_SOCKET_PATH or {}]",
                saftbus::DEFAULT_SOCKET_PATH
            );
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(socket_override) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Option<PathBuf>, String> {
    let mut socket = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--socket" => {
                i += 1;
                socket = Some(PathBuf::from(
                    args.get(i).ok_or("--socket requires a value")?,
                ));
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unknown argument: {arg}")),
        }
        i += 1;
    }
    Ok(socket)
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let base_level = match std::env::var("SAFTBUS_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => "info",
    };
    let filter = EnvFilter::new(format!("saftbus={base_level},saftbusd={base_level}"));

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn run(socket_override: Option<PathBuf>) -> anyhow::Result<()> {
    let path = socket_path(socket_override);

    let event_loop = EventLoop::new();
    let container = Container::new();

    // Drivers and demo plugins would register here before the daemon starts
    // serving; the stock daemon ships none.
    let registry = PluginRegistry::new();
    registry
        .load_all(&mut container.borrow_mut(), &[])
        .context("loading plugins")?;

    let server = Server::bind(&event_loop, &container, &path)
        .with_context(|| format!("binding bus socket {}", path.display()))?;
    tracing::info!(path = %server.socket_path().display(), "saftbusd up");

    // SIGINT/SIGTERM land on a flag; a housekeeping timer turns it into a
    // loop quit on the loop thread.
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("installing signal handler")?;
    let loop_handle = event_loop.clone();
    event_loop.add_timeout(Duration::from_millis(250), move || {
        if interrupted.load(Ordering::SeqCst) {
            tracing::info!("Interrupted, shutting down");
            loop_handle.quit();
        }
        true
    });

    event_loop.run();
    drop(server);
    tracing::info!("saftbusd down");
    Ok(())
}
