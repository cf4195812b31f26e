//! saftbus-ctl: control and introspection for a running daemon.
//!
//! Speaks the bus protocol as an ordinary client: `status` reads the core
//! object's introspection snapshot, `quit` asks the daemon to leave its
//! event loop, `monitor` subscribes to one object and prints every signal
//! envelope it emits.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use saftbus::{ClientConnection, CoreProxy, Proxy, SignalGroup, socket_path};

enum Command {
    Status { json: bool },
    Quit,
    Monitor { object_path: String },
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let (command, socket_override) = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: saftbus-ctl [--socket <path>] <command>");
            eprintln!();
            eprintln!("Commands:");
            eprintln!("  status [--json]    List objects on the bus");
            eprintln!("  quit               Ask the daemon to shut down");
            eprintln!("  monitor <path>     Print signals emitted by one object");
            process::exit(2);
        }
    };

    if let Err(e) = run(command, socket_override) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<(Command, Option<PathBuf>), String> {
    let mut socket = None;
    let mut positional: Vec<&str> = Vec::new();
    let mut json = false;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--socket" => {
                i += 1;
                socket = Some(PathBuf::from(
                    args.get(i).ok_or("--socket requires a value")?,
                ));
            }
            "--json" => json = true,
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg),
        }
        i += 1;
    }

    let command = match positional.as_slice() {
        ["status"] => Command::Status { json },
        ["quit"] => Command::Quit,
        ["monitor", path] => Command::Monitor {
            object_path: (*path).to_string(),
        },
        [] => return Err("missing command".to_string()),
        other => return Err(format!("unknown command: {}", other.join(" "))),
    };
    Ok((command, socket))
}

fn run(command: Command, socket_override: Option<PathBuf>) -> anyhow::Result<()> {
    let path = socket_path(socket_override);
    let connection = Arc::new(ClientConnection::connect(&path)?);
    let group = SignalGroup::new()?;

    match command {
        Command::Status { json } => {
            let core = CoreProxy::connect(&connection, &group)?;
            let status = core.get_status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                for object in &status.objects {
                    println!(
                        "{:>4}  {:<48} subscribers={}",
                        object.object_id, object.object_path, object.subscriber_count
                    );
                    for (index, name) in object.interface_names.iter().enumerate() {
                        println!("      [{index}] {name}");
                    }
                }
            }
        }
        Command::Quit => {
            CoreProxy::connect(&connection, &group)?.quit()?;
        }
        Command::Monitor { object_path } => {
            let proxy = Proxy::connect(&connection, &group, &object_path)?;
            println!(
                "monitoring {} (object id {})",
                proxy.object_path(),
                proxy.object_id()
            );
            group.set_catch_all(|signal| {
                println!(
                    "signal object={} interface={} signal={} payload_len={}",
                    signal.object_id, signal.interface_no, signal.signal_no,
                    signal.payload.len()
                );
            });
            loop {
                group.wait_for_signal(-1)?;
            }
        }
    }
    Ok(())
}
