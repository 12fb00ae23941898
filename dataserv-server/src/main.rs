//! dataserv — standalone data server entry point.
//!
//! ```text
//! dataserv                       Run on the default port with a shell
//! dataserv -p 12345              Listen on a custom port
//! dataserv -l dataserv.log       Also write logs to a file
//! dataserv -q                    No shell, no console logging
//! dataserv -v debug              Set the log level
//! ```

use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dataserv_core::{DATASERV_PORT, DataServer};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "dataserv", about = "Pub/sub data server for streaming datasets")]
struct Cli {
    /// Port to listen on.
    #[arg(short, long, default_value_t = DATASERV_PORT)]
    port: u16,

    /// Also write logs to this file.
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Disable the interactive shell and console log output.
    #[arg(short, long)]
    quiet: bool,

    /// Log level: trace, debug, info, warn, error.
    #[arg(short, long, default_value = "info")]
    verbosity: String,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.verbosity));
    match (&cli.log, cli.quiet) {
        (Some(path), _) => {
            let file = Arc::new(std::fs::File::create(path)?);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(file)
                .init();
        }
        (None, false) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        // Quiet with no log file: nothing to log to.
        (None, true) => {}
    }

    info!("dataserv v{}", env!("CARGO_PKG_VERSION"));

    let server = DataServer::new();
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.serve_forever(addr).await })
    };

    // Ctrl-C handler.
    {
        let server = server.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl-C received, shutting down");
            server.stop();
        });
    }

    if !cli.quiet {
        let shell_server = server.clone();
        let _shell = tokio::task::spawn_blocking(move || shell(shell_server));
    }

    runner.await??;
    Ok(())
}

// ── Shell ────────────────────────────────────────────────────────

/// Minimal interactive shell on stdin. Ends the process by stopping
/// the server; the accept loop unwinds from there.
fn shell(server: DataServer) {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut line = String::new();
    loop {
        print!("dataserv > ");
        let _ = stdout.flush();
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        match line.trim() {
            "" => {}
            "list" => {
                for name in server.dataset_names() {
                    println!("{name}");
                }
            }
            "quit" => break,
            "help" => {
                println!("list  show dataset names");
                println!("quit  stop the server and exit");
                println!("help  show this message");
            }
            other => println!("unknown command {other:?}, try \"help\""),
        }
    }
    server.stop();
}
