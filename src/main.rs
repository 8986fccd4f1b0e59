//! NVDA Remote relay server - Entry Point
//!
//! Parses the command line, resolves the TLS certificate and runs the
//! accept loop.

use std::path::PathBuf;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use remote_relay::{tls, RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "remote-relay")]
#[command(about = "TLS relay server for NVDA remote access clients")]
struct Args {
    /// Listening address
    #[arg(long, default_value = "0.0.0.0:6837")]
    addr: String,

    /// Certificate file holding the private key and certificate, PEM format
    #[arg(long, default_value = "server.pem")]
    cert: PathBuf,

    /// Generate a self-signed certificate instead of loading one
    #[arg(long)]
    cert_gen: bool,

    /// Write the generated certificate to the --cert path. Without it the
    /// server has a different certificate each launch.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    cert_gen_write: bool,

    /// Inject an origin field into relayed messages. Required for braille
    /// displays to work correctly.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    send_origin: bool,

    /// Message of the day sent to clients joining a channel
    #[arg(long, default_value = "")]
    motd: String,

    /// Force clients to always display the message of the day
    #[arg(long)]
    motd_force: bool,
}

#[tokio::main]
async fn main() {
    // Use RUST_LOG to control log level, e.g. RUST_LOG=remote_relay=trace
    // to intercept protocol data.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("remote_relay=info")),
        )
        .init();

    let args = Args::parse();

    let tls = if args.cert_gen {
        tls::generate(args.cert_gen_write.then_some(args.cert.as_path()))
    } else {
        tls::load(&args.cert)
    };
    let tls = match tls {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "certificate loading failed");
            std::process::exit(1);
        }
    };

    let config = RelayConfig {
        motd: args.motd,
        motd_force_display: args.motd_force,
        send_origin: args.send_origin,
    };

    let server = RelayServer::new(config, Some(tls));
    if let Err(err) = server.start(&args.addr).await {
        error!(%err, "server error");
        std::process::exit(1);
    }
}
