//! File-open server: registers `bla_open`, services one call per expected
//! peer, then finalizes.
//!
//! ```text
//! cargo run --example server_fs -- --peers 3
//! cargo run --example client_fs -- --cookie 42     # prints event_id 232
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use function_shipper::transport::NetworkClass;
use function_shipper::{proc_struct, Shipper, ShipperConfig, TcpNetwork};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Function-shipping file server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:7000")]
    addr: String,

    /// Listen on a Unix domain socket instead of TCP
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Number of calls to service before finalizing
    #[arg(short, long, default_value = "1")]
    peers: usize,

    /// Idle timeout per call, in seconds
    #[arg(short, long, default_value = "10")]
    timeout: u64,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Default, Clone)]
struct Handle {
    cookie: u64,
}
proc_struct!(Handle { cookie });

#[derive(Debug, Default, Clone)]
struct OpenIn {
    path: String,
    handle: Handle,
}
proc_struct!(OpenIn { path, handle });

#[derive(Debug, Default)]
struct OpenOut {
    event_id: u64,
    ret: i32,
}
proc_struct!(OpenOut { event_id, ret });

async fn bla_open(args: OpenIn) -> function_shipper::Result<OpenOut> {
    tracing::info!(path = %args.path, cookie = args.handle.cookie, "bla_open");
    Ok(OpenOut {
        event_id: 232,
        ret: 0,
    })
}

async fn run<N: NetworkClass>(
    network: N,
    config: ShipperConfig,
    args: &Args,
) -> function_shipper::Result<()> {
    let mut shipper = Shipper::builder()
        .config(config)
        .handle_typed("bla_open", bla_open)
        .start(network)?;

    let idle = Duration::from_secs(args.timeout);
    for _ in 0..args.peers {
        match shipper.process(idle).await {
            Ok(outcome) => tracing::info!(
                peer = %outcome.peer,
                procedure = %outcome.procedure,
                success = outcome.is_success(),
                "call serviced"
            ),
            Err(e) if e.is_timeout() => {
                tracing::warn!(seconds = args.timeout, "no call within idle window");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "processing failed");
                shipper.finalize().await?;
                return Err(e);
            }
        }
    }

    tracing::info!(peers = shipper.peer_count(), "finalizing");
    shipper.finalize().await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,function_shipper=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => ShipperConfig::from_json_file(path)?,
        None => ShipperConfig::default(),
    };

    match &args.socket {
        #[cfg(unix)]
        Some(path) => {
            let network = function_shipper::PipeNetwork::bind(path)?;
            tracing::info!(socket = %path.display(), "listening");
            run(network, config, &args).await?;
        }
        #[cfg(not(unix))]
        Some(_) => return Err("unix sockets are not supported on this platform".into()),
        None => {
            let network = TcpNetwork::bind(args.addr.as_str()).await?;
            tracing::info!(addr = %network.local_addr()?, "listening");
            run(network, config, &args).await?;
        }
    }

    Ok(())
}
