//! File-open client: ships one `bla_open` call and prints the event id.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use function_shipper::{proc_struct, Caller, ShipperConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Function-shipping file client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7000")]
    addr: String,

    /// Connect to a Unix domain socket instead of TCP
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Path to open
    #[arg(short, long, default_value = "/tmp/bla")]
    path: String,

    /// Handle cookie sent with the call
    #[arg(short, long, default_value = "42")]
    cookie: u64,

    /// Response timeout, in seconds
    #[arg(short, long, default_value = "10")]
    timeout: u64,
}

#[derive(Debug, Default)]
struct Handle {
    cookie: u64,
}
proc_struct!(Handle { cookie });

#[derive(Debug, Default)]
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ShipperConfig::default();
    let caller = match &args.socket {
        #[cfg(unix)]
        Some(path) => Caller::connect_pipe(path, config).await?,
        #[cfg(not(unix))]
        Some(_) => return Err("unix sockets are not supported on this platform".into()),
        None => Caller::connect_tcp(args.addr.as_str(), config).await?,
    };

    let mut input = OpenIn {
        path: args.path.clone(),
        handle: Handle { cookie: args.cookie },
    };
    let out: OpenOut = caller
        .call("bla_open", &mut input, Duration::from_secs(args.timeout))
        .await?;

    println!("bla_open({}) -> event_id {} ret {}", args.path, out.event_id, out.ret);
    caller.close().await?;
    Ok(())
}
