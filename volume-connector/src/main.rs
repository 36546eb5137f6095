//! Volume connector CLI
//!
//! Runs one connector operation on this host. Connection properties are
//! read as JSON from a file or stdin; results are printed as JSON on stdout
//! and logs go to stderr.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use volume_connector::{
    ConnectionProperties, ConnectorConfig, ConnectorFactory, DeviceInfo, DisconnectOptions,
    ProcessExecutor, SystemHost, host_properties,
};

/// CLI arguments for the volume connector
#[derive(Parser, Debug)]
#[command(name = "volume-connector")]
#[command(about = "Attach and detach block volumes on this host")]
struct Args {
    /// JSON configuration file
    #[arg(long, env = "VOLUME_CONNECTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach a volume and print its device info
    Connect {
        /// Connection properties JSON file, `-` for stdin
        #[arg(default_value = "-")]
        properties: PathBuf,
    },
    /// Detach a volume and print the cleanup report
    Disconnect {
        #[arg(default_value = "-")]
        properties: PathBuf,
        /// Device info JSON returned by connect
        #[arg(long)]
        device_info: Option<PathBuf>,
        /// Continue past failed flushes
        #[arg(long)]
        force: bool,
        /// Report unconfirmed cleanup instead of failing
        #[arg(long)]
        ignore_errors: bool,
    },
    /// Pick up a size change and print the new size in bytes
    Extend {
        #[arg(default_value = "-")]
        properties: PathBuf,
    },
    /// Print the device paths of an attached volume
    Paths {
        #[arg(default_value = "-")]
        properties: PathBuf,
    },
    /// Print this host's initiator identity
    HostProperties,
}

fn read_input(path: &Path) -> std::io::Result<String> {
    if path == Path::new("-") {
        let mut input = String::new();
        std::io::stdin().read_to_string(&mut input)?;
        Ok(input)
    } else {
        std::fs::read_to_string(path)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &args.config {
        Some(path) => ConnectorConfig::from_file(path)?,
        None => ConnectorConfig::default(),
    };
    let exec = Arc::new(
        ProcessExecutor::new(config.root_helper.clone()).with_timeout(config.command_timeout()),
    );
    let host = Arc::new(SystemHost);

    if let Command::HostProperties = args.command {
        let props = host_properties(exec.as_ref(), host.as_ref(), &config).await;
        return print_json(&props);
    }

    let factory = ConnectorFactory::new(exec, host, config);
    match args.command {
        Command::Connect { properties } => {
            let props = ConnectionProperties::from_json(&read_input(&properties)?)?;
            let connector = factory.create_for_properties(&props)?;
            info!(protocol = %connector.protocol(), "Connecting volume");
            print_json(&connector.connect(&props).await?)
        }
        Command::Disconnect {
            properties,
            device_info,
            force,
            ignore_errors,
        } => {
            let props = ConnectionProperties::from_json(&read_input(&properties)?)?;
            let device_info: Option<DeviceInfo> = match device_info {
                Some(path) => Some(serde_json::from_str(&std::fs::read_to_string(path)?)?),
                None => None,
            };
            let options = DisconnectOptions {
                force,
                ignore_errors,
            };
            let connector = factory.create_for_properties(&props)?;
            info!(protocol = %connector.protocol(), "Disconnecting volume");
            print_json(
                &connector
                    .disconnect(&props, device_info.as_ref(), &options)
                    .await?,
            )
        }
        Command::Extend { properties } => {
            let props = ConnectionProperties::from_json(&read_input(&properties)?)?;
            let connector = factory.create_for_properties(&props)?;
            let size = connector.extend_volume(&props).await?;
            print_json(&serde_json::json!({ "size": size }))
        }
        Command::Paths { properties } => {
            let props = ConnectionProperties::from_json(&read_input(&properties)?)?;
            let connector = factory.create_for_properties(&props)?;
            print_json(&connector.get_volume_paths(&props).await?)
        }
        Command::HostProperties => Ok(()),
    }
}
