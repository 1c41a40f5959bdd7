use std::str::FromStr;

use clap::{Arg, ArgMatches, Command};
use tracing::info;
use tracing_subscriber::EnvFilter;

use replistore::{Config, Controller, ControllerError};

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = Command::new("replistore")
        .version("0.1.0")
        .about("Controller for a replicated file store")
        .arg(
            Arg::new("config")
                .long("config")
                .help("JSON configuration file; flags override its values")
                .required(false),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .help("Port clients and storage nodes connect to")
                .required(false),
        )
        .arg(
            Arg::new("replication-factor")
                .long("replication-factor")
                .help("Number of nodes every file is stored on")
                .required(false),
        )
        .arg(
            Arg::new("timeout-ms")
                .long("timeout-ms")
                .help("How long to wait for storage node acknowledgments")
                .required(false),
        )
        .arg(
            Arg::new("rebalance-period-secs")
                .long("rebalance-period-secs")
                .help("Seconds between rebalance passes")
                .required(false),
        )
        .arg(
            Arg::new("admin-port")
                .long("admin-port")
                .help("Serve the admin HTTP API on this port")
                .required(false),
        )
        .get_matches();

    info!("Starting replicated file store controller");

    let config = build_config(&matches)?;
    info!("Controller configuration: {:?}", config);

    let controller = Controller::new(config)?;
    controller.start().await
}

fn build_config(matches: &ArgMatches) -> Result<Config, ControllerError> {
    let file = match matches.get_one::<String>("config") {
        Some(path) => Some(Config::from_file(path)?),
        None => None,
    };

    let port = flag::<u16>(matches, "port")?;
    let replication_factor = flag::<usize>(matches, "replication-factor")?;
    let timeout_ms = flag::<u64>(matches, "timeout-ms")?;
    let rebalance_period_secs = flag::<u64>(matches, "rebalance-period-secs")?;
    let admin_port = flag::<u16>(matches, "admin-port")?;

    let mut config = match file {
        Some(config) => config,
        None => Config::new(
            port.ok_or_else(|| missing("port"))?,
            replication_factor.ok_or_else(|| missing("replication-factor"))?,
            timeout_ms.ok_or_else(|| missing("timeout-ms"))?,
            rebalance_period_secs.ok_or_else(|| missing("rebalance-period-secs"))?,
        ),
    };

    if let Some(port) = port {
        config.port = port;
    }
    if let Some(replication_factor) = replication_factor {
        config.replication_factor = replication_factor;
    }
    if let Some(timeout_ms) = timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(rebalance_period_secs) = rebalance_period_secs {
        config.rebalance_period_secs = rebalance_period_secs;
    }
    if admin_port.is_some() {
        config.admin_port = admin_port;
    }

    config.validate()?;
    Ok(config)
}

fn flag<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, ControllerError>
where
    T::Err: std::fmt::Display,
{
    matches
        .get_one::<String>(name)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|e| ControllerError::InvalidConfig(format!("Invalid --{}: {}", name, e)))
        })
        .transpose()
}

fn missing(name: &str) -> ControllerError {
    ControllerError::InvalidConfig(format!("--{} is required without --config", name))
}
