use std::time::Duration;

use busprims_core::{ClientId, DEFAULT_ENDPOINT};
use busprims_router::{FrameTransport, TransportConfig, Transmitter};
use busprims_transport::SocketOption;
use clap::{Args, Subcommand};

use crate::exit::{router_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod bus;
pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the message bus until interrupted.
    Bus(BusArgs),
    /// Send a single message as one client role.
    Send(SendArgs),
    /// Connect as a client role and print forwarded messages.
    Listen(ListenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Bus(args) => bus::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct BusArgs {
    /// Endpoint to bind (ipc://path or tcp://host:port).
    #[arg(long, env = "BUSPRIMS_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,
    /// Server CURVE public key (40 characters).
    #[arg(long, env = "BUSPRIMS_PUBLIC_KEY", hide_env_values = true)]
    pub public_key: Option<String>,
    /// Server CURVE secret key (40 characters).
    #[arg(long, env = "BUSPRIMS_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,
    /// Bound on one poll, and so on shutdown latency (e.g. 500ms, 1s).
    #[arg(long, default_value = "500ms")]
    pub poll_interval: String,
}

/// Connection settings shared by client commands.
#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Bus endpoint (ipc://path or tcp://host:port).
    #[arg(long, env = "BUSPRIMS_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,
    /// Client role to act as (manager, peer, ui, router, or 0-3).
    #[arg(long = "as", value_name = "ROLE", default_value = "peer", value_parser = parse_role)]
    pub role: ClientId,
    /// Transport identity. Default: the role's fixed id.
    #[arg(long)]
    pub identity: Option<String>,
    /// Connection timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub connect_timeout: String,
}

impl ClientArgs {
    /// Connect to the bus, announcing the configured identity.
    pub fn connect(&self) -> CliResult<FrameTransport> {
        let timeout = parse_duration(&self.connect_timeout)?;
        let transport: FrameTransport =
            FrameTransport::with_config(TransportConfig::default().with_connect_timeout(timeout));
        let identity = self
            .identity
            .clone()
            .unwrap_or_else(|| self.role.identity().to_string());
        transport
            .set_sockopt(SocketOption::Identity(identity.into()))
            .map_err(|err| router_error("invalid identity", err))?;
        transport
            .connect(&self.endpoint, 0)
            .map_err(|err| router_error("connect failed", err))?;
        Ok(transport)
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub client: ClientArgs,
    /// Destination role.
    #[arg(long, value_name = "ROLE", value_parser = parse_role)]
    pub to: ClientId,
    /// Message category (at most 30 bytes).
    #[arg(long, default_value = "")]
    pub category: String,
    /// Raw string data (at most 256 bytes).
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read data from file (at most 256 bytes).
    #[arg(long, conflicts_with = "data")]
    pub file: Option<std::path::PathBuf>,
    /// Wait for one forwarded message and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    #[command(flatten)]
    pub client: ClientArgs,
    /// Exit after printing N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

fn parse_role(input: &str) -> Result<ClientId, String> {
    ClientId::parse(input)
        .ok_or_else(|| format!("unknown role {input:?} (expected manager, peer, ui, router or 0-3)"))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Install a Ctrl-C / SIGTERM handler running `stop`.
pub fn install_stop_handler<F>(stop: F) -> CliResult<()>
where
    F: Fn() + Send + 'static,
{
    ctrlc::set_handler(stop).map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert_eq!(parse_duration("").unwrap_err().code, USAGE);
    }

    #[test]
    fn roles_parse_by_name_and_number() {
        assert_eq!(parse_role("UI").unwrap(), ClientId::Ui);
        assert_eq!(parse_role("3").unwrap(), ClientId::Router);
        assert!(parse_role("7").is_err());
    }
}
