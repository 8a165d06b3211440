use busprims_router::{Bus, BusConfig, RouterConfig};
use busprims_transport::Endpoint;
use tracing::info;

use crate::cmd::{install_stop_handler, parse_duration, BusArgs};
use crate::exit::{router_error, transport_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_bus_report, OutputFormat};

pub fn run(args: BusArgs, format: OutputFormat) -> CliResult<i32> {
    let endpoint =
        Endpoint::parse(&args.endpoint).map_err(|err| transport_error("invalid endpoint", err))?;
    let poll_interval = parse_duration(&args.poll_interval)?;
    let config = BusConfig::default()
        .with_endpoint(endpoint)
        .with_router_config(RouterConfig::default().with_poll_interval(poll_interval));
    let mut bus: Bus = Bus::with_config(config);

    match (&args.public_key, &args.secret_key) {
        (Some(public), Some(secret)) => {
            bus.set_security(public, secret);
        }
        (None, None) => {}
        _ => {
            return Err(CliError::new(
                USAGE,
                "--public-key and --secret-key must be given together",
            ))
        }
    }

    let cancel = bus.cancel_handle();
    install_stop_handler(move || cancel.cancel())?;

    bus.run().map_err(|err| router_error("bus failed", err))?;
    info!("shutdown complete");

    print_bus_report(
        &bus.stats().snapshot(),
        &bus.routing_table().snapshot(),
        format,
    );
    Ok(SUCCESS)
}
