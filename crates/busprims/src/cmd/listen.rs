use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use busprims_core::{ClientId, Message};
use busprims_router::Transmitter;
use tracing::{info, warn};

use crate::cmd::{install_stop_handler, ListenArgs};
use crate::exit::{router_error, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

const RECV_POLL: Duration = Duration::from_millis(500);

/// Category of the message a listener sends so the bus learns its route.
const REGISTER_CATEGORY: &str = "register";

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let transport = args.client.connect()?;

    // The bus only learns a route from traffic, so announce ourselves.
    let register = Message::new(args.client.role, ClientId::Router).with_category(REGISTER_CATEGORY);
    transport
        .send(&register.to_bytes())
        .map_err(|err| router_error("register failed", err))?;
    info!(role = %args.client.role, endpoint = %args.client.endpoint, "listening");

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    install_stop_handler(move || flag.store(false, Ordering::SeqCst))?;

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        let body = transport
            .recv(RECV_POLL)
            .map_err(|err| router_error("receive failed", err))?;
        let Some(body) = body else {
            continue;
        };

        let message = match Message::decode(&body) {
            Ok(message) => message,
            Err(size) => {
                warn!(size, "ignoring body that is not a bus message");
                continue;
            }
        };

        print_message(&message, format);
        printed = printed.saturating_add(1);

        if let Some(count) = args.count {
            if printed >= count {
                break;
            }
        }
    }

    Ok(SUCCESS)
}
