use std::fs;
use std::time::{Duration, Instant};

use busprims_core::{Message, CATEGORY_LEN, DATA_LEN};
use busprims_router::{FrameTransport, RouterError, Transmitter};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{io_error, router_error, CliError, CliResult, DATA_INVALID, SUCCESS, TIMEOUT};
use crate::output::{print_message, OutputFormat};

const REPLY_POLL: Duration = Duration::from_millis(250);

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    if args.category.len() > CATEGORY_LEN {
        return Err(CliError::new(
            DATA_INVALID,
            format!(
                "category is {} bytes, max {CATEGORY_LEN}",
                args.category.len()
            ),
        ));
    }
    let data = resolve_data(&args)?;
    let wait_timeout = parse_duration(&args.wait_timeout)?;

    let transport = args.client.connect()?;
    let message = Message::new(args.client.role, args.to)
        .with_category(&args.category)
        .with_data(&data);
    transport
        .send(&message.to_bytes())
        .map_err(|err| router_error("send failed", err))?;
    debug!(src = %args.client.role, dist = %args.to, "message sent");

    if args.wait {
        let reply = wait_for_reply(&transport, wait_timeout)?;
        print_message(&reply, format);
    }

    Ok(SUCCESS)
}

fn resolve_data(args: &SendArgs) -> CliResult<Vec<u8>> {
    let data = if let Some(data) = &args.data {
        data.as_bytes().to_vec()
    } else if let Some(path) = &args.file {
        fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?
    } else {
        Vec::new()
    };

    if data.len() > DATA_LEN {
        return Err(CliError::new(
            DATA_INVALID,
            format!("data is {} bytes, max {DATA_LEN}", data.len()),
        ));
    }
    Ok(data)
}

trait BodySource {
    fn next_body(&self, timeout: Duration) -> Result<Option<Bytes>, RouterError>;
}

impl BodySource for FrameTransport {
    fn next_body(&self, timeout: Duration) -> Result<Option<Bytes>, RouterError> {
        self.recv(timeout)
    }
}

/// First well-formed message before `timeout`; other bodies are skipped.
fn wait_for_reply<S: BodySource>(source: &S, timeout: Duration) -> CliResult<Message> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CliError::new(
                TIMEOUT,
                format!("no reply within {timeout:?}"),
            ));
        }
        let body = source
            .next_body(remaining.min(REPLY_POLL))
            .map_err(|err| router_error("receive failed", err))?;
        if let Some(body) = body {
            match Message::decode(&body) {
                Ok(message) => return Ok(message),
                Err(size) => warn!(size, "ignoring body that is not a bus message"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use busprims_core::ClientId;

    use super::*;

    struct ScriptedSource {
        bodies: RefCell<VecDeque<Option<Bytes>>>,
    }

    impl ScriptedSource {
        fn new(bodies: Vec<Option<Bytes>>) -> Self {
            Self {
                bodies: RefCell::new(bodies.into()),
            }
        }
    }

    impl BodySource for ScriptedSource {
        fn next_body(&self, timeout: Duration) -> Result<Option<Bytes>, RouterError> {
            match self.bodies.borrow_mut().pop_front() {
                Some(body) => Ok(body),
                None => {
                    std::thread::sleep(timeout);
                    Ok(None)
                }
            }
        }
    }

    #[test]
    fn wait_for_reply_skips_malformed_bodies() {
        let reply = Message::new(ClientId::Manager, ClientId::Peer).with_data(b"ack");
        let source = ScriptedSource::new(vec![
            None,
            Some(Bytes::from_static(b"garbage")),
            Some(Bytes::from(reply.to_bytes())),
        ]);

        let got = wait_for_reply(&source, Duration::from_secs(1)).expect("reply should arrive");
        assert_eq!(got, reply);
    }

    #[test]
    fn wait_for_reply_times_out_with_124() {
        let source = ScriptedSource::new(Vec::new());
        let err = wait_for_reply(&source, Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.code, TIMEOUT);
    }
}
