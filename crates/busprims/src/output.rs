use std::io::{IsTerminal, Write};

use busprims_core::{client_name, Message};
use busprims_router::{Route, StatsSnapshot};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput {
    src_id: i32,
    src: String,
    dist_id: i32,
    dist: String,
    timestamp: i64,
    category: String,
    data_size: usize,
    data: String,
}

impl MessageOutput {
    fn new(message: &Message) -> Self {
        Self {
            src_id: message.src_id,
            src: client_name(message.src_id),
            dist_id: message.dist_id,
            dist: client_name(message.dist_id),
            timestamp: message.timestamp,
            category: message.category_str(),
            data_size: message.data_trimmed().len(),
            data: data_preview(message.data_trimmed()),
        }
    }
}

pub fn print_message(message: &Message, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&MessageOutput::new(message)),
        OutputFormat::Table => {
            let out = MessageOutput::new(message);
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SRC", "DIST", "TIMESTAMP", "CATEGORY", "DATA"])
                .add_row(vec![
                    out.src,
                    out.dist,
                    out.timestamp.to_string(),
                    out.category,
                    out.data,
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!("{message}"),
        OutputFormat::Raw => print_raw(message.data_trimmed()),
    }
}

#[derive(Serialize)]
struct BusReport<'a> {
    stats: &'a StatsSnapshot,
    routes: &'a [Route],
}

/// Final counters and routing table of a stopped bus.
pub fn print_bus_report(stats: &StatsSnapshot, routes: &[Route], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&BusReport { stats, routes }),
        OutputFormat::Table | OutputFormat::Pretty => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["COUNTER", "VALUE"]);
            for (name, value) in [
                ("forwarded", stats.forwarded),
                ("unresolved", stats.unresolved),
                ("bad_size", stats.bad_size),
                ("no_buffer", stats.no_buffer),
                ("receive_failures", stats.receive_failures),
                ("send_failures", stats.send_failures),
            ] {
                table.add_row(vec![name.to_string(), value.to_string()]);
            }
            println!("{table}");

            if !routes.is_empty() {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(vec!["CLIENT", "ID", "IDENTITY"]);
                for route in routes {
                    table.add_row(vec![
                        route.client.clone(),
                        route.client_id.to_string(),
                        route.identity.clone(),
                    ]);
                }
                println!("{table}");
            }
        }
        OutputFormat::Raw => println!("{}", stats.forwarded),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn data_preview(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", data.len()),
    }
}

#[cfg(test)]
mod tests {
    use busprims_core::ClientId;

    use super::*;

    #[test]
    fn message_output_names_roles_and_trims_fields() {
        let message = Message::new(ClientId::Peer, ClientId::Ui)
            .with_category("status")
            .with_data(b"ready")
            .with_timestamp(42);
        let out = serde_json::to_value(MessageOutput::new(&message)).unwrap();
        assert_eq!(out["src"], "peerxxx");
        assert_eq!(out["dist"], "uixxxxx");
        assert_eq!(out["timestamp"], 42);
        assert_eq!(out["category"], "status");
        assert_eq!(out["data_size"], 5);
        assert_eq!(out["data"], "ready");
    }

    #[test]
    fn binary_data_is_summarised() {
        assert_eq!(data_preview(&[0xff, 0xfe]), "<binary 2 bytes>");
    }
}
