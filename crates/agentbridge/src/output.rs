use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use agentbridge_envelope::{Action, Envelope, Map, TelemetryMessage};
use agentbridge_peer::Reply;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    topic: &'a str,
    seqno: Option<u64>,
    header: &'a Map,
    data: &'a Map,
    received_at: String,
}

pub fn print_message(message: &TelemetryMessage, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                topic: &message.topic,
                seqno: message.seqno(),
                header: &message.header,
                data: &message.data,
                received_at: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["TOPIC", "SEQNO", "DATA"])
                .add_row(vec![
                    message.topic.clone(),
                    message
                        .seqno()
                        .map_or_else(|| "-".to_string(), |seqno| seqno.to_string()),
                    compact(&message.data),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("new message on topic: {}", message.topic);
            println!("header: {}", compact(&message.header));
            println!("data: {}", compact(&message.data));
            println!();
        }
        OutputFormat::Raw => {
            let envelope = Envelope::new(message.header.clone(), message.data.clone());
            print_line(&envelope.to_bytes());
        }
    }
}

#[derive(Serialize)]
struct ReplyOutput<'a> {
    seqno: u64,
    agent_id: u32,
    action: Action,
    status: Option<&'a str>,
    reason: Option<&'a str>,
    reply: &'a Envelope,
}

pub fn print_reply(reply: &Reply, agent_id: u32, action: Action, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ReplyOutput {
                seqno: reply.request_seqno(),
                agent_id,
                action,
                status: reply.status(),
                reason: reply.reason(),
                reply: reply.envelope(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SEQNO", "AGENT", "ACTION", "STATUS", "REASON"])
                .add_row(vec![
                    reply.request_seqno().to_string(),
                    agent_id.to_string(),
                    action.to_string(),
                    reply.status().unwrap_or("-").to_string(),
                    reply.reason().unwrap_or("").to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "reply: {}",
                String::from_utf8_lossy(&reply.envelope().to_bytes())
            );
        }
        OutputFormat::Raw => print_line(&reply.envelope().to_bytes()),
    }
}

fn print_line(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.write_all(b"\n");
    let _ = out.flush();
}

fn compact(map: &Map) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
