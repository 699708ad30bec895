use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, PartialEq, ValueEnum)]
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
struct ReplyOutput<'a> {
    method: &'a str,
    #[serde(rename = "final")]
    is_final: bool,
    payload: &'a Value,
}

/// Print one reply payload.
pub fn print_reply(method: &str, is_final: bool, payload: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ReplyOutput {
                method,
                is_final,
                payload,
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
                .set_header(vec!["METHOD", "KIND", "PAYLOAD"])
                .add_row(vec![
                    method.to_string(),
                    reply_kind(is_final).to_string(),
                    payload.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let rendered =
                serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
            println!("{method} ({}): {rendered}", reply_kind(is_final));
        }
        OutputFormat::Raw => print_raw(payload),
    }
}

/// Bare payload, strings without quotes.
pub fn print_raw(payload: &Value) {
    let mut out = std::io::stdout();
    let _ = match payload {
        Value::String(text) => writeln!(out, "{text}"),
        other => writeln!(out, "{other}"),
    };
    let _ = out.flush();
}

fn reply_kind(is_final: bool) -> &'static str {
    if is_final {
        "final"
    } else {
        "partial"
    }
}
