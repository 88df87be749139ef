//! Turns captured Stratum messages into one-line summaries.

use std::collections::HashMap;
use std::fmt;

use colored::Colorize;
use serde_json::Value;

use crate::capture::{CaptureRecord, Source};

/// What kind of JSON-RPC message a record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Request,
    Notification,
    Response,
}

/// A record after dissection.
#[derive(Debug)]
pub struct Dissected {
    pub source: Source,
    pub kind: Kind,
    /// For responses, the method of the request being answered, if seen
    pub method: Option<String>,
    pub summary: String,
}

impl fmt::Display for Dissected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.source {
            Source::Miner => "miner → pool".cyan(),
            Source::Pool => "pool → miner".magenta(),
        };
        let method = self.method.as_deref().unwrap_or("?");
        let label = match self.kind {
            Kind::Request => method.bold(),
            Kind::Notification => method.yellow(),
            Kind::Response => format!("re: {}", method).dimmed(),
        };
        write!(f, "{}  {}  {}", arrow, label, self.summary)
    }
}

/// Stateful dissector; remembers request ids so responses can be labelled
/// with the method they answer.
#[derive(Debug, Default)]
pub struct Dissector {
    /// (sender of the request, id) -> method
    pending: HashMap<(Source, u64), String>,
}

impl Dissector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dissect(&mut self, record: &CaptureRecord) -> Dissected {
        let msg = &record.message;
        let id = msg.get("id").and_then(Value::as_u64);
        let params = msg
            .get("params")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        if let Some(method) = msg.get("method").and_then(Value::as_str) {
            let kind = match id {
                Some(id) => {
                    self.pending.insert((record.source, id), method.to_string());
                    Kind::Request
                }
                None => Kind::Notification,
            };
            return Dissected {
                source: record.source,
                kind,
                method: Some(method.to_string()),
                summary: summarize_call(method, id, params),
            };
        }

        let requester = match record.source {
            Source::Miner => Source::Pool,
            Source::Pool => Source::Miner,
        };
        let method = id.and_then(|id| self.pending.remove(&(requester, id)));
        Dissected {
            source: record.source,
            kind: Kind::Response,
            method,
            summary: summarize_response(id, msg),
        }
    }
}

fn text(params: &[Value], i: usize) -> &str {
    params.get(i).and_then(Value::as_str).unwrap_or("?")
}

fn summarize_call(method: &str, id: Option<u64>, params: &[Value]) -> String {
    let id = id.map_or_else(String::new, |id| format!("#{} ", id));
    match method {
        "mining.subscribe" => format!("{}agent={}", id, text(params, 0)),
        "mining.authorize" => format!("{}worker={}", id, text(params, 0)),
        "mining.submit" => format!(
            "{}worker={} job={} extranonce2={} ntime={} nonce={}",
            id,
            text(params, 0),
            text(params, 1),
            text(params, 2),
            text(params, 3),
            text(params, 4),
        ),
        "mining.notify" => format!(
            "job={} branches={} clean={}",
            text(params, 0),
            params.get(4).and_then(Value::as_array).map_or(0, Vec::len),
            params.get(8).and_then(Value::as_bool).unwrap_or(false),
        ),
        "mining.set_difficulty" => format!(
            "difficulty={}",
            params.first().map_or_else(|| "?".to_string(), Value::to_string)
        ),
        _ => format!("{}params={}", id, Value::Array(params.to_vec())),
    }
}

fn summarize_response(id: Option<u64>, msg: &Value) -> String {
    let id = id.map_or_else(|| "#null".to_string(), |id| format!("#{}", id));
    match msg.get("error") {
        Some(error) if !error.is_null() => format!("{} {} {}", id, "error".red(), error),
        _ => {
            let result = msg.get("result").unwrap_or(&Value::Null);
            match result {
                Value::Bool(true) => format!("{} {}", id, "true".green()),
                Value::Bool(false) => format!("{} {}", id, "false".red()),
                other => format!("{} {}", id, other),
            }
        }
    }
}
