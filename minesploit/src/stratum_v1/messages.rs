//! Stratum v1 message envelope and the frame codec.
//!
//! Every frame on the wire is one JSON object. [`decode`] turns a frame
//! into a [`Message`] and [`encode`] turns it back. Decoding is done by hand
//! rather than through `#[derive(Deserialize)]` so that each way a frame can
//! be wrong maps to its own [`DecodeError`] variant; relays need to tell
//! "not JSON" from "JSON but not Stratum" when deciding whether to forward.
//!
//! Stratum v1 predates JSON-RPC 2.0 and bends it: notifications carry
//! `"id": null` instead of omitting the id and errors are arrays such as
//! `[20, "Other/Unknown", null]`. Some pools and miners still add a
//! `jsonrpc` member or vendor fields; those ride along in `extra` so a
//! rewritten message re-encodes with everything it arrived with.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use super::error::DecodeError;
use super::session::Job;

/// Method names defined by Stratum v1.
pub mod method {
    pub const SUBSCRIBE: &str = "mining.subscribe";
    pub const AUTHORIZE: &str = "mining.authorize";
    pub const SUBMIT: &str = "mining.submit";
    pub const GET_TRANSACTIONS: &str = "mining.get_transactions";
    pub const NOTIFY: &str = "mining.notify";
    pub const SET_DIFFICULTY: &str = "mining.set_difficulty";
}

/// JSON-RPC message envelope.
///
/// Exactly one of {`method`} or {`result`, `error`} is present on the wire,
/// which is what separates the two variants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    /// Request or notification (`id` is `None` for notifications)
    Request {
        id: Option<u64>,
        method: String,
        params: Value,
        /// Top-level members other than the ones above
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// Response to a request
    ///
    /// `id` is optional because some pools answer malformed requests with
    /// `"id": null`.
    Response {
        id: Option<u64>,
        /// Result value (`None` when the wire carried null or omitted it)
        result: Option<Value>,
        /// Error value (`None` when the wire carried null or omitted it)
        error: Option<Value>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl Message {
    /// Create a new request message.
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        Message::Request {
            id: Some(id),
            method: method.into(),
            params,
            extra: Map::new(),
        }
    }

    /// Create a notification (request without ID).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Message::Request {
            id: None,
            method: method.into(),
            params,
            extra: Map::new(),
        }
    }

    /// Create a successful response.
    pub fn response(id: Option<u64>, result: Value) -> Self {
        Message::Response {
            id,
            result: Some(result),
            error: None,
            extra: Map::new(),
        }
    }

    /// Create an error response in Stratum's `[code, message, traceback]`
    /// layout.
    pub fn error_response(id: Option<u64>, code: i64, message: &str) -> Self {
        Message::Response {
            id,
            result: None,
            error: Some(serde_json::json!([code, message, null])),
            extra: Map::new(),
        }
    }

    /// Build the `mining.notify` notification for a job.
    pub fn notify(job: &Job) -> Self {
        Message::notification(method::NOTIFY, job.to_notify_params())
    }

    /// Get the message ID if present.
    pub fn id(&self) -> Option<u64> {
        match self {
            Message::Request { id, .. } | Message::Response { id, .. } => *id,
        }
    }

    /// Replace the message ID.
    pub fn set_id(&mut self, new_id: Option<u64>) {
        match self {
            Message::Request { id, .. } | Message::Response { id, .. } => *id = new_id,
        }
    }

    /// Check if this is a notification (request without ID).
    pub fn is_notification(&self) -> bool {
        matches!(self, Message::Request { id: None, .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response { .. })
    }

    /// Get the method name for requests.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } => Some(method),
            Message::Response { .. } => None,
        }
    }

    /// Positional parameters of a request. Empty for responses and for
    /// requests whose params are not an array.
    pub fn params(&self) -> &[Value] {
        match self {
            Message::Request {
                params: Value::Array(params),
                ..
            } => params,
            _ => &[],
        }
    }

    /// Mutable access to the positional parameters, if there are any.
    pub fn params_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Message::Request {
                params: Value::Array(params),
                ..
            } => Some(params),
            _ => None,
        }
    }

    /// Result of a successful response.
    pub fn result(&self) -> Option<&Value> {
        match self {
            Message::Response { result, .. } => result.as_ref(),
            Message::Request { .. } => None,
        }
    }

    /// Error of a failed response.
    pub fn error(&self) -> Option<&Value> {
        match self {
            Message::Response { error, .. } => error.as_ref(),
            Message::Request { .. } => None,
        }
    }

    /// Overwrite a response so it reports success (`result: true`,
    /// `error: null`). Requests are left untouched.
    pub fn force_accept(&mut self) {
        if let Message::Response { result, error, .. } = self {
            *result = Some(Value::Bool(true));
            *error = None;
        }
    }
}

/// Decode one frame (without its trailing newline) into a [`Message`].
pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
    let text = std::str::from_utf8(frame)?;
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(mut obj) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let id = decode_id(&mut obj)?;

    match obj.remove("method") {
        Some(Value::String(method)) => {
            let params = obj.remove("params").unwrap_or(Value::Array(Vec::new()));
            Ok(Message::Request {
                id,
                method,
                params,
                extra: obj,
            })
        }
        Some(_) => Err(DecodeError::InvalidMethod),
        None => {
            if !obj.contains_key("result") && !obj.contains_key("error") {
                return Err(DecodeError::NotRpc);
            }
            let result = take_non_null(&mut obj, "result");
            let error = take_non_null(&mut obj, "error");
            Ok(Message::Response {
                id,
                result,
                error,
                extra: obj,
            })
        }
    }
}

fn decode_id(obj: &mut Map<String, Value>) -> Result<Option<u64>, DecodeError> {
    match obj.remove("id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_u64().map(Some).ok_or(DecodeError::InvalidId),
        Some(_) => Err(DecodeError::InvalidId),
    }
}

fn take_non_null(obj: &mut Map<String, Value>, key: &str) -> Option<Value> {
    obj.remove(key).filter(|v| !v.is_null())
}

/// Encode a message as one frame, newline not included.
///
/// Responses always carry both `result` and `error`, with null standing in
/// for whichever is absent, matching what pools send.
pub fn encode(msg: &Message) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

/// Events emitted by the Stratum client.
///
/// These events are sent via channel to the client consumer
/// to notify about protocol state changes and new work.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Successfully subscribed to pool
    Subscribed {
        /// Session id, when the pool's subscribe result carries one
        session_id: Option<String>,
        /// Extranonce1 value (hex)
        extranonce1: String,
        /// Extranonce2 size in bytes
        extranonce2_size: usize,
    },

    /// Pool accepted the worker credentials
    Authorized,

    /// New mining job received from pool
    NewJob(Arc<Job>),

    /// Difficulty changed
    DifficultyChanged(f64),

    /// Share was accepted by pool
    ShareAccepted { job_id: String },

    /// Share was rejected by pool
    ShareRejected { job_id: String, reason: String },

    /// Disconnected from pool
    Disconnected,
}

/// Commands sent to the Stratum client.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    /// Submit a share to the pool
    SubmitShare(SubmitParams),
}

/// Parameters for `mining.submit`, minus the worker name which the client
/// fills in from its configuration.
///
/// Values are the hex strings Stratum puts on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
}

impl SubmitParams {
    /// Convert to Stratum's positional parameter list.
    pub fn to_stratum_json(&self, worker_name: &str) -> Value {
        serde_json::json!([
            worker_name,
            self.job_id,
            self.extranonce2,
            self.ntime,
            self.nonce,
        ])
    }
}
