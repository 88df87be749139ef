//! Stratum v1 client implementation.
//!
//! This module contains the worker-side client that manages the connection
//! lifecycle, protocol state, and event emission.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connection::{Connection, Transport};
use super::error::{StratumError, StratumResult};
use super::messages::{ClientCommand, ClientEvent, Message, SubmitParams, method};
use super::protocol::{error_reason, parse_subscribe_result};
use super::session::{Job, Session};
use crate::tracing::prelude::*;

/// Pool connection configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Pool URL (stratum+tcp://host:port or host:port)
    pub url: String,

    /// Worker username
    pub username: String,

    /// Worker password
    pub password: String,

    /// Session id to resume, sent as the second subscribe parameter
    pub session_id: Option<String>,

    /// How long to wait for a connection or a response
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: "x".to_string(),
            session_id: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Stratum v1 client.
///
/// Manages a connection to a pool, handles the protocol lifecycle
/// (subscribe, authorize), and emits events for jobs and shares.
///
/// Handles Stratum's interleaved message pattern where notifications can
/// arrive between request/response pairs: while waiting for a response,
/// notifications are processed inline.
pub struct StratumClient {
    /// Pool configuration
    config: ClientConfig,

    /// Where to send events
    event_tx: mpsc::Sender<ClientEvent>,

    /// Where to receive commands (optional)
    command_rx: Option<mpsc::Receiver<ClientCommand>>,

    /// Shutdown signal
    shutdown: CancellationToken,

    /// Auto-incrementing message ID
    next_id: u64,

    /// Protocol state of this connection
    session: Session,
}

impl StratumClient {
    /// Create a new Stratum v1 client.
    pub fn new(
        config: ClientConfig,
        event_tx: mpsc::Sender<ClientEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            event_tx,
            command_rx: None,
            shutdown,
            next_id: 1,
            session: Session::new(),
        }
    }

    /// Create a new Stratum v1 client with command channel.
    pub fn with_commands(
        config: ClientConfig,
        event_tx: mpsc::Sender<ClientEvent>,
        command_rx: mpsc::Receiver<ClientCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            command_rx: Some(command_rx),
            ..Self::new(config, event_tx, shutdown)
        }
    }

    /// Protocol state as seen by this client.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Get next message ID and increment counter.
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn emit(&self, event: ClientEvent) -> StratumResult<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| StratumError::Disconnected)
    }

    /// Send a request and wait for its response.
    ///
    /// Sends the request and then loops reading messages from the connection,
    /// handling notifications along the way, until the response arrives.
    ///
    /// Times out after the configured timeout if no response is received.
    /// Responds immediately to shutdown requests.
    async fn send_request(
        &mut self,
        conn: &mut dyn Transport,
        method: &str,
        params: Value,
    ) -> StratumResult<Message> {
        let id = self.next_id();
        conn.write_message(&Message::request(id, method, params))
            .await?;

        let timeout_dur = self.config.timeout;
        tokio::time::timeout(timeout_dur, async {
            loop {
                tokio::select! {
                    result = conn.read_message() => {
                        let msg = match result {
                            Ok(Some(msg)) => msg,
                            Ok(None) => return Err(StratumError::Disconnected),
                            Err(StratumError::Decode(e)) => {
                                warn!(error = %e, "Ignoring undecodable frame from pool");
                                continue;
                            }
                            Err(e) => return Err(e),
                        };

                        match msg {
                            Message::Response { id: Some(resp_id), .. } if resp_id == id => {
                                return Ok(msg);
                            }
                            Message::Response { id: other_id, .. } => {
                                warn!(msg_id = ?other_id, "Received response for different request");
                            }
                            Message::Request { id: None, method, params, .. } => {
                                if let Err(e) = self.handle_notification(&method, &params).await {
                                    warn!(error = %e, "Error handling notification");
                                }
                            }
                            Message::Request { id: Some(_), method, .. } => {
                                debug!(method = %method, "Ignoring request from pool");
                            }
                        }
                    }

                    _ = self.shutdown.cancelled() => {
                        return Err(StratumError::Disconnected);
                    }
                }
            }
        })
        .await
        .map_err(|_| StratumError::Timeout)?
    }

    /// Subscribe to mining notifications.
    async fn subscribe(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        let params = match &self.config.session_id {
            Some(session_id) => json!([&self.config.username, session_id]),
            None => json!([&self.config.username]),
        };
        let response = self.send_request(conn, method::SUBSCRIBE, params).await?;

        match response {
            Message::Response {
                result: Some(result),
                error: None,
                ..
            } => {
                let sub = parse_subscribe_result(&result)?;
                self.session.mark_subscribed(
                    sub.session_id.clone(),
                    sub.extranonce1.clone(),
                    sub.extranonce2_size,
                );
                debug!(
                    extranonce1 = %sub.extranonce1,
                    extranonce2_size = sub.extranonce2_size,
                    "Subscribed"
                );
                self.emit(ClientEvent::Subscribed {
                    session_id: sub.session_id,
                    extranonce1: sub.extranonce1,
                    extranonce2_size: sub.extranonce2_size,
                })
                .await
            }
            Message::Response {
                error: Some(error), ..
            } => Err(StratumError::SubscriptionFailed(error_reason(&error))),
            _ => Err(StratumError::UnexpectedResponse(
                "Invalid subscribe response".to_string(),
            )),
        }
    }

    /// Authorize with the pool.
    async fn authorize(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        let params = json!([&self.config.username, &self.config.password]);
        let response = self.send_request(conn, method::AUTHORIZE, params).await?;

        match response {
            Message::Response {
                result: Some(result),
                error: None,
                ..
            } => {
                if result.as_bool().unwrap_or(false) {
                    self.session.mark_authorized(self.config.username.clone());
                    self.emit(ClientEvent::Authorized).await
                } else {
                    Err(StratumError::AuthorizationFailed(
                        "Pool returned false".to_string(),
                    ))
                }
            }
            Message::Response {
                error: Some(error), ..
            } => Err(StratumError::AuthorizationFailed(error_reason(&error))),
            _ => Err(StratumError::UnexpectedResponse(
                "Invalid authorize response".to_string(),
            )),
        }
    }

    /// Submit a share to the pool.
    ///
    /// Returns `Ok(false)` without sending anything if the session is not
    /// authorized. Otherwise waits for the verdict and emits ShareAccepted
    /// or ShareRejected.
    async fn submit(&mut self, conn: &mut dyn Transport, params: SubmitParams) -> StratumResult<bool> {
        if !self.session.authorized {
            warn!(job_id = %params.job_id, "Not authorized, share not submitted");
            return Ok(false);
        }

        let job_id = params.job_id.clone();
        let submit_json = params.to_stratum_json(&self.config.username);
        let response = self.send_request(conn, method::SUBMIT, submit_json).await?;

        match response {
            Message::Response {
                result: Some(result),
                error: None,
                ..
            } => {
                let accepted = result.as_bool().unwrap_or(false);
                if accepted {
                    self.emit(ClientEvent::ShareAccepted { job_id }).await?;
                } else {
                    self.emit(ClientEvent::ShareRejected {
                        job_id,
                        reason: "Pool returned false".to_string(),
                    })
                    .await?;
                }
                Ok(accepted)
            }
            Message::Response {
                error: Some(error), ..
            } => {
                self.emit(ClientEvent::ShareRejected {
                    job_id,
                    reason: error_reason(&error),
                })
                .await?;
                Ok(false)
            }
            _ => Err(StratumError::UnexpectedResponse(
                "Invalid submit response".to_string(),
            )),
        }
    }

    /// Handle a notification from the pool.
    async fn handle_notification(&mut self, method: &str, params: &Value) -> StratumResult<()> {
        match method {
            method::NOTIFY => self.handle_mining_notify(params).await,
            method::SET_DIFFICULTY => self.handle_set_difficulty(params).await,
            _ => {
                debug!(method = %method, "Unknown notification method");
                Ok(())
            }
        }
    }

    /// Handle mining.notify notification.
    async fn handle_mining_notify(&mut self, params: &Value) -> StratumResult<()> {
        let arr = params.as_array().ok_or_else(|| {
            StratumError::InvalidMessage("mining.notify params not an array".to_string())
        })?;

        let job = Arc::new(Job::from_notify_params(arr)?);
        debug!(job_id = %job.job_id, clean = job.clean_jobs, "New job");
        self.session.set_job(job.clone());
        self.emit(ClientEvent::NewJob(job)).await
    }

    /// Handle mining.set_difficulty notification.
    async fn handle_set_difficulty(&mut self, params: &Value) -> StratumResult<()> {
        let difficulty = params
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                StratumError::InvalidMessage("set_difficulty needs a numeric param".to_string())
            })?;

        self.session.difficulty = Some(difficulty);
        self.emit(ClientEvent::DifficultyChanged(difficulty)).await
    }

    /// Connect to the pool and run the client.
    ///
    /// Establishes a TCP connection then delegates to
    /// [`run_with_transport`](Self::run_with_transport).
    pub async fn run(self) -> StratumResult<()> {
        let conn = Connection::connect(&self.config.url, self.config.timeout).await?;
        self.run_with_transport(conn).await
    }

    /// Run the client over a pre-established transport.
    ///
    /// Performs the handshake (subscribe, authorize), then enters the main
    /// event loop to handle notifications and submit shares.
    pub(crate) async fn run_with_transport(mut self, mut conn: impl Transport) -> StratumResult<()> {
        self.subscribe(&mut conn).await?;
        self.authorize(&mut conn).await?;
        info!(pool = %self.config.url, worker = %self.config.username, "Authorized");

        loop {
            tokio::select! {
                msg = conn.read_message() => {
                    match msg {
                        Ok(Some(Message::Request { id: None, method, params, .. })) => {
                            if let Err(e) = self.handle_notification(&method, &params).await {
                                if matches!(e, StratumError::Disconnected) {
                                    return Err(e);
                                }
                                warn!(error = %e, "Error handling notification");
                            }
                        }
                        Ok(Some(Message::Response { id, .. })) => {
                            debug!(msg_id = ?id, "Received unexpected response in main loop");
                        }
                        Ok(Some(Message::Request { id: Some(_), method, .. })) => {
                            debug!(method = %method, "Ignoring request from pool");
                        }
                        Ok(None) => {
                            info!("Connection closed by pool");
                            self.event_tx.send(ClientEvent::Disconnected).await.ok();
                            return Err(StratumError::Disconnected);
                        }
                        Err(StratumError::Decode(e)) => {
                            warn!(error = %e, "Ignoring undecodable frame from pool");
                        }
                        Err(e) => return Err(e),
                    }
                }

                Some(cmd) = async {
                    match &mut self.command_rx {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match cmd {
                        ClientCommand::SubmitShare(params) => {
                            debug!(job_id = %params.job_id, nonce = %params.nonce, "Submitting share");
                            if let Err(e) = self.submit(&mut conn, params).await {
                                if matches!(e, StratumError::Disconnected) {
                                    return Err(e);
                                }
                                warn!(error = %e, "Failed to submit share");
                            }
                        }
                    }
                }

                _ = self.shutdown.cancelled() => {
                    self.event_tx.send(ClientEvent::Disconnected).await.ok();
                    return Ok(());
                }
            }
        }
    }
}
