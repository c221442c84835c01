//! TCP accept loop and the per-connection query path.
//!
//! Each client connection gets its own upstream connection and its own
//! task. The query path is strictly sequential per connection (simple
//! query protocol): classify, record, evaluate, consult chaos, forward,
//! relay the response.

use crate::config::ProxyConfig;
use crate::run::RunHandle;
use crate::wire::{self, Frame, StartupMessage};
use chaostrace_chaos::InjectedFault;
use chaostrace_core::{new_id, ConnectionId, ParsedStatement, ProxyError, StatementId};
use chaostrace_events::RunEventPayload;
use chaostrace_sql::classify;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

pub struct ProxyServer {
    handle: Arc<RunHandle>,
    config: ProxyConfig,
}

impl ProxyServer {
    pub fn new(handle: Arc<RunHandle>, config: ProxyConfig) -> Self {
        Self { handle, config }
    }

    /// Accept connections until the run is cancelled.
    pub async fn serve(&self, listener: TcpListener) {
        let mut cancelled = self.handle.cancelled();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (client, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(peer = %peer, "client connected");
                    let handle = self.handle.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        serve_connection(handle, config, client).await;
                    });
                }
                _ = cancelled.changed() => {
                    if self.handle.is_cancelled() {
                        return;
                    }
                }
            }
        }
    }
}

async fn serve_connection(handle: Arc<RunHandle>, config: ProxyConfig, client: TcpStream) {
    let connection_id = new_id();
    if handle
        .bus
        .append(RunEventPayload::ConnectionOpened { connection_id })
        .is_err()
    {
        return;
    }

    let error = match Connection::open(handle.clone(), config, client, connection_id).await {
        Ok(mut conn) => conn.pump().await.err().map(|err| err.to_string()),
        Err(err) => Some(err.to_string()),
    };
    if let Some(reason) = &error {
        tracing::debug!(connection_id = %connection_id, reason, "connection closed");
    }
    let _ = handle.bus.append(RunEventPayload::ConnectionClosed {
        connection_id,
        error,
    });
}

struct Connection {
    handle: Arc<RunHandle>,
    config: ProxyConfig,
    connection_id: ConnectionId,
    client: BufStream<TcpStream>,
    upstream: BufStream<TcpStream>,
}

fn io_error(peer: &str, err: std::io::Error) -> ProxyError {
    ProxyError::Io {
        peer: peer.to_string(),
        reason: err.to_string(),
    }
}

impl Connection {
    /// Connect upstream and relay the startup handshake. Auth exchanges
    /// are relayed both ways until the first ReadyForQuery.
    async fn open(
        handle: Arc<RunHandle>,
        config: ProxyConfig,
        client: TcpStream,
        connection_id: ConnectionId,
    ) -> Result<Self, ProxyError> {
        let mut client = BufStream::new(client);

        let startup = loop {
            match wire::read_startup(&mut client)
                .await
                .map_err(|e| io_error("client", e))?
            {
                StartupMessage::SslRequest => {
                    client
                        .write_all(b"N")
                        .await
                        .map_err(|e| io_error("client", e))?;
                    client.flush().await.map_err(|e| io_error("client", e))?;
                }
                StartupMessage::Startup(raw) => break raw,
            }
        };

        let upstream = TcpStream::connect(&config.upstream_addr)
            .await
            .map_err(|err| {
                let report = ProxyError::DatabaseUnavailable {
                    reason: err.to_string(),
                };
                tracing::warn!(error = %report, "upstream connect failed");
                report
            })?;
        let mut upstream = BufStream::new(upstream);

        upstream
            .write_all(&startup)
            .await
            .map_err(|e| io_error("upstream", e))?;
        upstream.flush().await.map_err(|e| io_error("upstream", e))?;

        // Auth phase: server messages flow to the client; any
        // authentication request that needs a client answer gets one
        // frame relayed back.
        loop {
            let frame = wire::read_frame(&mut upstream)
                .await
                .map_err(|e| io_error("upstream", e))?
                .ok_or(ProxyError::DatabaseUnavailable {
                    reason: "upstream closed during startup".to_string(),
                })?;
            wire::write_frame(&mut client, &frame)
                .await
                .map_err(|e| io_error("client", e))?;
            if frame.is_ready_for_query() {
                break;
            }
            if frame.tag == b'R' && frame.payload != [0, 0, 0, 0] {
                let answer = wire::read_frame(&mut client)
                    .await
                    .map_err(|e| io_error("client", e))?
                    .ok_or(ProxyError::Io {
                        peer: "client".to_string(),
                        reason: "closed during auth".to_string(),
                    })?;
                wire::write_frame(&mut upstream, &answer)
                    .await
                    .map_err(|e| io_error("upstream", e))?;
            }
        }

        Ok(Self {
            handle,
            config,
            connection_id,
            client,
            upstream,
        })
    }

    /// Main command loop: one Query frame at a time until the client
    /// terminates, the run is cancelled, or chaos drops the connection.
    async fn pump(&mut self) -> Result<(), ProxyError> {
        let mut cancelled = self.handle.cancelled();
        loop {
            let frame = tokio::select! {
                frame = wire::read_frame(&mut self.client) => {
                    frame.map_err(|e| io_error("client", e))?
                }
                _ = cancelled.changed() => {
                    if self.handle.is_cancelled() {
                        return Err(ProxyError::Cancelled);
                    }
                    continue;
                }
            };
            let Some(frame) = frame else {
                return Ok(());
            };
            if frame.is_terminate() {
                return Ok(());
            }
            if frame.tag != b'Q' {
                // Extended-protocol and copy frames pass through.
                self.relay_upstream(&frame).await?;
                continue;
            }
            self.process_query(&frame).await?;
        }
    }

    async fn relay_upstream(&mut self, frame: &Frame) -> Result<(), ProxyError> {
        wire::write_frame(&mut self.upstream, frame)
            .await
            .map_err(|e| io_error("upstream", e))?;
        // Responses only arrive after a Sync in the extended protocol.
        if frame.tag != b'S' {
            return Ok(());
        }
        loop {
            let frame = wire::read_frame(&mut self.upstream)
                .await
                .map_err(|e| io_error("upstream", e))?
                .ok_or(ProxyError::DatabaseUnavailable {
                    reason: "upstream closed mid-response".to_string(),
                })?;
            wire::write_frame(&mut self.client, &frame)
                .await
                .map_err(|e| io_error("client", e))?;
            if frame.is_ready_for_query() {
                break;
            }
        }
        Ok(())
    }

    async fn process_query(&mut self, frame: &Frame) -> Result<(), ProxyError> {
        let sql = match wire::query_text(frame) {
            Ok(text) => text,
            Err(err) => {
                return Err(ProxyError::MalformedFrame {
                    reason: err.to_string(),
                })
            }
        };
        let statement_id = new_id();

        // The gate keeps this statement's receipt and decision adjacent
        // on the bus. Dropped before any wait or forward.
        let (statement, decision) = {
            let _gate = self.handle.gate().await;
            let statement = classify(&sql);
            self.handle
                .bus
                .append(RunEventPayload::SqlReceived {
                    statement_id,
                    connection_id: self.connection_id,
                    risk: statement.risk_level(),
                    statement: statement.clone(),
                })
                .map_err(|_| ProxyError::Cancelled)?;
            let decision = self
                .handle
                .policy
                .evaluate(statement_id, &statement, &self.handle.ctx);
            self.handle
                .bus
                .append(RunEventPayload::PolicyDecision {
                    decision: decision.clone(),
                })
                .map_err(|_| ProxyError::Cancelled)?;
            (statement, decision)
        };

        if decision.verdict.is_block() {
            return self
                .reject(
                    statement_id,
                    wire::SQLSTATE_POLICY_BLOCKED,
                    &decision.reason,
                )
                .await;
        }

        let now = Instant::now();
        if self.handle.active.partitioned(now) {
            tracing::info!(connection_id = %self.connection_id, "partition drops connection");
            return Err(ProxyError::DatabaseUnavailable {
                reason: "network partition".to_string(),
            });
        }

        if let Some(fault) = self.handle.active.fault_for(&statement, now) {
            return self.inject_fault(statement_id, fault).await;
        }

        if let Err(table) = self
            .handle
            .active
            .wait_until_unlocked(&statement, self.config.lock_wait)
            .await
        {
            let message = format!("could not obtain lock on relation \"{}\"", table);
            let timeout = ProxyError::LockTimeout {
                statement_id,
                table,
            };
            tracing::info!(error = %timeout, "lock wait gave up");
            return self
                .reject(statement_id, wire::SQLSTATE_LOCK_NOT_AVAILABLE, &message)
                .await;
        }

        let latency = self.handle.active.current_latency(&statement, Instant::now());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.forward(statement_id, &statement, latency.as_millis() as u64)
            .await
    }

    /// Forward (possibly rewritten) and relay the response, recording
    /// SqlForwarded and SqlResult.
    async fn forward(
        &mut self,
        statement_id: StatementId,
        statement: &ParsedStatement,
        delayed_ms: u64,
    ) -> Result<(), ProxyError> {
        let text = self.handle.active.rewrite(statement);
        let rewritten = text != statement.raw_text;
        let frame = wire::query(&text);

        wire::write_frame(&mut self.upstream, &frame)
            .await
            .map_err(|e| io_error("upstream", e))?;
        let _ = self.handle.bus.append(RunEventPayload::SqlForwarded {
            statement_id,
            rewritten,
            delayed_ms,
        });

        let mut ok = true;
        let mut error = None;
        loop {
            let frame = wire::read_frame(&mut self.upstream)
                .await
                .map_err(|e| io_error("upstream", e))?
                .ok_or(ProxyError::DatabaseUnavailable {
                    reason: "upstream closed mid-response".to_string(),
                })?;
            if frame.is_error() {
                ok = false;
                if error.is_none() {
                    error = wire::error_message(&frame);
                }
            }
            wire::write_frame(&mut self.client, &frame)
                .await
                .map_err(|e| io_error("client", e))?;
            if frame.is_ready_for_query() {
                break;
            }
        }

        let _ = self.handle.bus.append(RunEventPayload::SqlResult {
            statement_id,
            ok,
            error,
        });
        Ok(())
    }

    /// Synthesize an error for the client without touching upstream.
    async fn reject(
        &mut self,
        statement_id: StatementId,
        sqlstate: &str,
        message: &str,
    ) -> Result<(), ProxyError> {
        wire::write_frame(&mut self.client, &wire::error_response(sqlstate, message))
            .await
            .map_err(|e| io_error("client", e))?;
        wire::write_frame(&mut self.client, &wire::ready_for_query())
            .await
            .map_err(|e| io_error("client", e))?;
        let _ = self.handle.bus.append(RunEventPayload::SqlResult {
            statement_id,
            ok: false,
            error: Some(message.to_string()),
        });
        Ok(())
    }

    async fn inject_fault(
        &mut self,
        statement_id: StatementId,
        fault: InjectedFault,
    ) -> Result<(), ProxyError> {
        let (sqlstate, message) = match &fault {
            InjectedFault::Timeout => (
                wire::SQLSTATE_QUERY_CANCELED,
                "canceling statement due to statement timeout".to_string(),
            ),
            InjectedFault::CredentialsRevoked => (
                wire::SQLSTATE_INVALID_PASSWORD,
                "password authentication failed".to_string(),
            ),
            InjectedFault::DiskFull => (
                wire::SQLSTATE_DISK_FULL,
                "could not extend file: No space left on device".to_string(),
            ),
            InjectedFault::MemoryPressure => {
                (wire::SQLSTATE_OUT_OF_MEMORY, "out of memory".to_string())
            }
            InjectedFault::PacketLoss => (
                wire::SQLSTATE_CONNECTION_FAILURE,
                "connection reset by peer".to_string(),
            ),
            InjectedFault::TypeChanged {
                column, new_type, ..
            } => (
                wire::SQLSTATE_DATATYPE_MISMATCH,
                format!("column \"{}\" is of type {}", column, new_type),
            ),
        };
        tracing::info!(fault = ?fault, "injected fault");
        self.reject(statement_id, sqlstate, &message).await
    }
}
