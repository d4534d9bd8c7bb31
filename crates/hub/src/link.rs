//! Device link: one half-duplex request/response channel to the board.
//!
//! [`DeviceLink`] is synchronous and owns the transport. It is driven by a
//! single blocking worker behind [`LinkHandle`], so every caller (sampler,
//! actuator, manual commands) is queued first-come-first-served and no two
//! requests ever interleave on the wire.
//!
//! ## Connection state
//!
//! ```text
//! Disconnected ──[retry due, open + ping ok]──▶ Connected
//!      ▲                                           │
//!      └────────────────[i/o error]────────────────┘
//! ```
//!
//! While disconnected, calls fail fast with `NotConnected` until the next
//! retry is due. A timeout keeps the connection but flags it for resync: the
//! next call first drains whatever late reply is still in flight.

use serde::Serialize;
use std::io;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::protocol::{json_payload, parse_response, Command, Response};

/// Requests that may wait in the mediator queue at once.
const QUEUE_DEPTH: usize = 32;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("device not connected")]
    NotConnected,
    #[error("no response from device within timeout")]
    Timeout,
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("link i/o error: {0}")]
    Io(String),
    #[error("device rejected command: {0}")]
    Rejected(String),
}

impl LinkError {
    /// The request may have reached the board even though no usable answer
    /// came back.
    pub fn outcome_unknown(&self) -> bool {
        matches!(
            self,
            LinkError::Timeout | LinkError::Io(_) | LinkError::MalformedResponse(_)
        )
    }
}

impl From<io::Error> for LinkError {
    fn from(e: io::Error) -> Self {
        LinkError::Io(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// A byte stream carrying newline-terminated lines.
pub trait Transport: Send {
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Next complete line, or `Ok(None)` once `deadline` passes.
    fn read_line(&mut self, deadline: Instant) -> io::Result<Option<String>>;

    /// Drop anything received but not yet consumed.
    fn discard_input(&mut self) -> io::Result<()>;
}

/// Opens transports to the board; called on every (re)connect.
pub trait Connector: Send {
    type Transport: Transport;

    fn connect(&mut self) -> io::Result<Self::Transport>;

    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkHealth {
    #[default]
    Ok,
    /// Reconnect attempts exceeded the configured ceiling. Retries continue.
    Degraded,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkStatus {
    pub device: String,
    pub connected: bool,
    pub health: LinkHealth,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    pub response_timeout: Duration,
    pub resync_grace: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(2),
            resync_grace: Duration::from_millis(250),
            reconnect_interval: Duration::from_secs(10),
            max_reconnect_attempts: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// DeviceLink
// ---------------------------------------------------------------------------

pub struct DeviceLink<C: Connector> {
    connector: C,
    settings: LinkSettings,
    transport: Option<C::Transport>,
    needs_resync: bool,
    /// Earliest time of the next connect attempt; `None` means now.
    retry_at: Option<Instant>,
    failures: u32,
    last_error: Option<String>,
}

impl<C: Connector> DeviceLink<C> {
    pub fn new(connector: C, settings: LinkSettings) -> Self {
        Self {
            connector,
            settings,
            transport: None,
            needs_resync: false,
            retry_at: None,
            failures: 0,
            last_error: None,
        }
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            device: self.connector.describe(),
            connected: self.transport.is_some(),
            health: self.health(),
            consecutive_failures: self.failures,
            last_error: self.last_error.clone(),
        }
    }

    pub fn health(&self) -> LinkHealth {
        if self.failures > self.settings.max_reconnect_attempts {
            LinkHealth::Degraded
        } else {
            LinkHealth::Ok
        }
    }

    pub fn send(&mut self, command: &Command) -> Result<Response, LinkError> {
        self.send_at(command, Instant::now())
    }

    /// Same as [`send`](Self::send) with an explicit clock for the retry
    /// schedule.
    pub fn send_at(&mut self, command: &Command, now: Instant) -> Result<Response, LinkError> {
        self.ensure_connected(now)?;
        let Some(transport) = self.transport.as_mut() else {
            return Err(LinkError::NotConnected);
        };

        if self.needs_resync {
            if let Err(e) = drain(transport, self.settings.resync_grace) {
                return Err(self.disconnect(now, e.into()));
            }
            self.needs_resync = false;
        }

        match exchange(transport, command, self.settings.response_timeout) {
            Ok(response) => Ok(response),
            Err(LinkError::Timeout) => {
                warn!(command = command.name(), "link: timed out waiting for reply");
                self.needs_resync = true;
                self.last_error = Some(LinkError::Timeout.to_string());
                Err(LinkError::Timeout)
            }
            Err(e @ LinkError::Io(_)) => Err(self.disconnect(now, e)),
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn ensure_connected(&mut self, now: Instant) -> Result<(), LinkError> {
        if self.transport.is_some() {
            return Ok(());
        }
        if matches!(self.retry_at, Some(at) if now < at) {
            return Err(LinkError::NotConnected);
        }

        match self.open() {
            Ok(transport) => {
                if self.failures > 0 {
                    info!(
                        device = %self.connector.describe(),
                        after_failures = self.failures,
                        "link: reconnected"
                    );
                } else {
                    info!(device = %self.connector.describe(), "link: connected");
                }
                self.transport = Some(transport);
                self.needs_resync = false;
                self.failures = 0;
                self.retry_at = None;
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                self.retry_at = Some(now + self.settings.reconnect_interval);
                self.last_error = Some(e.to_string());
                if self.failures == self.settings.max_reconnect_attempts + 1 {
                    error!(
                        device = %self.connector.describe(),
                        attempts = self.failures,
                        "link: reconnect ceiling exceeded, health degraded"
                    );
                } else {
                    warn!(
                        device = %self.connector.describe(),
                        attempt = self.failures,
                        "link: connect failed: {e}"
                    );
                }
                Err(LinkError::NotConnected)
            }
        }
    }

    /// Open a transport and confirm the board answers a ping.
    fn open(&mut self) -> Result<C::Transport, LinkError> {
        let mut transport = self.connector.connect()?;
        let reply = exchange(&mut transport, &Command::Ping, self.settings.response_timeout)?;
        if !reply.status_ok() {
            return Err(LinkError::MalformedResponse(format!(
                "unexpected ping reply status {:?}",
                reply.status
            )));
        }
        debug!(board = ?reply.board, "link: ping ok");
        Ok(transport)
    }

    fn disconnect(&mut self, now: Instant, cause: LinkError) -> LinkError {
        error!(device = %self.connector.describe(), "link: dropped: {cause}");
        self.transport = None;
        self.needs_resync = false;
        self.retry_at = Some(now + self.settings.reconnect_interval);
        self.last_error = Some(cause.to_string());
        cause
    }
}

/// One request/response round trip. Stray lines (no JSON, or JSON that is not
/// an answer to `command`) are skipped until the deadline.
fn exchange<T: Transport>(
    transport: &mut T,
    command: &Command,
    timeout: Duration,
) -> Result<Response, LinkError> {
    let request = command
        .to_line()
        .map_err(|e| LinkError::MalformedResponse(format!("cannot encode {}: {e}", command.name())))?;
    transport.discard_input()?;
    transport.write_line(&request)?;

    let deadline = Instant::now() + timeout;
    loop {
        let Some(line) = transport.read_line(deadline)? else {
            return Err(LinkError::Timeout);
        };
        let Some(payload) = json_payload(&line) else {
            debug!(%line, "link: skipping non-json line");
            continue;
        };
        let response = parse_response(payload).map_err(LinkError::MalformedResponse)?;
        if !response.answers(command) {
            debug!(command = command.name(), %payload, "link: skipping unrelated reply");
            continue;
        }
        if let Some(err) = response.error {
            return Err(LinkError::Rejected(err));
        }
        return Ok(response);
    }
}

/// Swallow anything arriving within `grace`, then clear the input buffer.
fn drain<T: Transport>(transport: &mut T, grace: Duration) -> io::Result<()> {
    let deadline = Instant::now() + grace;
    while let Some(line) = transport.read_line(deadline)? {
        debug!(%line, "link: discarded late reply");
    }
    transport.discard_input()
}

// ---------------------------------------------------------------------------
// Mediator
// ---------------------------------------------------------------------------

struct LinkRequest {
    command: Command,
    reply: oneshot::Sender<Result<Response, LinkError>>,
}

/// Cloneable async front for a [`DeviceLink`] running on a blocking worker.
#[derive(Clone)]
pub struct LinkHandle {
    tx: mpsc::Sender<LinkRequest>,
    status: watch::Receiver<LinkStatus>,
    queue_timeout: Duration,
}

impl LinkHandle {
    /// Move `link` onto a dedicated blocking worker. Must be called within a
    /// tokio runtime.
    pub fn spawn<C>(mut link: DeviceLink<C>, queue_timeout: Duration) -> Self
    where
        C: Connector + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<LinkRequest>(QUEUE_DEPTH);
        let (status_tx, status_rx) = watch::channel(link.status());

        tokio::task::spawn_blocking(move || {
            while let Some(req) = rx.blocking_recv() {
                // Caller gave up while queued; never send a command nobody
                // is waiting for.
                if req.reply.is_closed() {
                    debug!(command = req.command.name(), "link: dropping abandoned request");
                    continue;
                }
                let result = link.send(&req.command);
                status_tx.send_if_modified(|current| {
                    let next = link.status();
                    if *current == next {
                        false
                    } else {
                        *current = next;
                        true
                    }
                });
                let _ = req.reply.send(result);
            }
            debug!("link: worker stopped");
        });

        Self {
            tx,
            status: status_rx,
            queue_timeout,
        }
    }

    pub async fn send(&self, command: Command) -> Result<Response, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LinkRequest { command, reply })
            .await
            .map_err(|_| LinkError::NotConnected)?;

        match tokio::time::timeout(self.queue_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::NotConnected),
            Err(_) => Err(LinkError::Timeout),
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
