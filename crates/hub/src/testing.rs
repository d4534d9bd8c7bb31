//! In-process fake board for tests. Speaks the same line protocol as the
//! firmware, with scripted faults.

use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::link::{Connector, DeviceLink, LinkHandle, LinkSettings, Transport};
use crate::protocol::Relay;

#[derive(Debug, Clone)]
pub(crate) enum Fault {
    /// Swallow the request; no reply.
    Timeout,
    /// Withhold the reply until the next request is written.
    Late,
    /// Reply arrives with bytes glued in front of it.
    Prefix(String),
    /// A non-JSON line precedes the reply.
    StrayLine(String),
    /// Send this line instead of the real reply.
    Replace(String),
    /// The write fails as if the cable was pulled.
    Drop,
}

struct BoardState {
    temperature: Option<f64>,
    humidity: Option<f64>,
    soil: [Option<f64>; 4],
    relays: BTreeMap<Relay, bool>,
    received: Vec<String>,
    faults: VecDeque<(Option<&'static str>, Fault)>,
    refuse: u32,
    connects: u32,
}

/// Shared handle; clones see the same board.
#[derive(Clone)]
pub(crate) struct FakeBoard {
    inner: Arc<Mutex<BoardState>>,
}

impl FakeBoard {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BoardState {
                temperature: Some(21.0),
                humidity: Some(55.0),
                soil: [Some(40.0), Some(42.0), Some(38.0), Some(45.0)],
                relays: Relay::ALL.iter().map(|&r| (r, false)).collect(),
                received: Vec::new(),
                faults: VecDeque::new(),
                refuse: 0,
                connects: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn set_climate(&self, temperature: Option<f64>, humidity: Option<f64>) {
        let mut st = self.lock();
        st.temperature = temperature;
        st.humidity = humidity;
    }

    pub(crate) fn set_relay(&self, relay: Relay, on: bool) {
        self.lock().relays.insert(relay, on);
    }

    pub(crate) fn relay(&self, relay: Relay) -> bool {
        self.lock().relays[&relay]
    }

    /// Apply `fault` to the next request of any kind.
    pub(crate) fn inject(&self, fault: Fault) {
        self.lock().faults.push_back((None, fault));
    }

    /// Apply `fault` to the next request named `command`.
    pub(crate) fn inject_on(&self, command: &'static str, fault: Fault) {
        self.lock().faults.push_back((Some(command), fault));
    }

    pub(crate) fn refuse_connections(&self, n: u32) {
        self.lock().refuse = n;
    }

    pub(crate) fn connects(&self) -> u32 {
        self.lock().connects
    }

    /// Command names received, in order.
    pub(crate) fn received(&self) -> Vec<String> {
        self.lock().received.clone()
    }

    /// `set_relay` requests received as `(relay, state)`.
    pub(crate) fn relay_writes(&self) -> Vec<(String, bool)> {
        self.lock()
            .received
            .iter()
            .filter_map(|c| {
                let rest = c.strip_prefix("set_relay:")?;
                let (name, state) = rest.split_once('=')?;
                Some((name.to_string(), state == "true"))
            })
            .collect()
    }

    pub(crate) fn connector(&self) -> FakeConnector {
        FakeConnector {
            board: self.clone(),
        }
    }

    /// A running mediator over this board with short timeouts and immediate
    /// reconnects.
    pub(crate) fn link(&self) -> LinkHandle {
        let settings = LinkSettings {
            response_timeout: Duration::from_millis(50),
            resync_grace: Duration::from_millis(0),
            reconnect_interval: Duration::from_millis(0),
            max_reconnect_attempts: 3,
        };
        LinkHandle::spawn(
            DeviceLink::new(self.connector(), settings),
            Duration::from_secs(5),
        )
    }

    /// Process one request line, returning the fault (if any) and the reply.
    fn handle(&self, line: &str) -> (Option<Fault>, String) {
        let mut st = self.lock();
        let req: Value = serde_json::from_str(line).unwrap_or(Value::Null);
        let command = req["command"].as_str().unwrap_or("").to_string();

        let label = match command.as_str() {
            "set_relay" => format!(
                "set_relay:{}={}",
                req["relay"].as_str().unwrap_or(""),
                req["state"].as_bool().unwrap_or(false)
            ),
            other => other.to_string(),
        };
        st.received.push(label);

        let fault_idx = st
            .faults
            .iter()
            .position(|(filter, _)| filter.map_or(true, |f| f == command));
        let fault = fault_idx.and_then(|i| st.faults.remove(i)).map(|(_, f)| f);

        let relays: BTreeMap<&str, bool> =
            st.relays.iter().map(|(r, on)| (r.as_str(), *on)).collect();

        let reply = match command.as_str() {
            "read_all" => json!({
                "temperature": st.temperature,
                "humidity": st.humidity,
                "soil_moisture": {
                    "soil1": st.soil[0], "soil2": st.soil[1],
                    "soil3": st.soil[2], "soil4": st.soil[3],
                },
                "relays": relays,
                "status": "ok",
            }),
            "set_relay" => {
                let name = req["relay"].as_str().unwrap_or("");
                let state = req["state"].as_bool().unwrap_or(false);
                let success = match name.parse::<Relay>() {
                    Ok(relay) if !matches!(fault, Some(Fault::Timeout | Fault::Drop)) => {
                        st.relays.insert(relay, state);
                        true
                    }
                    _ => false,
                };
                json!({"command": "set_relay", "relay": name, "state": state, "success": success})
            }
            "get_relays" => json!({"relays": relays, "status": "ok"}),
            "ping" => json!({"status": "ok", "board": "fake_board"}),
            _ => json!({"error": "unknown_command"}),
        };
        (fault, reply.to_string())
    }
}

// ---------------------------------------------------------------------------
// Transport + connector
// ---------------------------------------------------------------------------

pub(crate) struct FakeTransport {
    board: FakeBoard,
    inbox: VecDeque<String>,
    late: Option<String>,
}

impl Transport for FakeTransport {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        if let Some(late) = self.late.take() {
            self.inbox.push_back(late);
        }
        let (fault, reply) = self.board.handle(line);
        match fault {
            None => self.inbox.push_back(reply),
            Some(Fault::Timeout) => {}
            Some(Fault::Late) => self.late = Some(reply),
            Some(Fault::Prefix(p)) => self.inbox.push_back(format!("{p}{reply}")),
            Some(Fault::StrayLine(s)) => {
                self.inbox.push_back(s);
                self.inbox.push_back(reply);
            }
            Some(Fault::Replace(r)) => self.inbox.push_back(r),
            Some(Fault::Drop) => {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "fake board unplugged"))
            }
        }
        Ok(())
    }

    fn read_line(&mut self, _deadline: Instant) -> io::Result<Option<String>> {
        Ok(self.inbox.pop_front())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.inbox.clear();
        Ok(())
    }
}

pub(crate) struct FakeConnector {
    board: FakeBoard,
}

impl Connector for FakeConnector {
    type Transport = FakeTransport;

    fn connect(&mut self) -> io::Result<FakeTransport> {
        let mut st = self.board.lock();
        if st.refuse > 0 {
            st.refuse -= 1;
            return Err(io::Error::new(io::ErrorKind::NotFound, "no fake board present"));
        }
        st.connects += 1;
        Ok(FakeTransport {
            board: self.board.clone(),
            inbox: VecDeque::new(),
            late: None,
        })
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}
