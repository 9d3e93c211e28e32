// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The structured (JSON) protocol variant.
//!
//! Every request carries a freshly generated correlation id and the
//! response is matched back by that id. Anything else the peer sends while
//! a command is outstanding is an out-of-band notification and lands in the
//! event buffer, where it stays until a caller drains it.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use apiary_api_types::{ControlAddress, RemoteErrorPayload};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use slog::{debug, trace, Logger};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::codec::StructuredCodec;
use crate::conn::{self, Conn};
use crate::{Memoized, MonitorError, MonitorTimeouts};

/// How often `wait_event` polls the event buffer and, when the command
/// channel is idle, pumps the socket for pending notifications.
const EVENT_POLL: Duration = Duration::from_millis(20);

type Transport = Framed<Conn, StructuredCodec>;

pub struct StructuredMonitor {
    io: Mutex<Option<Transport>>,
    events: StdMutex<Vec<Value>>,
    dead: AtomicBool,
    timeouts: MonitorTimeouts,
    log: Logger,
    pub(crate) memo: Memoized,
    greeting: Value,
}

impl StructuredMonitor {
    /// Dials the channel, consumes the greeting, and negotiates command
    /// mode. The connection is unusable until all three steps succeed.
    pub(crate) async fn connect(
        address: &ControlAddress,
        timeouts: MonitorTimeouts,
        log: Logger,
    ) -> Result<Self, MonitorError> {
        let stream = conn::dial(address, timeouts.connect).await?;
        let mut framed = Framed::new(stream, StructuredCodec);

        let greeting = tokio::time::timeout(timeouts.command, framed.next())
            .await
            .map_err(|_| {
                MonitorError::Protocol(
                    "no greeting within the command budget".to_owned(),
                )
            })?
            .ok_or_else(|| {
                MonitorError::Protocol(
                    "connection closed before the greeting".to_owned(),
                )
            })??;

        if greeting.get("QMP").is_none() {
            return Err(MonitorError::Protocol(format!(
                "unexpected greeting: {greeting}"
            )));
        }

        // Until capability negotiation completes the peer rejects every
        // other command.
        let mut pending = Vec::new();
        roundtrip(
            &mut framed,
            &mut pending,
            "qmp_capabilities",
            None,
            timeouts.command,
        )
        .await?;

        debug!(log, "structured monitor handshake complete");
        Ok(StructuredMonitor {
            io: Mutex::new(Some(framed)),
            events: StdMutex::new(pending),
            dead: AtomicBool::new(false),
            timeouts,
            log,
            memo: Memoized::default(),
            greeting,
        })
    }

    /// The greeting payload the monitor sent on connect, kept for
    /// diagnostics (it names the hypervisor version).
    pub fn greeting(&self) -> &Value {
        &self.greeting
    }

    pub(crate) async fn execute(
        &self,
        command: &str,
        args: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, MonitorError> {
        if self.dead.load(Ordering::Acquire) {
            return Err(MonitorError::Closed);
        }

        let timeout = timeout.unwrap_or(self.timeouts.command);
        let mut guard =
            tokio::time::timeout(self.timeouts.lock, self.io.lock())
                .await
                .map_err(|_| MonitorError::LockTimeout)?;
        let Some(framed) = guard.as_mut() else {
            return Err(MonitorError::Closed);
        };

        trace!(self.log, "executing structured command"; "command" => command);
        let mut pending = Vec::new();
        let result =
            roundtrip(framed, &mut pending, command, args, timeout).await;

        // Notifications observed while hunting for the response are kept
        // even when the command itself failed.
        if !pending.is_empty() {
            self.events.lock().unwrap().extend(pending);
        }

        if matches!(result, Err(MonitorError::Socket(_))) {
            self.dead.store(true, Ordering::Release);
            *guard = None;
        }

        result
    }

    pub(crate) async fn close(&self) {
        self.dead.store(true, Ordering::Release);
        let mut guard = self.io.lock().await;
        // Dropping the transport closes the socket; repeated calls find
        // nothing to do.
        *guard = None;
    }

    pub(crate) fn events(&self, clear: bool) -> Vec<Value> {
        let mut events = self.events.lock().unwrap();
        if clear {
            std::mem::take(&mut *events)
        } else {
            events.clone()
        }
    }

    pub(crate) fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub(crate) fn clear_events_named(&self, name: &str) {
        self.events
            .lock()
            .unwrap()
            .retain(|e| e.get("event").and_then(Value::as_str) != Some(name));
    }

    pub(crate) async fn wait_event(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Value, MonitorError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.take_named(name) {
                return Ok(event);
            }

            if Instant::now() >= deadline {
                return Err(MonitorError::EventTimeout {
                    name: name.to_owned(),
                    timeout,
                });
            }

            // If the command channel is idle, pump the socket so events
            // arrive even with no command in flight; if it is busy, the
            // in-flight command stashes them for us.
            match tokio::time::timeout(EVENT_POLL, self.io.lock()).await {
                Ok(mut guard) => {
                    if let Some(framed) = guard.as_mut() {
                        match tokio::time::timeout(EVENT_POLL, framed.next())
                            .await
                        {
                            Ok(Some(Ok(msg))) => {
                                if msg.is_object() {
                                    self.events.lock().unwrap().push(msg);
                                }
                            }
                            Ok(Some(Err(_))) | Ok(None) => {
                                self.dead.store(true, Ordering::Release);
                                *guard = None;
                            }
                            Err(_) => {}
                        }
                    } else {
                        tokio::time::sleep(EVENT_POLL).await;
                    }
                }
                Err(_) => tokio::time::sleep(EVENT_POLL).await,
            }
        }
    }

    fn take_named(&self, name: &str) -> Option<Value> {
        let mut events = self.events.lock().unwrap();
        let idx = events.iter().position(|e| {
            e.get("event").and_then(Value::as_str) == Some(name)
        })?;
        Some(events.remove(idx))
    }

    pub(crate) async fn fetch_commands(
        &self,
    ) -> Result<HashSet<String>, MonitorError> {
        let ret = self.execute("query-commands", None, None).await?;
        let commands = ret
            .as_array()
            .ok_or_else(|| {
                MonitorError::Protocol(
                    "query-commands did not return a list".to_owned(),
                )
            })?
            .iter()
            .filter_map(|c| c.get("name").and_then(Value::as_str))
            .map(str::to_owned)
            .collect();
        Ok(commands)
    }

    pub(crate) async fn fetch_capability_names(
        &self,
    ) -> Result<HashSet<String>, MonitorError> {
        let ret =
            self.execute("query-migrate-capabilities", None, None).await?;
        let names = ret
            .as_array()
            .map(|caps| {
                caps.iter()
                    .filter_map(|c| {
                        c.get("capability").and_then(Value::as_str)
                    })
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    pub(crate) async fn fetch_parameter_names(
        &self,
    ) -> Result<HashSet<String>, MonitorError> {
        let ret =
            self.execute("query-migrate-parameters", None, None).await?;
        let names = ret
            .as_object()
            .map(|params| params.keys().cloned().collect())
            .unwrap_or_default();
        Ok(names)
    }
}

/// Sends one request and reads frames until the matching response appears.
/// Non-matching frames are pushed onto `pending`; frames that are not JSON
/// objects are skipped outright.
async fn roundtrip(
    framed: &mut Transport,
    pending: &mut Vec<Value>,
    command: &str,
    args: Option<Value>,
    timeout: Duration,
) -> Result<Value, MonitorError> {
    let id = Uuid::new_v4().to_string();
    let mut request = json!({ "execute": command, "id": id });
    let sent_args = args.clone().unwrap_or(Value::Null);
    if let Some(args) = args {
        request["arguments"] = args;
    }

    let exchange = async {
        framed.send(request).await?;
        loop {
            let msg = match framed.next().await {
                None => {
                    return Err(MonitorError::Socket(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "monitor closed the connection mid-command",
                    )))
                }
                Some(Err(e)) => return Err(e),
                Some(Ok(msg)) => msg,
            };

            if msg.get("id").and_then(Value::as_str) == Some(id.as_str()) {
                if let Some(error) = msg.get("error") {
                    let payload = serde_json::from_value(error.clone())
                        .unwrap_or_else(|_| RemoteErrorPayload {
                            class: "GenericError".to_owned(),
                            desc: error.to_string(),
                        });
                    return Err(MonitorError::Command {
                        command: command.to_owned(),
                        args: sent_args.clone(),
                        payload,
                    });
                }
                if let Some(ret) = msg.get("return") {
                    return Ok(ret.clone());
                }
                return Err(MonitorError::Protocol(format!(
                    "response to {command} carried neither return nor error"
                )));
            }

            if msg.is_object() {
                pending.push(msg);
            }
        }
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(MonitorError::CommandTimeout {
            command: command.to_owned(),
            timeout,
        }),
    }
}
