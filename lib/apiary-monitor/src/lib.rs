// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the control channel of a running instance's hypervisor
//! process.
//!
//! A [`Monitor`] owns one socket to one instance's control channel and
//! serializes commands over it. Two protocol variants exist behind the same
//! contract: the human variant exchanges prompt-delimited text, the
//! structured variant exchanges newline-delimited JSON with correlation ids
//! and an out-of-band event stream. The variant is fixed when the
//! connection is established and callers select it per channel, not at
//! runtime.
//!
//! A connection is either fully usable (socket open, greeting and handshake
//! complete) or dead. I/O failures mid-command kill the connection; callers
//! that want to recover open a fresh one.

use std::collections::HashSet;
use std::io;
use std::time::Duration;

use apiary_api_types::{ChannelKind, ControlChannel, RemoteErrorPayload};
use serde_json::Value;
use slog::Logger;
use thiserror::Error;
use tokio::sync::OnceCell;

pub mod caps;
mod codec;
mod commands;
mod conn;
mod human;
mod structured;

pub use conn::MonitorConn;
pub use human::HumanMonitor;
pub use structured::StructuredMonitor;

/// Per-connection time budgets.
#[derive(Clone, Copy, Debug)]
pub struct MonitorTimeouts {
    /// Budget for dialing the control socket.
    pub connect: Duration,
    /// Default budget for a command round trip; `execute` callers may
    /// override it per command.
    pub command: Duration,
    /// Budget for acquiring the per-connection command lock.
    pub lock: Duration,
}

impl Default for MonitorTimeouts {
    fn default() -> Self {
        MonitorTimeouts {
            connect: Duration::from_secs(5),
            command: Duration::from_secs(30),
            lock: Duration::from_secs(30),
        }
    }
}

/// Errors which may occur while talking to a monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The target socket could not be dialed within the connect budget.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The connection was closed, either explicitly or because an earlier
    /// I/O failure marked it dead.
    #[error("monitor connection is closed")]
    Closed,

    /// I/O failure mid-command. The connection is dead afterwards.
    #[error("I/O failure on monitor socket: {0}")]
    Socket(#[from] io::Error),

    /// The peer sent something this protocol variant cannot interpret, or
    /// never produced the response boundary at all.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The per-connection command lock was not acquired in time.
    #[error("timed out waiting for the monitor command lock")]
    LockTimeout,

    /// No response arrived within the caller's budget.
    #[error("command {command} timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    /// An awaited asynchronous notification never arrived.
    #[error("event {name} did not arrive within {timeout:?}")]
    EventTimeout { name: String, timeout: Duration },

    /// The command is absent from the connection's introspected command
    /// set.
    #[error("command {command} is not supported by this monitor")]
    NotSupported { command: String },

    /// The remote explicitly rejected the command. The arguments and the
    /// remote payload ride along verbatim for diagnostics.
    #[error("command {command} failed: {payload}")]
    Command {
        command: String,
        args: Value,
        payload: RemoteErrorPayload,
    },
}

/// Lazily-fetched, per-connection introspection results. Populated on first
/// use and memoized for the connection's lifetime.
#[derive(Debug, Default)]
pub(crate) struct Memoized {
    pub(crate) commands: OnceCell<HashSet<String>>,
    pub(crate) capabilities: OnceCell<HashSet<String>>,
    pub(crate) parameters: OnceCell<HashSet<String>>,
}

/// A connection to one instance's control channel, tagged by protocol
/// variant.
pub enum Monitor {
    Human(HumanMonitor),
    Structured(StructuredMonitor),
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Monitor::Human(_) => f.debug_tuple("Human").finish(),
            Monitor::Structured(_) => f.debug_tuple("Structured").finish(),
        }
    }
}

impl Monitor {
    /// Dials `channel` and completes the variant's greeting/handshake
    /// sequence. The returned connection is ready for `execute`.
    pub async fn connect(
        channel: &ControlChannel,
        timeouts: MonitorTimeouts,
        log: &Logger,
    ) -> Result<Self, MonitorError> {
        let log = log.new(slog::o!(
            "channel" => channel.name.clone(),
            "address" => channel.address.to_string(),
        ));
        match channel.kind {
            ChannelKind::Human => Ok(Monitor::Human(
                HumanMonitor::connect(&channel.address, timeouts, log)
                    .await?,
            )),
            ChannelKind::Structured => Ok(Monitor::Structured(
                StructuredMonitor::connect(&channel.address, timeouts, log)
                    .await?,
            )),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Monitor::Human(_) => ChannelKind::Human,
            Monitor::Structured(_) => ChannelKind::Structured,
        }
    }

    /// Executes one command and returns its result.
    ///
    /// At most one command is in flight per connection; concurrent callers
    /// queue on the command lock and fail with [`MonitorError::LockTimeout`]
    /// if they wait longer than the lock budget. The human variant takes a
    /// pre-rendered command line and returns its output as a JSON string;
    /// the structured variant takes a command name plus optional arguments
    /// and returns the `return` payload.
    pub async fn execute(
        &self,
        command: &str,
        args: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, MonitorError> {
        match self {
            Monitor::Human(m) => m.execute(command, args, timeout).await,
            Monitor::Structured(m) => {
                m.execute(command, args, timeout).await
            }
        }
    }

    /// Closes the connection. Idempotent; subsequent `execute` calls fail
    /// with [`MonitorError::Closed`].
    pub async fn close(&self) {
        match self {
            Monitor::Human(m) => m.close().await,
            Monitor::Structured(m) => m.close().await,
        }
    }

    /// Returns buffered out-of-band notifications in arrival order,
    /// optionally draining the buffer. The human variant has no event
    /// channel and always returns an empty sequence.
    pub fn events(&self, clear: bool) -> Vec<Value> {
        match self {
            Monitor::Human(_) => Vec::new(),
            Monitor::Structured(m) => m.events(clear),
        }
    }

    pub fn clear_events(&self) {
        if let Monitor::Structured(m) = self {
            m.clear_events();
        }
    }

    /// Drops buffered notifications carrying the given event name, leaving
    /// the rest in place.
    pub fn clear_events_named(&self, name: &str) {
        if let Monitor::Structured(m) = self {
            m.clear_events_named(name);
        }
    }

    /// Blocks until a notification with the given event name is available,
    /// removing and returning it. Used to await discrete milestones without
    /// racing the command/response channel.
    pub async fn wait_event(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Value, MonitorError> {
        match self {
            Monitor::Human(_) => Err(MonitorError::Protocol(
                "the human monitor variant has no event channel".to_owned(),
            )),
            Monitor::Structured(m) => m.wait_event(name, timeout).await,
        }
    }

    /// The set of commands this monitor supports, fetched via the
    /// variant's introspection command on first use.
    pub async fn commands(&self) -> Result<&HashSet<String>, MonitorError> {
        match self {
            Monitor::Human(m) => {
                m.memo.commands.get_or_try_init(|| m.fetch_commands()).await
            }
            Monitor::Structured(m) => {
                m.memo.commands.get_or_try_init(|| m.fetch_commands()).await
            }
        }
    }

    pub async fn has_command(
        &self,
        name: &str,
    ) -> Result<bool, MonitorError> {
        Ok(self.commands().await?.contains(name))
    }

    /// Maps `name` onto the spelling this monitor actually exposes: an
    /// exact match first, then a separator-insensitive match, then the
    /// experimental-prefix fallback.
    pub async fn resolve_command(
        &self,
        name: &str,
    ) -> Result<String, MonitorError> {
        let set = self.commands().await?;
        if set.contains(name) {
            return Ok(name.to_owned());
        }

        let wanted = caps::normalize(name);
        if let Some(found) =
            set.iter().find(|c| caps::normalize(c) == wanted)
        {
            return Ok(found.clone());
        }

        let toggled = caps::normalize(&caps::toggle_prefix(name));
        if let Some(found) =
            set.iter().find(|c| caps::normalize(c) == toggled)
        {
            return Ok(found.clone());
        }

        Err(MonitorError::NotSupported { command: name.to_owned() })
    }

    /// The migration capability names this monitor supports, fetched on
    /// first use.
    pub async fn migration_capability_names(
        &self,
    ) -> Result<&HashSet<String>, MonitorError> {
        match self {
            Monitor::Human(m) => {
                m.memo
                    .capabilities
                    .get_or_try_init(|| m.fetch_capability_names())
                    .await
            }
            Monitor::Structured(m) => {
                m.memo
                    .capabilities
                    .get_or_try_init(|| m.fetch_capability_names())
                    .await
            }
        }
    }

    /// The migration parameter names this monitor supports, fetched on
    /// first use.
    pub async fn migration_parameter_names(
        &self,
    ) -> Result<&HashSet<String>, MonitorError> {
        match self {
            Monitor::Human(m) => {
                m.memo
                    .parameters
                    .get_or_try_init(|| m.fetch_parameter_names())
                    .await
            }
            Monitor::Structured(m) => {
                m.memo
                    .parameters
                    .get_or_try_init(|| m.fetch_parameter_names())
                    .await
            }
        }
    }
}
