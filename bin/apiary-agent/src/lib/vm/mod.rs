// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instance bookkeeping and the collaborator seams beneath it.
//!
//! An [`Instance`] owns its process handle and its monitor connections;
//! everything else the agent needs to touch an instance (process launch,
//! storage replication, in-guest commands) enters through the traits in
//! this module, carried by an [`AgentContext`] constructed once at process
//! start and passed by reference.
//!
//! Instance state is mutated only by the lifecycle manager. Callers that
//! operate on the same instance concurrently must serialize themselves;
//! this layer adds no lock of its own.

use std::collections::HashMap;
use std::sync::Arc;

use apiary_api_types::{IncomingDescriptor, InstanceSpec, InstanceState};
use apiary_monitor::{Monitor, MonitorError};
use slog::Logger;
use thiserror::Error;
use uuid::Uuid;

use crate::config::AgentConfig;

pub mod lifecycle;

/// The logical name of the channel every instance carries.
pub const CONTROL_CHANNEL: &str = "control";

/// A lifecycle operation was attempted from a state outside its allowed
/// source-state set. This is a programming or race error in the caller,
/// not a retryable condition.
#[derive(Clone, Debug, Error)]
#[error(
    "instance {instance} is {current}, operation requires one of {required:?}"
)]
pub struct InvalidStateError {
    pub instance: Uuid,
    pub current: InstanceState,
    pub required: &'static [InstanceState],
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    InvalidState(#[from] InvalidStateError),

    #[error("instance {0} has no control channel named {1:?}")]
    NoChannel(Uuid, String),

    #[error("failed to launch instance {0}: {1}")]
    Launch(Uuid, String),

    #[error("monitor failure: {0}")]
    Monitor(#[from] MonitorError),

    #[error("guest channel failure: {0}")]
    Guest(String),

    #[error("process control failure: {0}")]
    Process(String),
}

/// The monitor connections an instance owns, keyed by logical channel
/// name. Lookup, insertion, and removal are explicit; nothing outside the
/// owning instance can reach these connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: HashMap<String, Arc<Monitor>>,
}

impl ConnectionRegistry {
    /// Registers a connection under `name`, returning the connection it
    /// displaced, if any, so the caller can close it.
    pub fn register(
        &mut self,
        name: String,
        conn: Arc<Monitor>,
    ) -> Option<Arc<Monitor>> {
        self.conns.insert(name, conn)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Monitor>> {
        self.conns.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<Monitor>> {
        self.conns.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.conns.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Closes and removes every connection in the registry.
    pub async fn close_all(&mut self) {
        for (_, conn) in self.conns.drain() {
            conn.close().await;
        }
    }
}

/// One instance as this agent tracks it.
pub struct Instance {
    spec: InstanceSpec,
    state: InstanceState,
    process: Option<Box<dyn InstanceProcess>>,
    monitors: ConnectionRegistry,
}

impl Instance {
    pub fn new(spec: InstanceSpec) -> Self {
        Instance {
            spec,
            state: InstanceState::Defined,
            process: None,
            monitors: ConnectionRegistry::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &InstanceSpec {
        &self.spec
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: InstanceState) {
        self.state = state;
    }

    pub fn monitors(&self) -> &ConnectionRegistry {
        &self.monitors
    }

    pub fn monitors_mut(&mut self) -> &mut ConnectionRegistry {
        &mut self.monitors
    }

    /// The instance's primary control channel.
    pub fn control_monitor(&self) -> Result<Arc<Monitor>, VmError> {
        self.monitors.get(CONTROL_CHANNEL).cloned().ok_or_else(|| {
            VmError::NoChannel(self.id(), CONTROL_CHANNEL.to_owned())
        })
    }

    pub(crate) fn set_process(&mut self, process: Box<dyn InstanceProcess>) {
        self.process = Some(process);
    }

    pub(crate) fn take_process(&mut self) -> Option<Box<dyn InstanceProcess>> {
        self.process.take()
    }

    pub fn process(&self) -> Option<&dyn InstanceProcess> {
        self.process.as_deref()
    }

    pub fn is_process_running(&self) -> bool {
        self.process.as_ref().map(|p| p.is_running()).unwrap_or(false)
    }
}

/// Launches instance processes. Building the command line and the device
/// inventory happens below this seam.
#[async_trait::async_trait]
pub trait InstanceLauncher: Send + Sync {
    /// Starts the process for `spec`. With `incoming` set, the process
    /// starts in incoming mode: the guest stays paused until a migration
    /// state stream lands.
    async fn launch(
        &self,
        spec: &InstanceSpec,
        incoming: Option<&IncomingDescriptor>,
    ) -> anyhow::Result<Box<dyn InstanceProcess>>;
}

/// A handle to a launched instance process.
pub trait InstanceProcess: Send + Sync {
    fn pid(&self) -> u32;
    fn is_running(&self) -> bool;
    /// Forcibly terminates the process.
    fn destroy(&self) -> anyhow::Result<()>;
}

/// Credentials for the in-guest command channel, when the guest requires
/// them.
#[derive(Clone, Debug)]
pub struct GuestCredentials {
    pub username: String,
    pub password: String,
}

/// The in-guest command channel, used only for cooperative shutdown.
#[async_trait::async_trait]
pub trait GuestChannel: Send + Sync {
    async fn shutdown(
        &self,
        instance: Uuid,
        credentials: Option<&GuestCredentials>,
    ) -> anyhow::Result<()>;
}

/// The storage/volume layer driving non-shared-disk migration.
#[async_trait::async_trait]
pub trait StorageMirror: Send + Sync {
    /// Destination side: accept inbound disk data for `disks`.
    async fn start_transfer_listener(
        &self,
        migration: Uuid,
        disks: &std::collections::BTreeSet<String>,
        descriptor: &IncomingDescriptor,
    ) -> anyhow::Result<()>;

    async fn stop_transfer_listener(
        &self,
        migration: Uuid,
    ) -> anyhow::Result<()>;

    /// Source side: start copying `disks` toward the destination.
    async fn start_copy(
        &self,
        migration: Uuid,
        disks: &std::collections::BTreeSet<String>,
        destination: &IncomingDescriptor,
    ) -> anyhow::Result<()>;

    async fn cancel_copy(
        &self,
        migration: Uuid,
        disks: &std::collections::BTreeSet<String>,
    ) -> anyhow::Result<()>;
}

/// Everything the agent's components need, constructed once in `main` and
/// passed by reference. There are no process-wide singletons.
pub struct AgentContext {
    pub log: Logger,
    pub config: AgentConfig,
    pub launcher: Arc<dyn InstanceLauncher>,
    pub storage: Arc<dyn StorageMirror>,
    pub guest: Arc<dyn GuestChannel>,
}

impl AgentContext {
    pub fn new(
        log: Logger,
        config: AgentConfig,
        launcher: Arc<dyn InstanceLauncher>,
        storage: Arc<dyn StorageMirror>,
        guest: Arc<dyn GuestChannel>,
    ) -> Self {
        AgentContext { log, config, launcher, storage, guest }
    }
}
