// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The migration phase handlers and the pieces they share.
//!
//! Each host's agent exposes the phase handlers for its role: the
//! destination runs prepare and finish, the source runs perform, confirm,
//! cancel, and resume. Handlers are idempotent with respect to their
//! inputs and leave the host in a well-defined state on both success and
//! failure: anything a phase changed before failing is rolled back before
//! the error propagates.

use std::collections::BTreeMap;
use std::fmt;

use apiary_api_types::{
    MigrationFlag, MigrationParameters, MigrationPhase, MigrationStatus,
    UnsupportedProtocol,
};
use apiary_monitor::{caps, Monitor, MonitorError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::vm::VmError;

pub mod destination;
pub mod protocol;
pub mod source;

pub use destination::{DestinationHandler, PreparedDestination};
pub use source::SourceHandler;

#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum MigrateRole {
    Source,
    Destination,
}

impl fmt::Display for MigrateRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrateRole::Source => write!(f, "source"),
            MigrateRole::Destination => write!(f, "destination"),
        }
    }
}

/// Errors which may occur during the course of a migration. These cross
/// the host boundary, so remote failures are carried as strings rather
/// than as their source error types.
#[derive(Clone, Debug, Deserialize, Error, PartialEq, Serialize)]
pub enum MigrateError {
    /// The requested transport is not in the supported set.
    #[error(transparent)]
    UnsupportedProtocol(#[from] UnsupportedProtocol),

    /// No listen point could be allocated for the incoming side.
    #[error("no usable listen address: {0}")]
    Listen(String),

    /// The transfer reached no terminal status within the caller's budget.
    #[error("no terminal migration status within {0} seconds")]
    Timeout(u64),

    /// The hypervisor reported the transfer as failed (or as vanished
    /// outright). Carries the last observed status payload.
    #[error("migration entered terminal state {}", .0.status)]
    Failed(MigrationStatus),

    /// The migration was cancelled before completing.
    #[error("migration was cancelled before completing")]
    Cancelled,

    /// An instance lifecycle precondition was violated.
    #[error("instance lifecycle violation: {0}")]
    InvalidState(String),

    /// A requested capability exists in neither its stable nor its
    /// experimental spelling on this host.
    #[error("capability {0} is unsupported on this host")]
    CapabilityUnsupported(String),

    /// A monitor command failed.
    #[error("monitor failure: {0}")]
    Monitor(String),

    /// The storage mirror collaborator failed.
    #[error("storage mirror failure: {0}")]
    Storage(String),

    /// The incoming instance could not be launched.
    #[error("failed to launch the incoming instance: {0}")]
    Launch(String),

    /// Some other instance-control failure.
    #[error("instance control failure: {0}")]
    Instance(String),

    /// A finish/confirm call referenced a migration this host is not
    /// holding state for.
    #[error("migration {0} is not known to this host")]
    UnknownMigration(Uuid),

    /// A task operation arrived in the wrong phase.
    #[error("operation requires task phase {expected}, found {actual}")]
    Phase { expected: MigrationPhase, actual: MigrationPhase },

    /// The opposite host reported an error through the gateway.
    #[error("{0} host error: {1}")]
    Remote(MigrateRole, String),
}

impl From<MonitorError> for MigrateError {
    fn from(err: MonitorError) -> Self {
        MigrateError::Monitor(err.to_string())
    }
}

impl From<VmError> for MigrateError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::InvalidState(inner) => {
                MigrateError::InvalidState(inner.to_string())
            }
            VmError::Monitor(inner) => {
                MigrateError::Monitor(inner.to_string())
            }
            VmError::Launch(_, _) => MigrateError::Launch(err.to_string()),
            other => MigrateError::Instance(other.to_string()),
        }
    }
}

impl From<caps::CapabilityUnsupported> for MigrateError {
    fn from(err: caps::CapabilityUnsupported) -> Self {
        MigrateError::CapabilityUnsupported(err.0)
    }
}

/// The capability and parameter state of one monitor, captured before a
/// phase mutates it and reapplied if the phase fails. Restoring the
/// snapshot is what makes a failed migration invisible in the surviving
/// host's configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct CapabilitySnapshot {
    capabilities: BTreeMap<String, bool>,
    parameters: BTreeMap<String, serde_json::Value>,
}

impl CapabilitySnapshot {
    pub async fn capture(
        monitor: &Monitor,
    ) -> Result<Self, MigrateError> {
        Ok(CapabilitySnapshot {
            capabilities: monitor.migrate_capabilities().await?,
            parameters: monitor.migrate_parameters().await?,
        })
    }

    pub async fn restore(
        &self,
        monitor: &Monitor,
    ) -> Result<(), MigrateError> {
        monitor.set_migrate_capabilities(&self.capabilities).await?;
        monitor.set_migrate_parameters(&self.parameters).await?;
        Ok(())
    }
}

/// The capability map a parameter set implies: explicit requests plus the
/// toggles behind the behavior flags. Explicit requests win over
/// flag-implied ones.
pub(crate) fn effective_capabilities(
    params: &MigrationParameters,
) -> BTreeMap<String, bool> {
    let mut caps = params.capabilities.clone();
    if params.flags.contains(&MigrationFlag::AutoConverge) {
        caps.entry("auto-converge".to_owned()).or_insert(true);
    }
    if params.flags.contains(&MigrationFlag::Postcopy) {
        caps.entry("postcopy-ram".to_owned()).or_insert(true);
    }
    caps
}

/// Applies the requested capability and parameter maps to one monitor.
/// Every abstract name is resolved against the connection's supported set
/// with the experimental-prefix fallback; a name supported in neither
/// spelling fails the whole application before anything is transferred.
pub(crate) async fn apply_requested(
    monitor: &Monitor,
    params: &MigrationParameters,
) -> Result<(), MigrateError> {
    let requested = effective_capabilities(params);
    if !requested.is_empty() {
        let supported = monitor.migration_capability_names().await?;
        let mut resolved = BTreeMap::new();
        for (name, state) in requested {
            resolved.insert(caps::resolve(&name, supported, true, true)?, state);
        }
        monitor.set_migrate_capabilities(&resolved).await?;
    }

    if !params.parameters.is_empty() {
        let supported = monitor.migration_parameter_names().await?;
        let mut resolved = BTreeMap::new();
        for (name, value) in &params.parameters {
            resolved.insert(
                caps::resolve(name, supported, true, true)?,
                value.clone(),
            );
        }
        monitor.set_migrate_parameters(&resolved).await?;
    }

    Ok(())
}
