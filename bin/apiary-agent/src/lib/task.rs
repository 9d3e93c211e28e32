// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-migration task an operator drives.
//!
//! A task binds one source instance to one destination host and sequences
//! the four phases across them: prepare on the destination, perform on
//! the source, finish on the destination, confirm on the source. Its
//! phase moves strictly forward (`Accepted -> PreMigrating -> Migrating ->
//! PostMigrating -> Completed`) with `Error` as the only sink, and a task
//! is never reused across migrations.
//!
//! The destination's handlers are reached through [`DestinationGateway`],
//! the typed seam the host-to-host RPC transport implements. This layer
//! treats a gateway call as reliable, ordered, and synchronous; transport
//! retries live below the seam.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use apiary_api_types::{
    FinishOutcome, IncomingDescriptor, InstanceSpec, MigrationParameters,
    MigrationPhase, MigrationStatus,
};
use apiary_monitor::Monitor;
use slog::{info, warn, Logger};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::migrate::{MigrateError, MigrateRole, SourceHandler};
use crate::vm::{AgentContext, Instance};

/// The destination host's migration handlers, as seen from the source
/// host. Gateway implementations translate instance channel addresses
/// into paths valid on their own host.
#[async_trait::async_trait]
pub trait DestinationGateway: Send + Sync {
    async fn prepare(
        &self,
        migration_id: Uuid,
        spec: InstanceSpec,
        params: MigrationParameters,
    ) -> Result<IncomingDescriptor, MigrateError>;

    async fn finish(
        &self,
        migration_id: Uuid,
        source_succeeded: bool,
    ) -> Result<FinishOutcome, MigrateError>;
}

pub struct MigrationTask {
    id: Uuid,
    params: MigrationParameters,
    instance: Arc<Mutex<Instance>>,
    /// The source's control channel, grabbed at creation so cancel and
    /// resume never contend with an in-flight perform for the instance
    /// itself.
    monitor: Arc<Monitor>,
    gateway: Arc<dyn DestinationGateway>,
    source: SourceHandler,
    phase: StdMutex<MigrationPhase>,
    last_status: StdMutex<Option<MigrationStatus>>,
    timeout: Duration,
    log: Logger,
}

impl MigrationTask {
    /// Binds a new task to a running source instance and a destination
    /// gateway. The instance must already carry its control channel.
    pub async fn new(
        ctx: Arc<AgentContext>,
        instance: Arc<Mutex<Instance>>,
        gateway: Arc<dyn DestinationGateway>,
        params: MigrationParameters,
    ) -> Result<Self, MigrateError> {
        let id = Uuid::new_v4();
        let (monitor, log) = {
            let guard = instance.lock().await;
            let monitor = guard.control_monitor()?;
            let log = ctx.log.new(slog::o!(
                "migration_id" => id.to_string(),
                "instance" => guard.id().to_string(),
            ));
            (monitor, log)
        };
        let timeout = ctx.config.migration.timeout();

        Ok(MigrationTask {
            id,
            params,
            instance,
            monitor,
            gateway,
            source: SourceHandler::new(ctx),
            phase: StdMutex::new(MigrationPhase::Accepted),
            last_status: StdMutex::new(None),
            timeout,
            log,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> MigrationPhase {
        *self.phase.lock().unwrap()
    }

    /// The most recent status payload observed from the source's
    /// hypervisor, for operator diagnostics.
    pub fn last_status(&self) -> Option<MigrationStatus> {
        self.last_status.lock().unwrap().clone()
    }

    fn begin(&self) -> Result<(), MigrateError> {
        let mut phase = self.phase.lock().unwrap();
        if *phase != MigrationPhase::Accepted {
            return Err(MigrateError::Phase {
                expected: MigrationPhase::Accepted,
                actual: *phase,
            });
        }
        *phase = MigrationPhase::PreMigrating;
        info!(self.log, "task phase advanced"; "phase" => %*phase);
        Ok(())
    }

    fn advance(&self, next: MigrationPhase) {
        let mut phase = self.phase.lock().unwrap();
        *phase = next;
        info!(self.log, "task phase advanced"; "phase" => %next);
    }

    fn fail(&self, err: MigrateError) -> MigrateError {
        self.advance(MigrationPhase::Error);
        slog::error!(self.log, "migration failed: {err}");
        err
    }

    /// Runs the migration to completion. All four phases always run once
    /// prepare has succeeded, feeding each phase the previous one's
    /// outcome, so both hosts converge on a consistent state even when
    /// the transfer itself fails; the first error is the one surfaced.
    pub async fn run(&self) -> Result<MigrationStatus, MigrateError> {
        self.begin()?;

        let spec = { self.instance.lock().await.spec().clone() };
        let descriptor = match self
            .gateway
            .prepare(self.id, spec, self.params.clone())
            .await
        {
            Ok(descriptor) => descriptor,
            Err(e) => return Err(self.fail(e)),
        };
        info!(self.log, "destination ready"; "uri" => descriptor.uri());

        self.advance(MigrationPhase::Migrating);
        let perform = {
            let mut instance = self.instance.lock().await;
            self.source
                .perform(
                    self.id,
                    &mut instance,
                    &self.params,
                    &descriptor,
                    self.timeout,
                )
                .await
        };
        let (source_ok, perform_err) = match perform {
            Ok((ok, status)) => {
                *self.last_status.lock().unwrap() = Some(status);
                (ok, None)
            }
            Err(e) => (false, Some(e)),
        };

        self.advance(MigrationPhase::PostMigrating);
        let finish = self.gateway.finish(self.id, source_ok).await;
        let finish_ok = match &finish {
            Ok(outcome) => outcome.success,
            Err(e) => {
                warn!(self.log, "destination finish failed: {e}");
                false
            }
        };

        let confirm = {
            let mut instance = self.instance.lock().await;
            self.source
                .confirm(self.id, &mut instance, &self.params, finish_ok)
                .await
        };

        if let Some(e) = perform_err {
            return Err(self.fail(e));
        }
        if !source_ok {
            return Err(self.fail(MigrateError::Cancelled));
        }
        if let Err(e) = finish {
            return Err(self.fail(e));
        }
        if !finish_ok {
            return Err(self.fail(MigrateError::Remote(
                MigrateRole::Destination,
                "finish reported failure".to_owned(),
            )));
        }
        if let Err(e) = confirm {
            return Err(self.fail(e));
        }

        self.advance(MigrationPhase::Completed);
        Ok(self
            .last_status
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(MigrationStatus::idle))
    }

    /// Asks the hypervisor to abort the in-flight transfer. Only valid
    /// while the task is in its transfer phase.
    pub async fn cancel(
        &self,
        timeout: Duration,
    ) -> Result<bool, MigrateError> {
        self.require_phase(MigrationPhase::Migrating)?;
        self.source.cancel(&self.monitor, timeout).await
    }

    /// Releases a transfer paused at pre-switchover. Only valid while the
    /// task is in its transfer phase.
    pub async fn resume(&self) -> Result<(), MigrateError> {
        self.require_phase(MigrationPhase::Migrating)?;
        self.source.resume(&self.monitor).await
    }

    fn require_phase(
        &self,
        expected: MigrationPhase,
    ) -> Result<(), MigrateError> {
        let actual = *self.phase.lock().unwrap();
        if actual != expected {
            return Err(MigrateError::Phase { expected, actual });
        }
        Ok(())
    }
}
