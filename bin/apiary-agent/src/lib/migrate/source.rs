// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The source-side migration phases: perform, confirm, cancel, and
//! resume.

use std::sync::Arc;
use std::time::Duration;

use apiary_api_types::{
    IncomingDescriptor, InstanceState, MigrationParameters, MigrationStatus,
};
use apiary_monitor::{Monitor, MonitorError};
use slog::{debug, info, warn, Logger};
use tokio::time::Instant;
use uuid::Uuid;

use crate::migrate::{apply_requested, CapabilitySnapshot, MigrateError};
use crate::vm::lifecycle::LifecycleManager;
use crate::vm::{AgentContext, Instance};

pub struct SourceHandler {
    ctx: Arc<AgentContext>,
    lifecycle: LifecycleManager,
}

impl SourceHandler {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        let lifecycle = LifecycleManager::new(ctx.clone());
        SourceHandler { ctx, lifecycle }
    }

    fn log_for(&self, migration_id: Uuid) -> Logger {
        self.ctx.log.new(slog::o!(
            "migration_id" => migration_id.to_string(),
            "migrate_role" => "source",
        ))
    }

    /// Drives the transfer out of this host: applies the requested
    /// settings, starts the storage copy when asked for, points the
    /// hypervisor at the destination, and polls until a terminal status
    /// lands or `timeout` runs out.
    ///
    /// Returns `(true, status)` for a completed transfer and
    /// `(false, status)` for one the user cancelled. Any other outcome
    /// restores the pre-perform settings, forcibly stops the source
    /// instance, and propagates the error; an observed cancellation
    /// restores the settings but deliberately leaves the still-running
    /// guest alone.
    pub async fn perform(
        &self,
        migration_id: Uuid,
        instance: &mut Instance,
        params: &MigrationParameters,
        destination: &IncomingDescriptor,
        timeout: Duration,
    ) -> Result<(bool, MigrationStatus), MigrateError> {
        let log = self.log_for(migration_id);
        if !matches!(
            instance.state(),
            InstanceState::Running | InstanceState::Paused
        ) {
            return Err(MigrateError::InvalidState(format!(
                "instance {} is {}, migration requires a live instance",
                instance.id(),
                instance.state(),
            )));
        }

        let monitor = instance.control_monitor()?;
        let snapshot = CapabilitySnapshot::capture(&monitor).await?;

        let outcome = self
            .run_transfer(
                &log,
                migration_id,
                &monitor,
                params,
                destination,
                timeout,
            )
            .await;

        match outcome {
            Ok((true, status)) => {
                if params.wants_storage() {
                    // The copy jobs are already drained; reap them.
                    if let Err(e) = self
                        .ctx
                        .storage
                        .cancel_copy(migration_id, &params.migrate_disks)
                        .await
                    {
                        warn!(log, "failed to reap storage copy jobs: {e}");
                    }
                }
                info!(log, "migration completed"; "status" => %status);
                Ok((true, status))
            }
            Ok((false, status)) => {
                // Cancelled by the user: the guest keeps running here, but
                // its migration tunables go back to their pre-migration
                // values.
                if let Err(e) = snapshot.restore(&monitor).await {
                    warn!(log, "failed to restore settings after cancel: {e}");
                }
                info!(log, "migration cancelled"; "status" => %status);
                Ok((false, status))
            }
            Err(e) => {
                if let Err(re) = snapshot.restore(&monitor).await {
                    warn!(log, "failed to restore settings during unwind: {re}");
                }
                if let Err(se) = self
                    .lifecycle
                    .stop(
                        instance,
                        false,
                        self.ctx.config.migration.stop_timeout(),
                        None,
                    )
                    .await
                {
                    warn!(log, "failed to stop instance during unwind: {se}");
                }
                Err(e)
            }
        }
    }

    async fn run_transfer(
        &self,
        log: &Logger,
        migration_id: Uuid,
        monitor: &Monitor,
        params: &MigrationParameters,
        destination: &IncomingDescriptor,
        timeout: Duration,
    ) -> Result<(bool, MigrationStatus), MigrateError> {
        apply_requested(monitor, params).await?;

        if params.wants_storage() {
            self.ctx
                .storage
                .start_copy(migration_id, &params.migrate_disks, destination)
                .await
                .map_err(|e| MigrateError::Storage(e.to_string()))?;
        }

        let uri = destination.uri();
        info!(log, "starting transfer"; "uri" => &uri);
        monitor.migrate(&uri, true).await?;

        // Progress has no push notification; poll at a fixed interval
        // until a terminal status shows up.
        let poll = self.ctx.config.migration.poll_interval();
        let deadline = Instant::now() + timeout;
        loop {
            let status = monitor.migration_status().await?;
            debug!(log, "transfer status"; "status" => %status);
            match status.status.as_str() {
                "completed" => return Ok((true, status)),
                "cancelled" => return Ok((false, status)),
                // A vanished migration is indistinguishable from a failed
                // one from where the operator sits.
                "failed" | "none" => {
                    return Err(MigrateError::Failed(status))
                }
                "pre-switchover" => {
                    info!(log, "paused at pre-switchover, continuing");
                    monitor.migrate_continue().await?;
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                return Err(MigrateError::Timeout(timeout.as_secs()));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Concludes the source side with the destination's finish outcome in
    /// hand. A landed migration releases the source instance entirely; a
    /// failed one leaves the source as the authoritative running copy.
    pub async fn confirm(
        &self,
        migration_id: Uuid,
        instance: &mut Instance,
        params: &MigrationParameters,
        finish_succeeded: bool,
    ) -> Result<(), MigrateError> {
        let log = self.log_for(migration_id);

        if finish_succeeded {
            let monitor = instance.control_monitor()?;
            match monitor.query_status().await {
                Ok(run) if run.handoff_complete() => {
                    self.lifecycle
                        .stop(
                            instance,
                            false,
                            self.ctx.config.migration.stop_timeout(),
                            None,
                        )
                        .await?;
                    self.lifecycle.undefine(instance, true).await?;
                    info!(log, "source instance released after handoff");
                }
                Ok(run) => {
                    warn!(log,
                          "destination reported success but source still reports {}; \
                           leaving the source in place",
                          run.status);
                }
                Err(e) => {
                    warn!(log, "could not confirm handoff state: {e}");
                }
            }
            return Ok(());
        }

        if params.wants_storage() {
            if let Err(e) = self
                .ctx
                .storage
                .cancel_copy(migration_id, &params.migrate_disks)
                .await
            {
                warn!(log, "failed to cancel storage copy jobs: {e}");
            }
        }

        if instance.state() == InstanceState::Paused {
            self.lifecycle.resume(instance).await?;
        }
        info!(log, "source remains authoritative after failed migration");
        Ok(())
    }

    /// Asks the hypervisor to abort the transfer, then polls until the
    /// abort lands. Returns `true` when the status reaches `cancelled`
    /// and `false` when the migration reached another terminal state
    /// first (too late to cancel). Transient command failures are logged
    /// and retried within the timeout; a remote rejection that says there
    /// is nothing to cancel ends the retry loop instead.
    pub async fn cancel(
        &self,
        monitor: &Monitor,
        timeout: Duration,
    ) -> Result<bool, MigrateError> {
        let log = self.ctx.log.new(slog::o!("migrate_role" => "source"));
        let poll = self.ctx.config.migration.poll_interval();
        let deadline = Instant::now() + timeout;

        loop {
            match monitor.migrate_cancel().await {
                Ok(()) => break,
                Err(e) if is_terminal_cancel_error(&e) => {
                    info!(log, "cancel rejected as not applicable: {e}");
                    break;
                }
                Err(e) => {
                    warn!(log, "transient failure issuing cancel: {e}");
                    if Instant::now() >= deadline {
                        return Err(MigrateError::Timeout(
                            timeout.as_secs(),
                        ));
                    }
                    tokio::time::sleep(poll).await;
                }
            }
        }

        loop {
            match monitor.migration_status().await {
                Ok(status) => match status.status.as_str() {
                    "cancelled" => return Ok(true),
                    "completed" | "failed" | "none" => return Ok(false),
                    _ => {}
                },
                Err(e) => {
                    warn!(log, "transient failure polling for cancel: {e}");
                }
            }

            if Instant::now() >= deadline {
                return Err(MigrateError::Timeout(timeout.as_secs()));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Releases a migration paused at the pre-switchover milestone;
    /// reserved for postcopy-style flows driven from outside the perform
    /// loop.
    pub async fn resume(
        &self,
        monitor: &Monitor,
    ) -> Result<(), MigrateError> {
        monitor.migrate_continue().await.map_err(MigrateError::from)
    }
}

/// Remote rejections that mean the cancel will never apply, as opposed to
/// transient failures worth retrying.
fn is_terminal_cancel_error(err: &MonitorError) -> bool {
    match err {
        MonitorError::NotSupported { .. } => true,
        MonitorError::Command { payload, .. } => {
            payload.class == "CommandNotFound"
                || payload.desc.to_ascii_lowercase().contains("no migration")
        }
        _ => false,
    }
}
