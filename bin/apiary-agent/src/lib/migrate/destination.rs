// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The destination-side migration phases: prepare and finish.

use std::sync::Arc;

use apiary_api_types::{
    FinishOutcome, IncomingDescriptor, InstanceSpec, InstanceState,
    MigrationParameters,
};
use apiary_monitor::Monitor;
use slog::{info, warn, Logger};
use uuid::Uuid;

use crate::migrate::{
    apply_requested, protocol, CapabilitySnapshot, MigrateError,
};
use crate::vm::lifecycle::LifecycleManager;
use crate::vm::{AgentContext, Instance};

/// Per-migration state the destination holds between prepare and finish.
pub struct PreparedDestination {
    migration_id: Uuid,
    pub instance: Instance,
    pub descriptor: IncomingDescriptor,
    storage_listener: bool,
}

impl PreparedDestination {
    pub fn migration_id(&self) -> Uuid {
        self.migration_id
    }
}

impl std::fmt::Debug for PreparedDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedDestination")
            .field("migration_id", &self.migration_id)
            .field("descriptor", &self.descriptor)
            .field("storage_listener", &self.storage_listener)
            .finish()
    }
}

pub struct DestinationHandler {
    ctx: Arc<AgentContext>,
    lifecycle: LifecycleManager,
}

impl DestinationHandler {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        let lifecycle = LifecycleManager::new(ctx.clone());
        DestinationHandler { ctx, lifecycle }
    }

    /// Stands up everything the destination needs before the source dials
    /// in: a listen point, an instance in incoming mode, the requested
    /// capability and parameter state, and (for non-shared-disk
    /// migrations) the storage-transfer listener. On any failure the
    /// destination is unwound to exactly where it was before prepare was
    /// attempted.
    pub async fn prepare(
        &self,
        migration_id: Uuid,
        spec: InstanceSpec,
        params: MigrationParameters,
    ) -> Result<PreparedDestination, MigrateError> {
        let log = self.ctx.log.new(slog::o!(
            "migration_id" => migration_id.to_string(),
            "migrate_role" => "destination",
        ));
        info!(log, "preparing incoming migration";
              "instance" => %spec.id,
              "protocol" => %params.uri.protocol);

        // Resolve the listen point before any side effect; an
        // unsatisfiable transport request must not leave anything behind.
        let descriptor = protocol::allocate(
            &self.ctx.config.migration,
            migration_id,
            &params.uri,
        )?;

        let mut instance = Instance::new(spec);
        self.lifecycle.start(&mut instance, Some(&descriptor)).await?;

        let monitor = match instance.control_monitor() {
            Ok(monitor) => monitor,
            Err(e) => {
                self.unwind(&log, &mut instance, None, false, migration_id)
                    .await;
                return Err(e.into());
            }
        };

        let snapshot = match CapabilitySnapshot::capture(&monitor).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.unwind(&log, &mut instance, None, false, migration_id)
                    .await;
                return Err(e);
            }
        };

        let mut storage_listener = false;
        if let Err(e) = self
            .activate(
                migration_id,
                &monitor,
                &descriptor,
                &params,
                &mut storage_listener,
            )
            .await
        {
            self.unwind(
                &log,
                &mut instance,
                Some(&snapshot),
                storage_listener,
                migration_id,
            )
            .await;
            return Err(e);
        }

        info!(log, "destination prepared"; "uri" => descriptor.uri());
        Ok(PreparedDestination {
            migration_id,
            instance,
            descriptor,
            storage_listener,
        })
    }

    async fn activate(
        &self,
        migration_id: Uuid,
        monitor: &Monitor,
        descriptor: &IncomingDescriptor,
        params: &MigrationParameters,
        storage_listener: &mut bool,
    ) -> Result<(), MigrateError> {
        apply_requested(monitor, params).await?;

        if params.wants_storage() {
            self.ctx
                .storage
                .start_transfer_listener(
                    migration_id,
                    &params.migrate_disks,
                    descriptor,
                )
                .await
                .map_err(|e| MigrateError::Storage(e.to_string()))?;
            *storage_listener = true;
        }

        monitor.migrate_incoming(&descriptor.uri()).await?;
        Ok(())
    }

    /// Best-effort teardown after a failed prepare. The capability
    /// snapshot is reapplied where one was taken, the storage listener is
    /// stopped where one was started, and the instance is forcibly
    /// stopped.
    async fn unwind(
        &self,
        log: &Logger,
        instance: &mut Instance,
        snapshot: Option<&CapabilitySnapshot>,
        storage_listener: bool,
        migration_id: Uuid,
    ) {
        if let (Some(snapshot), Ok(monitor)) =
            (snapshot, instance.control_monitor())
        {
            if let Err(e) = snapshot.restore(&monitor).await {
                warn!(log, "failed to restore settings during unwind: {e}");
            }
        }

        if storage_listener {
            if let Err(e) =
                self.ctx.storage.stop_transfer_listener(migration_id).await
            {
                warn!(log, "failed to stop storage listener during unwind: {e}");
            }
        }

        if matches!(
            instance.state(),
            InstanceState::Running | InstanceState::Paused
        ) {
            if let Err(e) = self
                .lifecycle
                .stop(
                    instance,
                    false,
                    self.ctx.config.migration.stop_timeout(),
                    None,
                )
                .await
            {
                warn!(log, "failed to stop instance during unwind: {e}");
            }
        }
        instance.monitors_mut().close_all().await;
    }

    /// Concludes the destination side once the source's perform phase has
    /// run. A failed perform tears the incoming instance down; a
    /// successful one resumes the (paused) migrated-in guest and drops the
    /// monitor connections this migration owned, since the instance's new
    /// owner opens fresh ones.
    pub async fn finish(
        &self,
        prepared: &mut PreparedDestination,
        source_succeeded: bool,
    ) -> Result<FinishOutcome, MigrateError> {
        let log = self.ctx.log.new(slog::o!(
            "migration_id" => prepared.migration_id.to_string(),
            "migrate_role" => "destination",
        ));
        let instance = &mut prepared.instance;

        if !source_succeeded {
            let diagnostics = match instance.control_monitor() {
                Ok(monitor) if instance.is_process_running() => {
                    monitor.migration_status().await.ok()
                }
                _ => None,
            };

            if prepared.storage_listener {
                if let Err(e) = self
                    .ctx
                    .storage
                    .stop_transfer_listener(prepared.migration_id)
                    .await
                {
                    warn!(log, "failed to stop storage listener: {e}");
                }
            }

            if matches!(
                instance.state(),
                InstanceState::Running | InstanceState::Paused
            ) {
                self.lifecycle
                    .stop(
                        instance,
                        false,
                        self.ctx.config.migration.stop_timeout(),
                        None,
                    )
                    .await?;
            }
            instance.monitors_mut().close_all().await;

            info!(log, "incoming migration torn down after source failure");
            return Ok(FinishOutcome { success: false, diagnostics });
        }

        let monitor = instance.control_monitor()?;
        let diagnostics = monitor.migration_status().await.ok();

        if instance.state() == InstanceState::Paused {
            self.lifecycle.resume(instance).await?;
        }

        // The migrated-in instance opens fresh control connections going
        // forward; only the ones this migration dialed are dropped here.
        instance.monitors_mut().close_all().await;

        info!(log, "incoming migration finished";
              "status" => diagnostics
                  .as_ref()
                  .map(|d| d.status.clone())
                  .unwrap_or_else(|| "unknown".to_owned()));
        Ok(FinishOutcome { success: true, diagnostics })
    }
}
