// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The instance lifecycle state machine.
//!
//! States move `Defined -> Running -> {Paused <-> Running} -> Stopped ->
//! Undefined`. Every operation validates the instance's current state
//! against its allowed source-state set and fails with
//! [`InvalidStateError`] instead of silently doing nothing; that guarantee
//! is what lets the migration rollback paths call `stop` without
//! re-checking state themselves.

use std::sync::Arc;
use std::time::Duration;

use apiary_api_types::IncomingDescriptor;
use apiary_api_types::InstanceState as State;
use apiary_monitor::{Monitor, MonitorError};
use slog::{info, warn};
use tokio::time::Instant;

use super::{
    AgentContext, GuestCredentials, Instance, InvalidStateError, VmError,
};

/// Interval at which a freshly launched instance's control socket is
/// re-dialed, and at which a graceful stop checks for process exit.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

pub struct LifecycleManager {
    ctx: Arc<AgentContext>,
}

impl LifecycleManager {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        LifecycleManager { ctx }
    }

    fn require(
        instance: &Instance,
        required: &'static [State],
    ) -> Result<(), InvalidStateError> {
        if required.contains(&instance.state()) {
            return Ok(());
        }
        Err(InvalidStateError {
            instance: instance.id(),
            current: instance.state(),
            required,
        })
    }

    /// Launches the instance process and connects its control channels.
    /// A plain start leaves the guest running; a start with an incoming
    /// descriptor leaves it paused awaiting the migration state stream.
    pub async fn start(
        &self,
        instance: &mut Instance,
        incoming: Option<&IncomingDescriptor>,
    ) -> Result<(), VmError> {
        Self::require(instance, &[State::Defined, State::Stopped])?;

        info!(self.ctx.log, "starting instance";
              "instance" => %instance.id(),
              "incoming" => incoming.is_some());
        let process = self
            .ctx
            .launcher
            .launch(instance.spec(), incoming)
            .await
            .map_err(|e| VmError::Launch(instance.id(), e.to_string()))?;
        instance.set_process(process);

        if let Err(e) = self.connect_channels(instance).await {
            // A process we cannot command is unusable; take it back down
            // and leave the instance in its original state.
            warn!(self.ctx.log, "control channel never came up: {e}";
                  "instance" => %instance.id());
            if let Some(process) = instance.take_process() {
                let _ = process.destroy();
            }
            instance.monitors_mut().close_all().await;
            return Err(e);
        }

        instance.set_state(if incoming.is_some() {
            State::Paused
        } else {
            State::Running
        });
        Ok(())
    }

    /// Dials each channel in the instance spec, retrying refused
    /// connections until the readiness budget runs out. The socket appears
    /// some time after the process does.
    async fn connect_channels(
        &self,
        instance: &mut Instance,
    ) -> Result<(), VmError> {
        let deadline =
            Instant::now() + self.ctx.config.monitor.ready_timeout();
        let timeouts = self.ctx.config.monitor.timeouts();
        for channel in instance.spec().channels.clone() {
            loop {
                match Monitor::connect(&channel, timeouts, &self.ctx.log)
                    .await
                {
                    Ok(monitor) => {
                        if let Some(displaced) = instance
                            .monitors_mut()
                            .register(channel.name.clone(), Arc::new(monitor))
                        {
                            displaced.close().await;
                        }
                        break;
                    }
                    Err(MonitorError::Connect { .. })
                        if Instant::now() < deadline =>
                    {
                        tokio::time::sleep(RETRY_INTERVAL).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    pub async fn pause(&self, instance: &mut Instance) -> Result<(), VmError> {
        Self::require(instance, &[State::Running])?;
        instance.control_monitor()?.pause_guest().await?;
        instance.set_state(State::Paused);
        Ok(())
    }

    pub async fn resume(
        &self,
        instance: &mut Instance,
    ) -> Result<(), VmError> {
        Self::require(instance, &[State::Paused])?;
        instance.control_monitor()?.resume_guest().await?;
        instance.set_state(State::Running);
        Ok(())
    }

    /// Stops the instance. A graceful stop asks the guest to shut itself
    /// down over the guest channel and waits up to `timeout` for the
    /// process to exit before forcing termination.
    pub async fn stop(
        &self,
        instance: &mut Instance,
        graceful: bool,
        timeout: Duration,
        credentials: Option<&GuestCredentials>,
    ) -> Result<(), VmError> {
        Self::require(instance, &[State::Running, State::Paused])?;

        if graceful {
            match self.ctx.guest.shutdown(instance.id(), credentials).await {
                Ok(()) => {
                    let deadline = Instant::now() + timeout;
                    while instance.is_process_running()
                        && Instant::now() < deadline
                    {
                        tokio::time::sleep(RETRY_INTERVAL).await;
                    }
                }
                Err(e) => {
                    warn!(self.ctx.log,
                          "guest shutdown failed, falling back to forced stop: {e}";
                          "instance" => %instance.id());
                }
            }
        }

        if instance.is_process_running() {
            if let Some(process) = instance.process() {
                process
                    .destroy()
                    .map_err(|e| VmError::Process(e.to_string()))?;
            }
        }

        info!(self.ctx.log, "instance stopped";
              "instance" => %instance.id(),
              "graceful" => graceful);
        instance.set_state(State::Stopped);
        Ok(())
    }

    /// Releases the instance's bookkeeping: every monitor connection is
    /// closed and removed, and with `free_resources` the process handle is
    /// dropped as well.
    pub async fn undefine(
        &self,
        instance: &mut Instance,
        free_resources: bool,
    ) -> Result<(), VmError> {
        Self::require(instance, &[State::Stopped])?;

        instance.monitors_mut().close_all().await;
        if free_resources {
            instance.take_process();
        }
        instance.set_state(State::Undefined);
        info!(self.ctx.log, "instance undefined"; "instance" => %instance.id());
        Ok(())
    }
}
