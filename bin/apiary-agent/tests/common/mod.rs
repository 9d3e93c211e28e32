// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared scaffolding for the agent integration tests: a scripted fake
//! hypervisor speaking the structured monitor protocol over a Unix
//! socket, plus in-memory collaborator doubles.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use apiary_agent::config::AgentConfig;
use apiary_agent::migrate::{DestinationHandler, PreparedDestination};
use apiary_agent::task::DestinationGateway;
use apiary_agent::vm::{
    AgentContext, GuestChannel, GuestCredentials, InstanceLauncher,
    InstanceProcess, StorageMirror,
};
use apiary_api_types::{
    ChannelKind, ControlAddress, ControlChannel, FinishOutcome,
    IncomingDescriptor, InstanceSpec, MigrationParameters,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use uuid::Uuid;

pub fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

pub struct FakeHypervisorState {
    pub guest: String,
    pub statuses: VecDeque<String>,
    pub caps: BTreeMap<String, bool>,
    pub params: BTreeMap<String, Value>,
    pub migrate_uris: Vec<String>,
    pub incoming_uris: Vec<String>,
    pub fail_incoming: bool,
}

/// A scripted structured-protocol hypervisor. `statuses` is consumed one
/// entry per `query-migrate`, holding the last entry once the script runs
/// dry.
pub struct FakeHypervisor {
    pub path: PathBuf,
    pub state: Arc<Mutex<FakeHypervisorState>>,
}

impl FakeHypervisor {
    pub fn spawn(dir: &Path, name: &str, statuses: &[&str], guest: &str) -> Self {
        let path = dir.join(name);
        let listener = UnixListener::bind(&path).unwrap();
        let state = Arc::new(Mutex::new(FakeHypervisorState {
            guest: guest.to_owned(),
            statuses: statuses.iter().map(|s| s.to_string()).collect(),
            caps: BTreeMap::from([
                ("auto-converge".to_owned(), false),
                ("postcopy-ram".to_owned(), false),
                ("xbzrle".to_owned(), false),
            ]),
            params: BTreeMap::from([
                ("downtime-limit".to_owned(), json!(300)),
                ("max-bandwidth".to_owned(), json!(33554432)),
            ]),
            migrate_uris: Vec::new(),
            incoming_uris: Vec::new(),
            fail_incoming: false,
        }));

        let served = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = served.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, state).await;
                });
            }
        });

        FakeHypervisor { path, state }
    }

    pub fn channel(&self) -> ControlChannel {
        ControlChannel {
            name: "control".to_owned(),
            kind: ChannelKind::Structured,
            address: ControlAddress::Unix(self.path.clone()),
        }
    }

    pub fn caps(&self) -> BTreeMap<String, bool> {
        self.state.lock().unwrap().caps.clone()
    }

    pub fn params(&self) -> BTreeMap<String, Value> {
        self.state.lock().unwrap().params.clone()
    }

    pub fn guest(&self) -> String {
        self.state.lock().unwrap().guest.clone()
    }

    pub fn migrate_uris(&self) -> Vec<String> {
        self.state.lock().unwrap().migrate_uris.clone()
    }

    pub fn incoming_uris(&self) -> Vec<String> {
        self.state.lock().unwrap().incoming_uris.clone()
    }

    pub fn set_fail_incoming(&self) {
        self.state.lock().unwrap().fail_incoming = true;
    }
}

async fn serve(
    mut stream: UnixStream,
    state: Arc<Mutex<FakeHypervisorState>>,
) -> std::io::Result<()> {
    let (read, mut write) = stream.split();
    let mut lines = BufReader::new(read).lines();

    send(&mut write, &json!({ "QMP": { "version": {}, "capabilities": [] } }))
        .await?;

    while let Some(line) = lines.next_line().await? {
        let request: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let command = request
            .get("execute")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let args = request.get("arguments").cloned().unwrap_or(json!({}));

        let reply = handle(&command, &args, &state);
        send(&mut write, &attach_id(reply, id)).await?;
    }

    Ok(())
}

fn attach_id(mut reply: Value, id: Value) -> Value {
    reply["id"] = id;
    reply
}

fn handle(
    command: &str,
    args: &Value,
    state: &Arc<Mutex<FakeHypervisorState>>,
) -> Value {
    let mut s = state.lock().unwrap();
    match command {
        "qmp_capabilities" | "migrate-continue" => json!({ "return": {} }),
        "query-commands" => {
            let names = [
                "qmp_capabilities",
                "query-commands",
                "query-status",
                "query-migrate",
                "query-migrate-capabilities",
                "query-migrate-parameters",
                "migrate",
                "migrate-incoming",
                "migrate_cancel",
                "migrate-continue",
                "migrate-set-capabilities",
                "migrate-set-parameters",
                "stop",
                "cont",
            ];
            let list: Vec<Value> =
                names.iter().map(|n| json!({ "name": n })).collect();
            json!({ "return": list })
        }
        "query-migrate" => {
            let status = if s.statuses.len() > 1 {
                s.statuses.pop_front().unwrap()
            } else {
                s.statuses.front().cloned().unwrap_or_default()
            };
            if status == "completed" {
                s.guest = "postmigrate".to_owned();
            }
            if status.is_empty() || status == "none" {
                json!({ "return": {} })
            } else {
                json!({ "return": {
                    "status": status,
                    "ram": {
                        "transferred": 1_048_576u64,
                        "remaining": 2_097_152u64,
                        "total": 3_145_728u64,
                    },
                } })
            }
        }
        "migrate" => {
            let uri = args
                .get("uri")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            s.migrate_uris.push(uri);
            json!({ "return": {} })
        }
        "migrate-incoming" => {
            if s.fail_incoming {
                json!({ "error": {
                    "class": "GenericError",
                    "desc": "Failed to bind socket",
                } })
            } else {
                let uri = args
                    .get("uri")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                s.incoming_uris.push(uri);
                json!({ "return": {} })
            }
        }
        "migrate_cancel" => {
            let too_late = matches!(
                s.statuses.front().map(String::as_str),
                Some("completed") | Some("failed") | Some("none") | None
            );
            if !too_late {
                s.statuses = VecDeque::from(["cancelled".to_owned()]);
            }
            json!({ "return": {} })
        }
        "migrate-set-capabilities" => {
            if let Some(list) =
                args.get("capabilities").and_then(Value::as_array)
            {
                for entry in list {
                    if let (Some(name), Some(enable)) = (
                        entry.get("capability").and_then(Value::as_str),
                        entry.get("state").and_then(Value::as_bool),
                    ) {
                        s.caps.insert(name.to_owned(), enable);
                    }
                }
            }
            json!({ "return": {} })
        }
        "query-migrate-capabilities" => {
            let list: Vec<Value> = s
                .caps
                .iter()
                .map(|(name, state)| {
                    json!({ "capability": name, "state": state })
                })
                .collect();
            json!({ "return": list })
        }
        "migrate-set-parameters" => {
            if let Some(map) = args.as_object() {
                for (name, value) in map {
                    s.params.insert(name.clone(), value.clone());
                }
            }
            json!({ "return": {} })
        }
        "query-migrate-parameters" => {
            json!({ "return": Value::Object(
                s.params.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            ) })
        }
        "stop" => {
            s.guest = "paused".to_owned();
            json!({ "return": {} })
        }
        "cont" => {
            s.guest = "running".to_owned();
            json!({ "return": {} })
        }
        "query-status" => {
            json!({ "return": {
                "status": s.guest,
                "running": s.guest == "running",
            } })
        }
        _ => json!({ "error": {
            "class": "CommandNotFound",
            "desc": format!("The command {command} has not been found"),
        } }),
    }
}

async fn send<W: AsyncWriteExt + Unpin>(
    write: &mut W,
    value: &Value,
) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(value).unwrap();
    bytes.push(b'\n');
    write.write_all(&bytes).await
}

#[derive(Clone)]
pub struct ProcFlags {
    pub running: Arc<AtomicBool>,
    pub destroyed: Arc<AtomicBool>,
}

struct FakeProcess {
    flags: ProcFlags,
}

impl InstanceProcess for FakeProcess {
    fn pid(&self) -> u32 {
        4242
    }

    fn is_running(&self) -> bool {
        self.flags.running.load(Ordering::Acquire)
    }

    fn destroy(&self) -> anyhow::Result<()> {
        self.flags.running.store(false, Ordering::Release);
        self.flags.destroyed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Records every launch. A migrating instance keeps its id on both hosts,
/// so launches for one id accumulate in order: the source's process first,
/// then the destination's incoming one.
#[derive(Default)]
pub struct FakeLauncher {
    procs: Mutex<HashMap<Uuid, Vec<ProcFlags>>>,
    pub incoming: Mutex<Vec<String>>,
}

impl FakeLauncher {
    /// The first process launched for this id.
    pub fn flags(&self, id: Uuid) -> Option<ProcFlags> {
        self.procs
            .lock()
            .unwrap()
            .get(&id)
            .and_then(|launches| launches.first())
            .cloned()
    }

    /// The most recent process launched for this id.
    pub fn last_flags(&self, id: Uuid) -> Option<ProcFlags> {
        self.procs
            .lock()
            .unwrap()
            .get(&id)
            .and_then(|launches| launches.last())
            .cloned()
    }
}

#[async_trait::async_trait]
impl InstanceLauncher for FakeLauncher {
    async fn launch(
        &self,
        spec: &InstanceSpec,
        incoming: Option<&IncomingDescriptor>,
    ) -> anyhow::Result<Box<dyn InstanceProcess>> {
        let flags = ProcFlags {
            running: Arc::new(AtomicBool::new(true)),
            destroyed: Arc::new(AtomicBool::new(false)),
        };
        self.procs
            .lock()
            .unwrap()
            .entry(spec.id)
            .or_default()
            .push(flags.clone());
        if let Some(incoming) = incoming {
            self.incoming.lock().unwrap().push(incoming.uri());
        }
        Ok(Box::new(FakeProcess { flags }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GuestMode {
    /// Shutdown requests stop the instance process.
    Cooperative,
    /// Shutdown requests succeed but nothing happens in the guest.
    Inert,
}

pub struct FakeGuest {
    launcher: Arc<FakeLauncher>,
    pub mode: Mutex<GuestMode>,
}

impl FakeGuest {
    pub fn new(launcher: Arc<FakeLauncher>) -> Self {
        FakeGuest { launcher, mode: Mutex::new(GuestMode::Cooperative) }
    }

    pub fn set_mode(&self, mode: GuestMode) {
        *self.mode.lock().unwrap() = mode;
    }
}

#[async_trait::async_trait]
impl GuestChannel for FakeGuest {
    async fn shutdown(
        &self,
        instance: Uuid,
        _credentials: Option<&GuestCredentials>,
    ) -> anyhow::Result<()> {
        if *self.mode.lock().unwrap() == GuestMode::Cooperative {
            if let Some(flags) = self.launcher.flags(instance) {
                flags.running.store(false, Ordering::Release);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingStorage {
    pub events: Mutex<Vec<String>>,
}

impl RecordingStorage {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl StorageMirror for RecordingStorage {
    async fn start_transfer_listener(
        &self,
        migration: Uuid,
        disks: &std::collections::BTreeSet<String>,
        _descriptor: &IncomingDescriptor,
    ) -> anyhow::Result<()> {
        self.record(format!("listener-start:{migration}:{disks:?}"));
        Ok(())
    }

    async fn stop_transfer_listener(
        &self,
        migration: Uuid,
    ) -> anyhow::Result<()> {
        self.record(format!("listener-stop:{migration}"));
        Ok(())
    }

    async fn start_copy(
        &self,
        migration: Uuid,
        disks: &std::collections::BTreeSet<String>,
        _destination: &IncomingDescriptor,
    ) -> anyhow::Result<()> {
        self.record(format!("copy-start:{migration}:{disks:?}"));
        Ok(())
    }

    async fn cancel_copy(
        &self,
        migration: Uuid,
        disks: &std::collections::BTreeSet<String>,
    ) -> anyhow::Result<()> {
        self.record(format!("copy-cancel:{migration}:{disks:?}"));
        Ok(())
    }
}

pub struct TestHarness {
    pub ctx: Arc<AgentContext>,
    pub launcher: Arc<FakeLauncher>,
    pub storage: Arc<RecordingStorage>,
    pub guest: Arc<FakeGuest>,
}

/// Builds an agent context over the in-memory collaborators with budgets
/// sized for tests.
pub fn harness(socket_dir: &Path) -> TestHarness {
    let mut config = AgentConfig::default();
    config.migration.poll_interval_ms = 25;
    config.migration.stop_timeout_secs = 1;
    config.migration.listen_ip = "127.0.0.1".parse().unwrap();
    config.migration.socket_dir = socket_dir.to_owned();

    let launcher = Arc::new(FakeLauncher::default());
    let storage = Arc::new(RecordingStorage::default());
    let guest = Arc::new(FakeGuest::new(launcher.clone()));
    let ctx = Arc::new(AgentContext::new(
        test_logger(),
        config,
        launcher.clone(),
        storage.clone(),
        guest.clone(),
    ));

    TestHarness { ctx, launcher, storage, guest }
}

pub fn instance_spec(channel: ControlChannel) -> InstanceSpec {
    InstanceSpec {
        id: Uuid::new_v4(),
        name: "test-instance".to_owned(),
        channels: vec![channel],
    }
}

/// An in-process stand-in for the host-to-host RPC transport: prepare and
/// finish run against a destination handler in this same process, with
/// channel addresses rewritten to the destination fake's socket.
pub struct LoopbackGateway {
    handler: DestinationHandler,
    channels: Vec<ControlChannel>,
    pub prepared: tokio::sync::Mutex<HashMap<Uuid, PreparedDestination>>,
}

impl LoopbackGateway {
    pub fn new(
        ctx: Arc<AgentContext>,
        channels: Vec<ControlChannel>,
    ) -> Self {
        LoopbackGateway {
            handler: DestinationHandler::new(ctx),
            channels,
            prepared: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn take(&self, id: Uuid) -> Option<PreparedDestination> {
        self.prepared.lock().await.remove(&id)
    }
}

#[async_trait::async_trait]
impl DestinationGateway for LoopbackGateway {
    async fn prepare(
        &self,
        migration_id: Uuid,
        mut spec: InstanceSpec,
        params: MigrationParameters,
    ) -> Result<IncomingDescriptor, apiary_agent::migrate::MigrateError>
    {
        spec.channels = self.channels.clone();
        let prepared =
            self.handler.prepare(migration_id, spec, params).await?;
        let descriptor = prepared.descriptor.clone();
        self.prepared.lock().await.insert(migration_id, prepared);
        Ok(descriptor)
    }

    async fn finish(
        &self,
        migration_id: Uuid,
        source_succeeded: bool,
    ) -> Result<FinishOutcome, apiary_agent::migrate::MigrateError> {
        let mut prepared = self.prepared.lock().await;
        let entry = prepared.get_mut(&migration_id).ok_or(
            apiary_agent::migrate::MigrateError::UnknownMigration(
                migration_id,
            ),
        )?;
        self.handler.finish(entry, source_succeeded).await
    }
}
