// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for types shared by the migration agent, the monitor client,
//! and remote callers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Coarse lifecycle state of an instance, as tracked by the agent.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
    strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum InstanceState {
    /// The instance is known to the agent but has no running process.
    Defined,
    Running,
    Paused,
    Stopped,
    /// The instance's bookkeeping has been released; only the id remains.
    Undefined,
}

/// Phase of a migration task. Phases move strictly forward; `Error` is the
/// only sink and is entered from any phase.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
    strum::Display,
)]
pub enum MigrationPhase {
    Accepted,
    PreMigrating,
    Migrating,
    PostMigrating,
    Completed,
    Error,
}

impl MigrationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Completed | MigrationPhase::Error)
    }
}

/// Abstract migration behavior toggles requested by the operator. Flags that
/// correspond to hypervisor capabilities are folded into the capability map
/// before transfer starts.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationFlag {
    Live,
    Offline,
    NonSharedDisk,
    AutoConverge,
    Postcopy,
}

/// The transport protocols an incoming migration can listen on.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Rdma,
    Unix,
    Fd,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Rdma => "rdma",
            TransportProtocol::Unix => "unix",
            TransportProtocol::Fd => "fd",
        };

        write!(f, "{}", s)
    }
}

/// Error raised when a requested transport protocol is not in the supported
/// set.
#[derive(Clone, Debug, Deserialize, Error, PartialEq, Serialize)]
#[error("unsupported transport protocol: {0}")]
pub struct UnsupportedProtocol(pub String);

impl FromStr for TransportProtocol {
    type Err = UnsupportedProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(TransportProtocol::Tcp),
            // The RDMA transport shipped as experimental first; accept both
            // spellings and canonicalize to the stable one.
            "rdma" | "x-rdma" => Ok(TransportProtocol::Rdma),
            "unix" => Ok(TransportProtocol::Unix),
            "fd" => Ok(TransportProtocol::Fd),
            _ => Err(UnsupportedProtocol(s.to_owned())),
        }
    }
}

/// The transport an operator asks a migration to use. Address and port may be
/// left unset, in which case the destination host picks them while preparing.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MigrationUri {
    pub protocol: TransportProtocol,
    pub address: Option<String>,
    pub port: Option<u16>,
}

/// The resolved listen point a destination host stood up for an incoming
/// migration. For `unix`, `address` holds the socket path; for `fd`, the
/// file-descriptor name.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IncomingDescriptor {
    pub protocol: TransportProtocol,
    pub address: Option<String>,
    pub port: Option<u16>,
}

impl IncomingDescriptor {
    /// Renders the descriptor in the hypervisor's migration URI syntax.
    pub fn uri(&self) -> String {
        let address = self.address.as_deref().unwrap_or_default();
        match self.protocol {
            TransportProtocol::Tcp | TransportProtocol::Rdma => format!(
                "{}:{}:{}",
                self.protocol,
                address,
                self.port.unwrap_or_default()
            ),
            TransportProtocol::Unix | TransportProtocol::Fd => {
                format!("{}:{}", self.protocol, address)
            }
        }
    }
}

/// Everything both hosts need to agree on before state transfer starts.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct MigrationParameters {
    pub flags: BTreeSet<MigrationFlag>,
    pub uri: MigrationUri,
    /// Abstract capability name -> desired toggle, applied on both ends.
    pub capabilities: BTreeMap<String, bool>,
    /// Abstract tunable name -> desired value, applied on both ends.
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Disk identifiers to copy; non-empty only for non-shared-disk
    /// migration.
    pub migrate_disks: BTreeSet<String>,
}

impl Default for MigrationUri {
    fn default() -> Self {
        MigrationUri {
            protocol: TransportProtocol::Tcp,
            address: None,
            port: None,
        }
    }
}

impl MigrationParameters {
    pub fn wants_storage(&self) -> bool {
        self.flags.contains(&MigrationFlag::NonSharedDisk)
    }
}

/// Memory-transfer progress counters. These regularly exceed the 32-bit
/// signed range on large guests, so they are 64-bit end to end.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct RamProgress {
    pub transferred: u64,
    pub remaining: u64,
    pub total: u64,
}

/// A migration status report, preserved verbatim from the hypervisor for
/// operator diagnostics.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub status: String,
    pub ram: Option<RamProgress>,
}

impl MigrationStatus {
    pub fn idle() -> Self {
        MigrationStatus { status: "none".to_owned(), ram: None }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_str(),
            "none" | "completed" | "failed" | "cancelled"
        )
    }

    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == "cancelled"
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ram {
            Some(ram) => write!(
                f,
                "{} ({}/{} bytes remaining)",
                self.status, ram.remaining, ram.total
            ),
            None => write!(f, "{}", self.status),
        }
    }
}

/// The guest run state reported by the hypervisor itself (as opposed to the
/// agent's own lifecycle bookkeeping).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GuestRunState {
    pub status: String,
    pub running: bool,
}

impl GuestRunState {
    pub fn is_paused(&self) -> bool {
        self.status == "paused"
    }

    /// Whether the guest's state stream has fully left this host. The
    /// hypervisor parks an outmigrated guest in `postmigrate` until it is
    /// torn down.
    pub fn handoff_complete(&self) -> bool {
        self.status == "postmigrate" || !self.running
    }
}

/// The error payload a structured monitor returns when it rejects a command.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RemoteErrorPayload {
    pub class: String,
    pub desc: String,
}

impl fmt::Display for RemoteErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.desc)
    }
}

/// Which wire protocol a control channel speaks.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Line-oriented, prompt-delimited text protocol.
    Human,
    /// Newline-delimited JSON with correlation ids and asynchronous events.
    Structured,
}

/// Where a control channel's socket lives.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "value")]
pub enum ControlAddress {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl fmt::Display for ControlAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            ControlAddress::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// One control channel of an instance, keyed by a logical name. The primary
/// channel every instance carries is named `"control"`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ControlChannel {
    pub name: String,
    pub kind: ChannelKind,
    pub address: ControlAddress,
}

/// The description a destination host needs to stand up an instance of its
/// own: identity plus the control channels to dial once the process is up.
/// Device inventory and launch arguments live below this layer.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstanceSpec {
    pub id: Uuid,
    pub name: String,
    pub channels: Vec<ControlChannel>,
}

/// What the destination reports back from the finish phase.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FinishOutcome {
    pub success: bool,
    pub diagnostics: Option<MigrationStatus>,
}
