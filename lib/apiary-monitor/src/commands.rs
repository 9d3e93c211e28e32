// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The typed command surface both protocol variants expose.
//!
//! Callers above this layer never format wire commands themselves; each
//! operation renders the variant-appropriate request and parses the
//! variant-appropriate response into the shared API types.

use std::collections::BTreeMap;

use apiary_api_types::{GuestRunState, MigrationStatus, RamProgress};
use serde_json::{json, Value};

use crate::{Monitor, MonitorError};

impl Monitor {
    /// Starts an outgoing migration toward `uri`. `detach` returns control
    /// immediately so the caller can poll for progress.
    pub async fn migrate(
        &self,
        uri: &str,
        detach: bool,
    ) -> Result<(), MonitorError> {
        match self {
            Monitor::Human(_) => {
                let flag = if detach { "-d " } else { "" };
                self.execute(&format!("migrate {flag}{uri}"), None, None)
                    .await?;
            }
            Monitor::Structured(_) => {
                self.execute("migrate", Some(json!({ "uri": uri })), None)
                    .await?;
            }
        }
        Ok(())
    }

    /// Tells an instance launched in incoming mode to start listening for
    /// the state stream on `uri`.
    pub async fn migrate_incoming(
        &self,
        uri: &str,
    ) -> Result<(), MonitorError> {
        match self {
            Monitor::Human(_) => {
                self.execute(&format!("migrate_incoming {uri}"), None, None)
                    .await?;
            }
            Monitor::Structured(_) => {
                self.execute(
                    "migrate-incoming",
                    Some(json!({ "uri": uri })),
                    None,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Asks the hypervisor to abort the migration in flight. The abort is
    /// asynchronous; callers poll [`Monitor::migration_status`] to see it
    /// land.
    pub async fn migrate_cancel(&self) -> Result<(), MonitorError> {
        self.execute("migrate_cancel", None, None).await.map(drop)
    }

    /// Releases a migration paused at the pre-switchover milestone.
    pub async fn migrate_continue(&self) -> Result<(), MonitorError> {
        match self {
            Monitor::Human(_) => self
                .execute("migrate_continue pre-switchover", None, None)
                .await
                .map(drop),
            Monitor::Structured(_) => self
                .execute(
                    "migrate-continue",
                    Some(json!({ "state": "pre-switchover" })),
                    None,
                )
                .await
                .map(drop),
        }
    }

    /// Queries migration progress. An idle monitor reports status `none`.
    pub async fn migration_status(
        &self,
    ) -> Result<MigrationStatus, MonitorError> {
        match self {
            Monitor::Human(_) => {
                let output =
                    self.execute("info migrate", None, None).await?;
                Ok(parse_info_migrate(
                    output.as_str().unwrap_or_default(),
                ))
            }
            Monitor::Structured(_) => {
                let ret = self.execute("query-migrate", None, None).await?;
                Ok(parse_query_migrate(&ret))
            }
        }
    }

    /// Queries the guest run state as the hypervisor reports it.
    pub async fn query_status(
        &self,
    ) -> Result<GuestRunState, MonitorError> {
        match self {
            Monitor::Human(_) => {
                let output =
                    self.execute("info status", None, None).await?;
                parse_info_status(output.as_str().unwrap_or_default())
            }
            Monitor::Structured(_) => {
                let ret = self.execute("query-status", None, None).await?;
                let status = ret
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_owned();
                let running = ret
                    .get("running")
                    .and_then(Value::as_bool)
                    .unwrap_or(status == "running");
                Ok(GuestRunState { status, running })
            }
        }
    }

    /// Pauses guest execution (`stop` in monitor terms).
    pub async fn pause_guest(&self) -> Result<(), MonitorError> {
        self.execute("stop", None, None).await.map(drop)
    }

    /// Resumes guest execution (`cont` in monitor terms).
    pub async fn resume_guest(&self) -> Result<(), MonitorError> {
        self.execute("cont", None, None).await.map(drop)
    }

    /// Reads back the current migration capability toggles.
    pub async fn migrate_capabilities(
        &self,
    ) -> Result<BTreeMap<String, bool>, MonitorError> {
        match self {
            Monitor::Human(_) => {
                let output = self
                    .execute("info migrate_capabilities", None, None)
                    .await?;
                Ok(crate::human::parse_name_value_lines(
                    output.as_str().unwrap_or_default(),
                )
                .into_iter()
                .map(|(name, value)| (name, value == "on"))
                .collect())
            }
            Monitor::Structured(_) => {
                let ret = self
                    .execute("query-migrate-capabilities", None, None)
                    .await?;
                let caps = ret
                    .as_array()
                    .map(|list| {
                        list.iter()
                            .filter_map(|c| {
                                let name = c
                                    .get("capability")
                                    .and_then(Value::as_str)?;
                                let state = c
                                    .get("state")
                                    .and_then(Value::as_bool)?;
                                Some((name.to_owned(), state))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(caps)
            }
        }
    }

    /// Applies migration capability toggles. A no-op for an empty map.
    pub async fn set_migrate_capabilities(
        &self,
        capabilities: &BTreeMap<String, bool>,
    ) -> Result<(), MonitorError> {
        if capabilities.is_empty() {
            return Ok(());
        }

        match self {
            Monitor::Human(_) => {
                for (name, state) in capabilities {
                    let state = if *state { "on" } else { "off" };
                    self.execute(
                        &format!("migrate_set_capability {name} {state}"),
                        None,
                        None,
                    )
                    .await?;
                }
                Ok(())
            }
            Monitor::Structured(_) => {
                let command =
                    self.resolve_command("migrate-set-capabilities").await?;
                let list: Vec<Value> = capabilities
                    .iter()
                    .map(|(name, state)| {
                        json!({ "capability": name, "state": state })
                    })
                    .collect();
                self.execute(
                    &command,
                    Some(json!({ "capabilities": list })),
                    None,
                )
                .await
                .map(drop)
            }
        }
    }

    /// Reads back the current migration tunables.
    pub async fn migrate_parameters(
        &self,
    ) -> Result<BTreeMap<String, Value>, MonitorError> {
        match self {
            Monitor::Human(_) => {
                let output = self
                    .execute("info migrate_parameters", None, None)
                    .await?;
                Ok(crate::human::parse_name_value_lines(
                    output.as_str().unwrap_or_default(),
                )
                .into_iter()
                .map(|(name, value)| (name, Value::String(value)))
                .collect())
            }
            Monitor::Structured(_) => {
                let ret = self
                    .execute("query-migrate-parameters", None, None)
                    .await?;
                let params = ret
                    .as_object()
                    .map(|map| {
                        map.iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(params)
            }
        }
    }

    /// Applies migration tunables. A no-op for an empty map.
    pub async fn set_migrate_parameters(
        &self,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<(), MonitorError> {
        if parameters.is_empty() {
            return Ok(());
        }

        match self {
            Monitor::Human(_) => {
                for (name, value) in parameters {
                    self.execute(
                        &format!(
                            "migrate_set_parameter {name} {}",
                            render_human_value(value)
                        ),
                        None,
                        None,
                    )
                    .await?;
                }
                Ok(())
            }
            Monitor::Structured(_) => {
                let command =
                    self.resolve_command("migrate-set-parameters").await?;
                let args: serde_json::Map<String, Value> = parameters
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                self.execute(&command, Some(Value::Object(args)), None)
                    .await
                    .map(drop)
            }
        }
    }
}

fn render_human_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_query_migrate(ret: &Value) -> MigrationStatus {
    let status = ret
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("none")
        .to_owned();
    let ram = ret.get("ram").and_then(Value::as_object).map(|ram| {
        let field = |name: &str| {
            ram.get(name).and_then(Value::as_u64).unwrap_or_default()
        };
        RamProgress {
            transferred: field("transferred"),
            remaining: field("remaining"),
            total: field("total"),
        }
    });

    MigrationStatus { status, ram }
}

/// Parses `info migrate` output. The report opens with a status line and,
/// while a migration is running, continues with `kbytes`-denominated RAM
/// counters.
fn parse_info_migrate(text: &str) -> MigrationStatus {
    let mut status = MigrationStatus::idle();
    let mut ram = RamProgress::default();
    let mut saw_ram = false;

    for line in text.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("Migration status:") {
            status.status = value.trim().to_owned();
        } else if let Some(kbytes) = parse_kbytes(line, "transferred ram:") {
            ram.transferred = kbytes * 1024;
            saw_ram = true;
        } else if let Some(kbytes) = parse_kbytes(line, "remaining ram:") {
            ram.remaining = kbytes * 1024;
            saw_ram = true;
        } else if let Some(kbytes) = parse_kbytes(line, "total ram:") {
            ram.total = kbytes * 1024;
            saw_ram = true;
        }
    }

    if saw_ram {
        status.ram = Some(ram);
    }
    status
}

fn parse_kbytes(line: &str, prefix: &str) -> Option<u64> {
    line.strip_prefix(prefix)?
        .trim()
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// Parses `info status` output, e.g. `VM status: running` or
/// `VM status: paused (postmigrate)`.
fn parse_info_status(text: &str) -> Result<GuestRunState, MonitorError> {
    let line = text
        .lines()
        .find_map(|l| l.trim().strip_prefix("VM status:"))
        .ok_or_else(|| {
            MonitorError::Protocol(format!(
                "unrecognized info status output: {text:?}"
            ))
        })?
        .trim();

    let status = match (line.find('('), line.find(')')) {
        (Some(open), Some(close)) if open < close => {
            line[open + 1..close].to_owned()
        }
        _ => line.split_whitespace().next().unwrap_or("unknown").to_owned(),
    };

    Ok(GuestRunState { running: line.starts_with("running"), status })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_migrate_parses_counters() {
        let ret = json!({
            "status": "active",
            "ram": {
                "transferred": 8_589_934_592u64,
                "remaining": 4_294_967_296u64,
                "total": 12_884_901_888u64,
            }
        });
        let status = parse_query_migrate(&ret);
        assert_eq!(status.status, "active");
        let ram = status.ram.unwrap();
        assert_eq!(ram.transferred, 8 << 30);
        assert_eq!(ram.remaining, 4 << 30);
    }

    #[test]
    fn query_migrate_idle_is_none() {
        let status = parse_query_migrate(&json!({}));
        assert_eq!(status.status, "none");
        assert!(status.ram.is_none());
    }

    #[test]
    fn info_migrate_parses_report() {
        let text = "\
capabilities: xbzrle: off auto-converge: on\n\
Migration status: active\n\
total time: 12345 ms\n\
transferred ram: 1024 kbytes\n\
remaining ram: 2048 kbytes\n\
total ram: 4096 kbytes\n";
        let status = parse_info_migrate(text);
        assert_eq!(status.status, "active");
        let ram = status.ram.unwrap();
        assert_eq!(ram.transferred, 1024 * 1024);
        assert_eq!(ram.remaining, 2048 * 1024);
        assert_eq!(ram.total, 4096 * 1024);
    }

    #[test]
    fn info_migrate_without_migration_is_idle() {
        let status = parse_info_migrate("");
        assert_eq!(status.status, "none");
        assert!(status.ram.is_none());
    }

    #[test]
    fn info_status_variants() {
        let running = parse_info_status("VM status: running").unwrap();
        assert!(running.running);
        assert_eq!(running.status, "running");

        let parked =
            parse_info_status("VM status: paused (postmigrate)").unwrap();
        assert!(!parked.running);
        assert_eq!(parked.status, "postmigrate");
        assert!(parked.handoff_complete());
    }
}
