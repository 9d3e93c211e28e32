// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The human (line/prompt) protocol variant.
//!
//! Commands are single text lines; a response is everything the monitor
//! prints up to its next prompt, minus the echo of the command itself.
//! There is no correlation id and no event stream; response boundaries are
//! detected purely by the prompt.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use apiary_api_types::ControlAddress;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use slog::{debug, trace, Logger};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;

use crate::codec::PromptCodec;
use crate::conn::{self, Conn};
use crate::{Memoized, MonitorError, MonitorTimeouts};

type Transport = Framed<Conn, PromptCodec>;

pub struct HumanMonitor {
    io: Mutex<Option<Transport>>,
    dead: AtomicBool,
    timeouts: MonitorTimeouts,
    log: Logger,
    pub(crate) memo: Memoized,
    banner: String,
}

impl HumanMonitor {
    /// Dials the channel and consumes the banner up to the first prompt.
    pub(crate) async fn connect(
        address: &ControlAddress,
        timeouts: MonitorTimeouts,
        log: Logger,
    ) -> Result<Self, MonitorError> {
        let stream = conn::dial(address, timeouts.connect).await?;
        let mut framed = Framed::new(stream, PromptCodec);

        let banner = tokio::time::timeout(timeouts.command, framed.next())
            .await
            .map_err(|_| {
                MonitorError::Protocol(
                    "no prompt within the command budget".to_owned(),
                )
            })?
            .ok_or_else(|| {
                MonitorError::Protocol(
                    "connection closed before the first prompt".to_owned(),
                )
            })??;

        debug!(log, "human monitor ready"; "banner" => banner.trim());
        Ok(HumanMonitor {
            io: Mutex::new(Some(framed)),
            dead: AtomicBool::new(false),
            timeouts,
            log,
            memo: Memoized::default(),
            banner,
        })
    }

    /// The text the monitor printed before its first prompt.
    pub fn banner(&self) -> &str {
        &self.banner
    }

    pub(crate) async fn execute(
        &self,
        command: &str,
        args: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, MonitorError> {
        if args.is_some() {
            return Err(MonitorError::Protocol(
                "human monitor commands carry their arguments inline"
                    .to_owned(),
            ));
        }
        if self.dead.load(Ordering::Acquire) {
            return Err(MonitorError::Closed);
        }

        let timeout = timeout.unwrap_or(self.timeouts.command);
        let mut guard =
            tokio::time::timeout(self.timeouts.lock, self.io.lock())
                .await
                .map_err(|_| MonitorError::LockTimeout)?;
        let Some(framed) = guard.as_mut() else {
            return Err(MonitorError::Closed);
        };

        trace!(self.log, "executing human command"; "command" => command);
        let result = Self::roundtrip(framed, command, timeout).await;
        if matches!(result, Err(MonitorError::Socket(_))) {
            self.dead.store(true, Ordering::Release);
            *guard = None;
        }

        result.map(Value::String)
    }

    async fn roundtrip(
        framed: &mut Transport,
        command: &str,
        timeout: Duration,
    ) -> Result<String, MonitorError> {
        let exchange = async {
            framed.send(command.to_owned()).await?;
            match framed.next().await {
                None => Err(MonitorError::Socket(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "monitor closed the connection before the prompt",
                ))),
                Some(Err(e)) => Err(e),
                Some(Ok(output)) => Ok(strip_echo(&output, command)),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(MonitorError::CommandTimeout {
                command: command.to_owned(),
                timeout,
            }),
        }
    }

    pub(crate) async fn close(&self) {
        self.dead.store(true, Ordering::Release);
        let mut guard = self.io.lock().await;
        *guard = None;
    }

    pub(crate) async fn fetch_commands(
        &self,
    ) -> Result<HashSet<String>, MonitorError> {
        let output = self.execute("help", None, None).await?;
        let text = output.as_str().unwrap_or_default();
        Ok(parse_help(text))
    }

    pub(crate) async fn fetch_capability_names(
        &self,
    ) -> Result<HashSet<String>, MonitorError> {
        let output =
            self.execute("info migrate_capabilities", None, None).await?;
        let text = output.as_str().unwrap_or_default();
        Ok(parse_name_value_lines(text).into_iter().map(|(k, _)| k).collect())
    }

    pub(crate) async fn fetch_parameter_names(
        &self,
    ) -> Result<HashSet<String>, MonitorError> {
        let output =
            self.execute("info migrate_parameters", None, None).await?;
        let text = output.as_str().unwrap_or_default();
        Ok(parse_name_value_lines(text).into_iter().map(|(k, _)| k).collect())
    }
}

/// The monitor echoes the command line before printing its output; the
/// caller only wants the output.
fn strip_echo(output: &str, command: &str) -> String {
    let body = output
        .strip_prefix(command)
        .map(|rest| rest.trim_start_matches(['\r', '\n']))
        .unwrap_or(output);
    body.trim_end().to_owned()
}

/// Pulls command names out of `help` output. Each command starts a line;
/// continuation/description lines are indented. Aliased entries look like
/// `info|i` and resolve to their long spelling.
fn parse_help(text: &str) -> HashSet<String> {
    text.lines()
        .filter(|line| !line.is_empty() && !line.starts_with(char::is_whitespace))
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|token| token.split('|').next())
        .map(str::to_owned)
        .collect()
}

/// Parses `name: value` report lines, as printed by the `info`
/// subcommands.
pub(crate) fn parse_name_value_lines(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() || name.contains(' ') {
                return None;
            }
            Some((name.to_owned(), value.trim().to_owned()))
        })
        .collect()
}
