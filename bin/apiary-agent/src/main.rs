// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use apiary_agent::config::AgentConfig;
use apiary_api_types::{
    ChannelKind, ControlAddress, ControlChannel, TransportProtocol,
};
use apiary_monitor::Monitor;
use clap::{Parser, Subcommand};
use slog::{info, Logger};

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Operator tooling for instances and their live migrations
struct Opt {
    /// Path to an agent config TOML; defaults apply when omitted
    #[clap(long, action)]
    config: Option<PathBuf>,

    /// Use the human (line/prompt) monitor protocol instead of the
    /// structured one
    #[clap(long, action)]
    human: bool,

    /// Logging level
    #[clap(long, default_value_t = slog::Level::Info, value_parser = parse_log_level)]
    log_level: slog::Level,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one raw command over an instance's control socket
    Monitor {
        /// Control socket (`unix:/path`, `tcp:IP:PORT`, or a bare path)
        #[clap(action)]
        endpoint: String,

        /// The command to execute
        #[clap(action)]
        command: String,

        /// JSON arguments (structured protocol only)
        #[clap(long, action)]
        args: Option<String>,
    },

    /// Show migration and guest status for an instance
    Status {
        /// Control socket (`unix:/path`, `tcp:IP:PORT`, or a bare path)
        #[clap(action)]
        endpoint: String,
    },

    /// Start an outgoing migration and poll it to a terminal state
    Migrate {
        /// Control socket of the source instance
        #[clap(action)]
        endpoint: String,

        /// Destination migration URI (e.g. `tcp:192.0.2.7:4444`)
        #[clap(action)]
        destination: String,

        /// Overall transfer budget in seconds (config default when unset)
        #[clap(long, action)]
        timeout_secs: Option<u64>,
    },
}

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow!("Invalid log level"))
}

fn parse_endpoint(s: &str) -> anyhow::Result<ControlAddress> {
    if let Some(path) = s.strip_prefix("unix:") {
        return Ok(ControlAddress::Unix(PathBuf::from(path)));
    }
    if let Some(addr) = s.strip_prefix("tcp:") {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid TCP endpoint {addr:?}"))?;
        return Ok(ControlAddress::Tcp(addr));
    }
    Ok(ControlAddress::Unix(PathBuf::from(s)))
}

fn build_logger(level: slog::Level) -> Logger {
    use slog::Drain;

    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("apiary-agent", std::io::stdout())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered = slog::LevelFilter::new(main_drain, level).fuse();
    Logger::root(filtered, slog::o!())
}

async fn connect(
    endpoint: &str,
    human: bool,
    config: &AgentConfig,
    log: &Logger,
) -> anyhow::Result<Monitor> {
    let channel = ControlChannel {
        name: "control".to_owned(),
        kind: if human {
            ChannelKind::Human
        } else {
            ChannelKind::Structured
        },
        address: parse_endpoint(endpoint)?,
    };
    Monitor::connect(&channel, config.monitor.timeouts(), log)
        .await
        .with_context(|| format!("connecting to {endpoint}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let log = build_logger(opt.log_level);

    let config = match &opt.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };

    match opt.cmd {
        Command::Monitor { endpoint, command, args } => {
            let monitor =
                connect(&endpoint, opt.human, &config, &log).await?;
            let args = args
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("parsing --args as JSON")?;
            let ret = monitor.execute(&command, args, None).await?;
            println!("{}", serde_json::to_string_pretty(&ret)?);
            monitor.close().await;
        }
        Command::Status { endpoint } => {
            let monitor =
                connect(&endpoint, opt.human, &config, &log).await?;
            let migration = monitor.migration_status().await?;
            let guest = monitor.query_status().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "migration": migration,
                    "guest": guest,
                }))?
            );
            monitor.close().await;
        }
        Command::Migrate { endpoint, destination, timeout_secs } => {
            let (protocol, _) =
                destination.split_once(':').ok_or_else(|| {
                    anyhow!("destination must look like protocol:address")
                })?;
            let _: TransportProtocol = protocol.parse()?;

            let monitor =
                connect(&endpoint, opt.human, &config, &log).await?;
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.migration.timeout());
            let poll = config.migration.poll_interval();

            monitor.migrate(&destination, true).await?;
            info!(log, "transfer started"; "destination" => &destination);

            let deadline = tokio::time::Instant::now() + timeout;
            let outcome = loop {
                let status = monitor.migration_status().await?;
                info!(log, "transfer status"; "status" => %status);
                if status.is_terminal() {
                    break status;
                }
                if status.status == "pre-switchover" {
                    monitor.migrate_continue().await?;
                }
                if tokio::time::Instant::now() >= deadline {
                    monitor.close().await;
                    return Err(anyhow!(
                        "no terminal status within {} seconds",
                        timeout.as_secs()
                    ));
                }
                tokio::time::sleep(poll).await;
            };
            monitor.close().await;

            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.is_completed() {
                return Err(anyhow!("migration ended as {}", outcome.status));
            }
        }
    }

    Ok(())
}
