use crate::fetch::FetchParams;
use crate::pool::JoinLimits;
use crate::populate::{value_size, PopulateParams};
use anyhow::{anyhow, bail};
use clap::Parser;
use core::time::Duration;

pub const CONFIG_FILE: &str = "slow-reader.toml";
const ENV_PREFIX: &str = "SLOW_READER";

/// Positional invocation parameters.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "slow-reader",
    version,
    about = "Fills a Redis-protocol store with growing values, then reads them back through deliberately stalled connections"
)]
pub struct CliArgs {
    /// Store host name or address.
    #[arg(value_name = "host")]
    pub host: String,

    /// Store port.
    #[arg(value_name = "port")]
    pub port: u16,

    /// Connections (and workers) per stage.
    #[arg(value_name = "numConnections")]
    pub num_connections: usize,

    /// Value size of the first key, in MiB.
    #[arg(value_name = "initialKeySizeMB")]
    pub initial_key_size_mb: u64,

    /// Size added for each further key, in MiB.
    #[arg(value_name = "deltaMB")]
    pub delta_mb: u64,

    /// How long each fetch connection withholds reading. Negative means no
    /// stall at all.
    #[arg(value_name = "sleepTimeSeconds", allow_negative_numbers = true)]
    pub sleep_time_seconds: i64,

    /// `true` skips the initial FLUSHALL. Anything else flushes.
    #[arg(value_name = "noflush", action = clap::ArgAction::Set, value_parser = parse_toggle)]
    pub noflush: bool,

    /// `true` uses TLS without certificate verification (diagnostic only).
    #[arg(
        value_name = "useTLS",
        action = clap::ArgAction::Set,
        value_parser = parse_toggle,
        default_value = "false"
    )]
    pub use_tls: bool,
}

/// `true` in any ASCII case is on, every other value is off.
fn parse_toggle(value: &str) -> Result<bool, String> {
    Ok(value.eq_ignore_ascii_case("true"))
}

/// Tunables read from `slow-reader.toml` and `SLOW_READER_*` variables.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub runtime_threads: usize,
    pub join_timeout_secs: u64,
    pub cancel_grace_ms: u64,
    pub stall_tick_ms: u64,
}

impl Settings {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let settings: Self = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        if settings.runtime_threads == 0 {
            bail!("runtime_threads must be greater than 0");
        }
        if settings.stall_tick_ms == 0 {
            bail!("stall_tick_ms must be greater than 0");
        }
        Ok(settings)
    }

    pub const fn limits(&self) -> JoinLimits {
        JoinLimits {
            deadline: Duration::from_secs(self.join_timeout_secs),
            grace: Duration::from_millis(self.cancel_grace_ms),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            runtime_threads: num_cpus::get(),
            join_timeout_secs: 60,
            cancel_grace_ms: 1_000,
            stall_tick_ms: 100,
        }
    }
}

/// Everything one run needs.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub host: String,
    pub port: u16,
    pub connection_count: usize,
    pub initial_size_mb: u64,
    pub delta_mb: u64,
    pub stall_seconds: u64,
    pub noflush: bool,
    pub secure: bool,
    pub settings: Settings,
}

impl RunConfig {
    pub fn populate_params(&self) -> PopulateParams {
        PopulateParams {
            connection_count: self.connection_count,
            initial_size_mb: self.initial_size_mb,
            delta_mb: self.delta_mb,
            limits: self.settings.limits(),
        }
    }

    pub fn fetch_params(&self) -> FetchParams {
        FetchParams {
            host: self.host.clone(),
            port: self.port,
            connection_count: self.connection_count,
            stall_seconds: self.stall_seconds,
            secure: self.secure,
            stall_tick: Duration::from_millis(self.settings.stall_tick_ms),
            limits: self.settings.limits(),
        }
    }
}

impl TryFrom<(CliArgs, Settings)> for RunConfig {
    type Error = anyhow::Error;

    fn try_from((args, settings): (CliArgs, Settings)) -> Result<Self, Self::Error> {
        if let Some(last) = args.num_connections.checked_sub(1) {
            value_size(args.initial_key_size_mb, args.delta_mb, last).ok_or_else(|| {
                anyhow!(
                    "Value size of key_{} overflows ({} MiB + {} x {} MiB)",
                    args.num_connections,
                    args.initial_key_size_mb,
                    last,
                    args.delta_mb
                )
            })?;
        }

        Ok(Self {
            host: args.host,
            port: args.port,
            connection_count: args.num_connections,
            initial_size_mb: args.initial_key_size_mb,
            delta_mb: args.delta_mb,
            stall_seconds: u64::try_from(args.sleep_time_seconds).unwrap_or(0),
            noflush: args.noflush,
            secure: args.use_tls,
            settings,
        })
    }
}
