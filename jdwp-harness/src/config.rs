// Harness configuration
//
// Layered: defaults, then an optional JSON file (`-config=path`), then
// nsk-style `-option=value` arguments, then `--` and the debuggee command.

use crate::dispatcher::DEFAULT_EVENT_BACKLOG;
use crate::iopipe::DEFAULT_MAX_LINE_LENGTH;
use crate::process::DEFAULT_READY_SENTINEL;
use crate::protocol::{HarnessError, HarnessResult, MAX_PACKET_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,
    /// Debuggee transport port; taken from the ready sentinel when unset
    pub port: Option<u16>,
    pub max_packet_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    pub host: String,
    /// 0 binds an ephemeral port
    pub port: u16,
    pub max_line_length: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggeeConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ready_sentinel: String,
    /// The debuggee starts suspended and announces itself with VM_START
    pub suspended_start: bool,
}

impl Default for DebuggeeConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            ready_sentinel: DEFAULT_READY_SENTINEL.to_string(),
            suspended_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Base wait time in minutes; every timeout derives from it unless set
    pub wait_time: u64,
    pub handshake_timeout_ms: Option<u64>,
    pub reply_timeout_ms: Option<u64>,
    pub event_timeout_ms: Option<u64>,
    pub exit_timeout_ms: Option<u64>,
    pub verbose: bool,
    pub event_backlog: usize,
    pub transport: TransportConfig,
    pub pipe: PipeConfig,
    pub debuggee: DebuggeeConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            wait_time: 2,
            handshake_timeout_ms: None,
            reply_timeout_ms: None,
            event_timeout_ms: None,
            exit_timeout_ms: None,
            verbose: false,
            event_backlog: DEFAULT_EVENT_BACKLOG,
            transport: TransportConfig::default(),
            pipe: PipeConfig::default(),
            debuggee: DebuggeeConfig::default(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(option: &str, value: &str) -> HarnessResult<T> {
    value
        .parse()
        .map_err(|_| HarnessError::Config(format!("Invalid value for {}: {:?}", option, value)))
}

impl HarnessConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time.saturating_mul(60))
    }

    fn or_wait_time(&self, millis: Option<u64>) -> Duration {
        millis.map_or_else(|| self.wait_time(), Duration::from_millis)
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.or_wait_time(self.handshake_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        self.or_wait_time(self.reply_timeout_ms)
    }

    pub fn event_timeout(&self) -> Duration {
        self.or_wait_time(self.event_timeout_ms)
    }

    pub fn exit_timeout(&self) -> Duration {
        self.or_wait_time(self.exit_timeout_ms)
    }

    /// Read a JSON config file; missing fields keep their defaults.
    pub fn load_file(path: impl AsRef<Path>) -> HarnessResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| HarnessError::Config(format!("Invalid config {}: {}", path.display(), e)))
    }

    /// Build a config from command-line arguments (program name excluded).
    pub fn from_args<I, S>(args: I) -> HarnessResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let split = args.iter().position(|a| a == "--").unwrap_or(args.len());
        let (options, command) = args.split_at(split);

        let mut config = match options.iter().find_map(|a| a.strip_prefix("-config=")) {
            Some(path) => Self::load_file(path)?,
            None => Self::default(),
        };

        for arg in options {
            config.apply_option(arg)?;
        }

        if let Some((program, rest)) = command.get(1..).and_then(|c| c.split_first()) {
            config.debuggee.command = Some(program.clone());
            config.debuggee.args.extend(rest.iter().cloned());
        }

        config.validate()?;
        debug!("Harness config: {:?}", config);
        Ok(config)
    }

    fn apply_option(&mut self, arg: &str) -> HarnessResult<()> {
        let (option, value) = match arg.split_once('=') {
            Some((option, value)) => (option, value),
            None => (arg, ""),
        };

        match option {
            "-config" => {}
            "-verbose" => self.verbose = true,
            "-waittime" => self.wait_time = parse_number(option, value)?,
            "-transport.address" => self.transport.host = value.to_string(),
            "-transport.port" => self.transport.port = Some(parse_number(option, value)?),
            "-pipe.host" => self.pipe.host = value.to_string(),
            "-pipe.port" => self.pipe.port = parse_number(option, value)?,
            "-event.backlog" => self.event_backlog = parse_number(option, value)?,
            "-debugee.vmkind" => self.debuggee.command = Some(value.to_string()),
            "-debugee.vmkeys" => self.debuggee.args.extend(
                value
                    .trim_matches('"')
                    .split_whitespace()
                    .map(str::to_string),
            ),
            "-debugee.suspend" => {
                self.debuggee.suspended_start = match value {
                    "y" | "yes" | "true" => true,
                    "n" | "no" | "false" => false,
                    other => {
                        return Err(HarnessError::Config(format!(
                            "Invalid value for -debugee.suspend: {:?}",
                            other
                        )))
                    }
                }
            }
            "-debugee.sentinel" => self.debuggee.ready_sentinel = value.to_string(),
            _ => {
                return Err(HarnessError::Config(format!("Unknown option: {}", arg)));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.wait_time == 0 {
            return Err(HarnessError::Config("waittime must be positive".to_string()));
        }
        if self.event_backlog == 0 {
            return Err(HarnessError::Config("event backlog must be positive".to_string()));
        }
        if self.transport.max_packet_size < crate::protocol::HEADER_SIZE {
            return Err(HarnessError::Config(format!(
                "max_packet_size {} is smaller than a packet header",
                self.transport.max_packet_size
            )));
        }
        if self.debuggee.ready_sentinel.is_empty() {
            return Err(HarnessError::Config("ready sentinel must not be empty".to_string()));
        }
        Ok(())
    }
}
