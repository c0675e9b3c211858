//! Execution requests.
//!
//! `ExecutionRequest` is the loosely typed payload accepted from callers;
//! `ExecutionRequest::validate` turns it into an `ExecutionSpec` that the
//! engine can run without further checks. Path containment is not checked
//! here: it needs the workspace and happens at admission.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("command is empty")]
    EmptyCommand,
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    #[error("timeout of {requested_ms}ms exceeds the maximum of {max_ms}ms")]
    TimeoutTooLong { requested_ms: u128, max_ms: u128 },
    #[error("invalid environment variable: {0}")]
    InvalidEnv(String),
}

/// Command as sent by a caller: a shell string or an argument vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandInput {
    Shell(String),
    Argv(Vec<String>),
}

/// Timeout as sent by a caller: seconds, or a duration string
/// (`"500ms"`, `"1s"`, `"2m"`, `"1h"`, `"none"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeoutInput {
    Seconds(f64),
    Text(String),
}

/// Inbound request describing one command to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub command: CommandInput,
    /// Working directory relative to the workspace root.
    #[serde(default, alias = "cwd", skip_serializing_if = "Option::is_none")]
    pub subdirectory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutInput>,
    /// Explicitly run without a timeout.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_timeout: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Deliver output as a stream of events instead of a single payload.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

impl ExecutionRequest {
    /// Request that runs `command` through the shell.
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: CommandInput::Shell(command.into()),
            subdirectory: None,
            timeout: None,
            no_timeout: false,
            env: BTreeMap::new(),
            stream: false,
        }
    }

    /// Request that runs an argument vector directly.
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: CommandInput::Argv(args.into_iter().map(Into::into).collect()),
            ..Self::shell(String::new())
        }
    }

    pub fn in_subdirectory(mut self, subdirectory: impl Into<String>) -> Self {
        self.subdirectory = Some(subdirectory.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(TimeoutInput::Text(format!("{}ms", timeout.as_millis())));
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Validate the request against the configured limits.
    pub fn validate(&self, limits: &RequestLimits) -> Result<ExecutionSpec, RequestError> {
        let command = match &self.command {
            CommandInput::Shell(cmd) => {
                if cmd.trim().is_empty() {
                    return Err(RequestError::EmptyCommand);
                }
                if cmd.contains('\0') {
                    return Err(RequestError::InvalidCommand(
                        "command contains a NUL byte".to_string(),
                    ));
                }
                CommandSpec::Shell(cmd.clone())
            }
            CommandInput::Argv(args) => {
                let Some((program, rest)) = args.split_first() else {
                    return Err(RequestError::EmptyCommand);
                };
                if program.trim().is_empty() {
                    return Err(RequestError::EmptyCommand);
                }
                if args.iter().any(|a| a.contains('\0')) {
                    return Err(RequestError::InvalidCommand(
                        "argument contains a NUL byte".to_string(),
                    ));
                }
                CommandSpec::Argv {
                    program: program.clone(),
                    args: rest.to_vec(),
                }
            }
        };

        for (name, value) in &self.env {
            if name.is_empty() || name.contains('=') || name.contains('\0') {
                return Err(RequestError::InvalidEnv(format!("invalid name {name:?}")));
            }
            if value.contains('\0') {
                return Err(RequestError::InvalidEnv(format!(
                    "value of {name} contains a NUL byte"
                )));
            }
        }

        let timeout = if self.no_timeout {
            Timeout::Unbounded
        } else {
            match &self.timeout {
                None => Timeout::Bounded(limits.default_timeout),
                Some(TimeoutInput::Seconds(secs)) => Timeout::Bounded(seconds_to_duration(*secs)?),
                Some(TimeoutInput::Text(text)) => parse_timeout(text)?,
            }
        };

        if let Timeout::Bounded(duration) = timeout {
            if duration > limits.max_timeout {
                return Err(RequestError::TimeoutTooLong {
                    requested_ms: duration.as_millis(),
                    max_ms: limits.max_timeout.as_millis(),
                });
            }
        }

        let subdirectory = self
            .subdirectory
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(".")
            .to_string();

        Ok(ExecutionSpec {
            command,
            subdirectory,
            timeout,
            env: self.env.clone(),
            output_mode: if self.stream {
                OutputMode::Streaming
            } else {
                OutputMode::Buffered
            },
        })
    }
}

/// Bounds applied while validating requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    /// Timeout applied when the request does not name one.
    pub default_timeout: Duration,
    /// Largest bounded timeout a request may ask for.
    pub max_timeout: Duration,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(3600),
        }
    }
}

/// Validated command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// Run through `<shell> -c`.
    Shell(String),
    /// Run the program directly with the given arguments.
    Argv { program: String, args: Vec<String> },
}

impl CommandSpec {
    /// Human-readable form for logs and results.
    pub fn display(&self) -> String {
        match self {
            Self::Shell(cmd) => cmd.clone(),
            Self::Argv { program, args } => {
                let mut parts = Vec::with_capacity(args.len() + 1);
                parts.push(quote_arg(program));
                parts.extend(args.iter().map(|a| quote_arg(a)));
                parts.join(" ")
            }
        }
    }
}

fn quote_arg(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Bounded(Duration),
    /// Only when the caller explicitly asked for it.
    Unbounded,
}

impl Timeout {
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Bounded(d) => Some(*d),
            Self::Unbounded => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Buffered,
    Streaming,
}

/// A request after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSpec {
    pub command: CommandSpec,
    /// Unresolved subdirectory, `"."` for the workspace root.
    pub subdirectory: String,
    pub timeout: Timeout,
    pub env: BTreeMap<String, String>,
    pub output_mode: OutputMode,
}

fn seconds_to_duration(secs: f64) -> Result<Duration, RequestError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(RequestError::InvalidTimeout(format!(
            "{secs} (must be a positive number of seconds)"
        )));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| RequestError::InvalidTimeout(e.to_string()))
}

/// Parse a timeout string.
///
/// Accepts a bare number of seconds or a number with one of the suffixes
/// `ms`, `s`, `m`, `h`. `none`, `never` and `infinite` mean no timeout.
pub fn parse_timeout(text: &str) -> Result<Timeout, RequestError> {
    let trimmed = text.trim().to_ascii_lowercase();
    if matches!(trimmed.as_str(), "none" | "never" | "infinite") {
        return Ok(Timeout::Unbounded);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| RequestError::InvalidTimeout(text.to_string()))?;

    let secs = match unit.trim() {
        "" | "s" | "sec" | "secs" => value,
        "ms" => value / 1000.0,
        "m" | "min" | "mins" => value * 60.0,
        "h" | "hr" | "hrs" => value * 3600.0,
        _ => return Err(RequestError::InvalidTimeout(text.to_string())),
    };

    seconds_to_duration(secs).map(Timeout::Bounded)
}
