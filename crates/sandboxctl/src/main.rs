//! sandboxctl - CLI client for sandboxd
//!
//! Runs commands in the daemon's workspace and inspects their results.

mod client;
mod render;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::io::Read;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use client::{Client, ClientError, RunCodeRequest};
use sandbox_core::request::{CommandInput, TimeoutInput};
use sandbox_core::{ExecutionRequest, ExecutionResult, ExecutionStatus};

/// Exit status used when an execution ended without an exit code.
const ABNORMAL_EXIT: i32 = 1;

/// CLI client for the sandboxd execution daemon.
#[derive(Parser)]
#[command(name = "sandboxctl")]
#[command(about = "Run commands in a sandboxd workspace")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:8000)
    #[arg(long, global = true, env = "SANDBOXD_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "SANDBOX_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command and wait for it to finish
    Exec {
        #[command(flatten)]
        target: CommandArgs,

        /// Print output as it is produced
        #[arg(long)]
        stream: bool,
    },

    /// Submit a command without waiting for it
    Submit {
        #[command(flatten)]
        target: CommandArgs,
    },

    /// Show an execution's status and output
    Status {
        /// Execution ID
        id: String,

        /// Wait up to this many milliseconds for the execution to finish
        #[arg(long)]
        wait_ms: Option<u64>,
    },

    /// List retained executions
    List,

    /// Cancel a pending or running execution
    Cancel {
        /// Execution ID
        id: String,
    },

    /// Follow an execution's output until it finishes
    Tail {
        /// Execution ID
        id: String,

        /// Start with the output captured so far
        #[arg(long)]
        replay: bool,
    },

    /// Run a code snippet
    RunCode {
        /// Source file, or `-` for stdin
        file: PathBuf,

        /// Language of the snippet
        #[arg(short, long, default_value = "python")]
        language: String,

        /// Timeout (e.g. `30s`, `2m`)
        #[arg(long)]
        timeout: Option<String>,
    },

    /// Write a file into the workspace
    Write {
        /// Path relative to the workspace root
        path: String,

        /// Local file to upload, or `-` for stdin
        source: PathBuf,
    },

    /// Print a file from the workspace
    Read {
        /// Path relative to the workspace root
        path: String,
    },

    /// Remove everything in the workspace
    Reset,
}

/// Arguments shared by `exec` and `submit`.
#[derive(Args)]
struct CommandArgs {
    /// Command to run. A single argument is passed to the shell; use
    /// `--argv` to run the words directly.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Run the words as an argument vector, bypassing the shell
    #[arg(long)]
    argv: bool,

    /// Working directory relative to the workspace root
    #[arg(short = 'C', long)]
    cwd: Option<String>,

    /// Timeout (e.g. `500ms`, `30s`, `2m`)
    #[arg(short, long, conflicts_with = "no_timeout")]
    timeout: Option<String>,

    /// Run without a timeout
    #[arg(long)]
    no_timeout: bool,

    /// Extra environment variable (KEY=VALUE, repeatable)
    #[arg(short, long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,
}

impl CommandArgs {
    fn into_request(self) -> ExecutionRequest {
        let command = if self.argv {
            CommandInput::Argv(self.command)
        } else {
            CommandInput::Shell(self.command.join(" "))
        };
        ExecutionRequest {
            command,
            subdirectory: self.cwd,
            timeout: self.timeout.map(TimeoutInput::Text),
            no_timeout: self.no_timeout,
            env: self.env.into_iter().collect(),
            stream: false,
        }
    }
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:8000".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Exec { target, stream } => run_exec(&client, target, stream).await,
        Command::Submit { target } => run_submit(&client, target).await,
        Command::Status { id, wait_ms } => run_status(&client, &id, wait_ms).await,
        Command::List => run_list(&client).await,
        Command::Cancel { id } => run_cancel(&client, &id).await,
        Command::Tail { id, replay } => run_tail(&client, &id, replay).await,
        Command::RunCode {
            file,
            language,
            timeout,
        } => run_code(&client, file, language, timeout).await,
        Command::Write { path, source } => run_write(&client, &path, source).await,
        Command::Read { path } => run_read(&client, &path).await,
        Command::Reset => run_reset(&client).await,
    };

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Map an execution result to this process's exit status.
fn exit_status(result: &ExecutionResult) -> i32 {
    match (result.status, result.exit_code) {
        (ExecutionStatus::Completed, Some(code)) => code,
        _ => ABNORMAL_EXIT,
    }
}

fn read_source(path: &Path) -> Result<String, ClientError> {
    let read = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).map(|_| buf)
    } else {
        std::fs::read_to_string(path)
    };
    read.map_err(|e| ClientError::IoError(format!("{}: {}", path.display(), e)))
}

async fn run_exec(client: &Client, target: CommandArgs, stream: bool) -> Result<i32, ClientError> {
    let req = target.into_request();
    if stream {
        let finished = client.execute_streaming(&req, render::print_event).await?;
        return Ok(finished.as_ref().map_or(ABNORMAL_EXIT, exit_status));
    }

    let result = client.execute(&req).await?;
    if !result.status.is_terminal() {
        // The daemon stopped waiting; point at the follow-up command.
        eprintln!(
            "execution {} still {}; follow with: sandboxctl tail {} --replay",
            result.id, result.status, result.id
        );
        return Ok(ABNORMAL_EXIT);
    }
    render::print_output(&result);
    Ok(exit_status(&result))
}

async fn run_submit(client: &Client, target: CommandArgs) -> Result<i32, ClientError> {
    let response = client.submit(&target.into_request()).await?;
    render::print_submitted(&response.id, response.status);
    Ok(0)
}

async fn run_status(client: &Client, id: &str, wait_ms: Option<u64>) -> Result<i32, ClientError> {
    let result = client.get(id, wait_ms).await?;
    render::print_execution_details(&result);
    Ok(0)
}

async fn run_list(client: &Client) -> Result<i32, ClientError> {
    let executions = client.list().await?;
    render::print_execution_list(&executions);
    Ok(0)
}

async fn run_cancel(client: &Client, id: &str) -> Result<i32, ClientError> {
    let result = client.cancel(id).await?;
    println!("Execution {}: {}", result.id, result.status);
    Ok(0)
}

async fn run_tail(client: &Client, id: &str, replay: bool) -> Result<i32, ClientError> {
    let finished = client.tail(id, replay, render::print_event).await?;
    Ok(finished.as_ref().map_or(ABNORMAL_EXIT, exit_status))
}

async fn run_code(
    client: &Client,
    file: PathBuf,
    language: String,
    timeout: Option<String>,
) -> Result<i32, ClientError> {
    let code = read_source(&file)?;
    let response = client
        .run_code(&RunCodeRequest {
            language,
            code,
            timeout,
        })
        .await?;
    render::print_output(&response.result);
    Ok(exit_status(&response.result))
}

async fn run_write(client: &Client, path: &str, source: PathBuf) -> Result<i32, ClientError> {
    let content = read_source(&source)?;
    let written = client.write_file(path, &content).await?;
    println!("Wrote {} bytes to {}", content.len(), written);
    Ok(0)
}

async fn run_read(client: &Client, path: &str) -> Result<i32, ClientError> {
    let content = client.read_file(path).await?;
    print!("{content}");
    Ok(0)
}

async fn run_reset(client: &Client) -> Result<i32, ClientError> {
    let report = client.reset_workspace().await?;
    println!("Removed {} entries", report.removed);
    if !report.kept.is_empty() {
        println!("Kept: {}", report.kept.join(", "));
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sandboxctl").chain(args.iter().copied()))
            .expect("parse")
    }

    #[test]
    fn exec_single_word_runs_through_shell() {
        let cli = parse(&["exec", "echo hi | wc -c"]);
        let Command::Exec { target, stream } = cli.command else {
            panic!("expected exec");
        };
        assert!(!stream);
        let req = target.into_request();
        assert_eq!(req.command, CommandInput::Shell("echo hi | wc -c".to_string()));
    }

    #[test]
    fn exec_argv_keeps_words_separate() {
        let cli = parse(&["exec", "--argv", "-C", "sub", "--", "ls", "-la", "a b"]);
        let Command::Exec { target, .. } = cli.command else {
            panic!("expected exec");
        };
        let req = target.into_request();
        assert_eq!(
            req.command,
            CommandInput::Argv(vec!["ls".into(), "-la".into(), "a b".into()])
        );
        assert_eq!(req.subdirectory.as_deref(), Some("sub"));
    }

    #[test]
    fn exec_collects_env_and_timeout() {
        let cli = parse(&[
            "exec", "-e", "A=1", "--env", "B=x=y", "--timeout", "30s", "env",
        ]);
        let Command::Exec { target, .. } = cli.command else {
            panic!("expected exec");
        };
        let req = target.into_request();
        assert_eq!(req.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(req.env.get("B").map(String::as_str), Some("x=y"));
        assert_eq!(req.timeout, Some(TimeoutInput::Text("30s".to_string())));
    }

    #[test]
    fn timeout_conflicts_with_no_timeout() {
        let result = Cli::try_parse_from([
            "sandboxctl",
            "exec",
            "--timeout",
            "1s",
            "--no-timeout",
            "true",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn env_pair_requires_key() {
        assert!(parse_env_pair("=v").is_err());
        assert!(parse_env_pair("novalue").is_err());
        assert_eq!(
            parse_env_pair("K=").unwrap(),
            ("K".to_string(), String::new())
        );
    }

    #[test]
    fn exit_status_follows_command() {
        let mut result: ExecutionResult = serde_json::from_value(serde_json::json!({
            "id": "x",
            "status": "Completed",
            "exitCode": 3,
            "stdout": "",
            "stderr": "",
            "command": "exit 3",
            "workingDir": "/workspace",
            "createdAt": "2024-01-01T00:00:00Z",
        }))
        .unwrap();
        assert_eq!(exit_status(&result), 3);

        result.status = ExecutionStatus::TimedOut;
        result.exit_code = None;
        assert_eq!(exit_status(&result), ABNORMAL_EXIT);
    }
}
