//! Output rendering for sandboxctl.
//!
//! Formats execution results and listings for terminal display.

use std::io::Write;

use chrono::{DateTime, Utc};
use sandbox_core::{
    EventPayload, ExecutionResult, ExecutionStatus, ExecutionSummary, Id, OutputStream,
};

/// Write captured output to the matching terminal streams, as if the
/// command had run locally.
pub fn print_output(result: &ExecutionResult) {
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    let _ = std::io::stdout().flush();
    if result.stdout_truncated || result.stderr_truncated {
        eprintln!("[output truncated]");
    }
    if let Some(line) = outcome_line(result) {
        eprintln!("{line}");
    }
}

/// Write one streamed event. Output goes to the matching stream; the
/// final event only reports abnormal endings.
pub fn print_event(event: &EventPayload) {
    match event {
        EventPayload::Output(output) => {
            match output.stream {
                OutputStream::Stdout => {
                    print!("{}", output.data);
                    let _ = std::io::stdout().flush();
                }
                OutputStream::Stderr => eprint!("{}", output.data),
            }
        }
        EventPayload::Finished(result) => {
            if let Some(line) = outcome_line(result) {
                eprintln!("{line}");
            }
        }
    }
}

/// Print confirmation after submitting an execution.
pub fn print_submitted(id: &Id, status: ExecutionStatus) {
    println!("Submitted execution: {id}");
    println!("  Status: {}", format_status(status));
}

/// Print a list of executions in tabular format.
pub fn print_execution_list(executions: &[ExecutionSummary]) {
    if executions.is_empty() {
        println!("No executions found.");
        return;
    }

    println!(
        "{:<36}  {:<10}  {:<5}  {:<10}  {:<20}  {}",
        "ID", "STATUS", "EXIT", "DURATION", "CREATED", "COMMAND"
    );
    println!("{}", "-".repeat(110));

    for exec in executions {
        println!(
            "{:<36}  {:<10}  {:<5}  {:<10}  {:<20}  {}",
            exec.id.0,
            format_status(exec.status),
            format_exit_code(exec.exit_code),
            format_duration(exec.duration_ms),
            format_time(&exec.created_at),
            truncate(&exec.command, 40),
        );
    }

    println!();
    println!("{} execution(s)", executions.len());
}

/// Print detailed information about one execution.
pub fn print_execution_details(result: &ExecutionResult) {
    println!("Execution: {}", result.id);
    println!();
    println!("  Command:     {}", result.command);
    println!("  Working Dir: {}", result.working_dir);
    println!("  Status:      {}", format_status(result.status));
    println!("  Exit Code:   {}", format_exit_code(result.exit_code));
    if let Some(ref error) = result.error {
        println!("  Error:       {error}");
    }
    println!();
    println!("  Created:     {}", format_time(&result.created_at));
    if let Some(ref started) = result.started_at {
        println!("  Started:     {}", format_time(started));
    }
    if let Some(ref ended) = result.ended_at {
        println!("  Ended:       {}", format_time(ended));
    }
    println!("  Duration:    {}", format_duration(result.duration_ms));

    print_captured("Stdout", &result.stdout, result.stdout_truncated);
    print_captured("Stderr", &result.stderr, result.stderr_truncated);
}

fn print_captured(label: &str, text: &str, truncated: bool) {
    if text.is_empty() {
        return;
    }
    println!();
    if truncated {
        println!("  {label} (truncated):");
    } else {
        println!("  {label}:");
    }
    for line in text.lines() {
        println!("    {line}");
    }
}

/// One-line note for executions that did not complete normally.
fn outcome_line(result: &ExecutionResult) -> Option<String> {
    match result.status {
        ExecutionStatus::Completed => None,
        ExecutionStatus::TimedOut => Some(format!(
            "[timed out after {}]",
            format_duration(result.duration_ms)
        )),
        ExecutionStatus::Failed => Some(format!(
            "[failed: {}]",
            result.error.as_deref().unwrap_or("unknown error")
        )),
        status => Some(format!("[{}]", format_status(status))),
    }
}

fn format_status(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Running => "running",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::TimedOut => "timed out",
        ExecutionStatus::Cancelled => "cancelled",
    }
}

fn format_exit_code(code: Option<i32>) -> String {
    code.map_or_else(|| "-".to_string(), |c| c.to_string())
}

fn format_duration(ms: Option<u64>) -> String {
    match ms {
        None => "-".to_string(),
        Some(ms) if ms < 1000 => format!("{ms}ms"),
        Some(ms) => format!("{:.1}s", ms as f64 / 1000.0),
    }
}

fn format_time(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
