//! Colored terminal output for supervisor events.

use std::io::{self, Write};

use chrono::{DateTime, Utc};
use owo_colors::OwoColorize;

use crate::supervisor::{EventKind, HealthCounts, SupervisorEvent, WorkerInfo};

/// Format a timestamp the same way tracing does.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Truncate a string to at most `max_len` characters, adding an ellipsis if
/// truncated.
#[must_use]
pub fn truncate(s: &str, max_len: usize, raw_mode: bool) -> String {
    if raw_mode || s.chars().count() <= max_len {
        return s.to_string();
    }
    if max_len <= 3 {
        return "...".to_string();
    }
    let kept: String = s.chars().take(max_len - 3).collect();
    format!("{kept}...")
}

/// Render an event as a single uncolored line, without timestamp.
#[must_use]
pub fn format_event(event: &SupervisorEvent, raw_mode: bool) -> String {
    let who = format!("{} ({})", event.handle, truncate(&event.worker_id, 8, raw_mode));
    match &event.kind {
        EventKind::Ready { session_token } => {
            format!("{who} ready session={}", truncate(session_token, 20, raw_mode))
        }
        EventKind::Output { record } => {
            let kind = record
                .get("type")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("?");
            format!("{who} {kind}")
        }
        EventKind::Result {
            text,
            duration_ms,
            is_error,
        } => {
            let status = if *is_error { "failed" } else { "done" };
            let took = duration_ms.map_or(String::new(), |ms| format!(" in {ms}ms"));
            format!("{who} {status}{took}: {}", truncate(text, 200, raw_mode))
        }
        EventKind::Error { message } => format!("{who} {message}"),
        EventKind::Exit {
            code,
            signal,
            expected,
        } => {
            let how = match (code, signal) {
                (Some(code), _) => format!("code {code}"),
                (None, Some(signal)) => format!("signal {signal}"),
                (None, None) => "unknown status".to_string(),
            };
            let note = if *expected { "" } else { " (unexpected)" };
            format!("{who} exited with {how}{note}")
        }
        EventKind::Unhealthy {
            idle_ms,
            restart_count,
        } => format!("{who} idle for {idle_ms}ms, restarts so far: {restart_count}"),
        EventKind::Restart {
            previous_id,
            restart_count,
        } => format!(
            "{who} replaced {} (restart {restart_count})",
            truncate(previous_id, 8, raw_mode)
        ),
    }
}

/// Print a supervisor event with a colored tag.
///
/// `output` events are only printed in raw mode, where the record itself is
/// shown.
pub fn print_event(event: &SupervisorEvent, raw_mode: bool) {
    let ts = timestamp(&event.at);
    let tag = format!("[{}]", event.kind.name().to_uppercase());
    let line = format_event(event, raw_mode);
    match &event.kind {
        EventKind::Output { record } => {
            if !raw_mode {
                return;
            }
            println!("{} {} {}", ts.dimmed(), tag.yellow().bold(), record);
        }
        EventKind::Ready { .. } | EventKind::Restart { .. } => {
            println!("{} {} {}", ts.dimmed(), tag.blue().bold(), line);
        }
        EventKind::Result { is_error, .. } => {
            if *is_error {
                println!("{} {} {}", ts.dimmed(), tag.red().bold(), line);
            } else {
                println!("{} {} {}", ts.dimmed(), tag.green().bold(), line);
            }
        }
        EventKind::Error { .. } | EventKind::Unhealthy { .. } => {
            println!("{} {} {}", ts.dimmed(), tag.red().bold(), line);
        }
        EventKind::Exit { expected, .. } => {
            if *expected {
                println!("{} {} {}", ts.dimmed(), tag.dimmed(), line);
            } else {
                println!("{} {} {}", ts.dimmed(), tag.red().bold(), line);
            }
        }
    }
    let _ = io::stdout().flush();
}

/// Print one line per worker plus health totals.
pub fn print_workers(workers: &[WorkerInfo], counts: &HealthCounts) {
    for worker in workers {
        println!(
            "{} {} team={} state={} health={:?} restarts={} dir={}",
            "[WORKER]".cyan().bold(),
            worker.handle.bold(),
            worker.team_name,
            worker.state,
            worker.health,
            worker.restart_count,
            worker.working_directory.display().dimmed()
        );
    }
    println!(
        "{} {} healthy, {} degraded, {} unhealthy",
        "[HEALTH]".magenta().bold(),
        counts.healthy,
        counts.degraded,
        counts.unhealthy
    );
    let _ = io::stdout().flush();
}

/// Print an error message.
pub fn print_error(message: &str) {
    println!("{} {}", "[ERROR]".red().bold(), message);
    let _ = io::stdout().flush();
}
