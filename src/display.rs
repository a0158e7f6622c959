//! Colored terminal output for the `run` and `check` commands.

use std::io::{self, Write};

use chrono::{DateTime, Utc};
use owo_colors::OwoColorize;

use crate::bus::DecodedEvent;
use crate::config::DecoderConfig;
use crate::supervisor::{SessionState, SessionStatus, StopReport};

fn format_time(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn timestamp() -> String {
    format_time(&Utc::now())
}

/// Truncate to at most `max_chars` characters, adding an ellipsis if cut.
#[must_use]
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else if max_chars <= 3 {
        "...".to_string()
    } else {
        let kept: String = s.chars().take(max_chars - 3).collect();
        format!("{kept}...")
    }
}

/// Print a session that just became active.
pub fn print_session_start(status: &SessionStatus) {
    let pids: Vec<String> = status
        .stages
        .iter()
        .map(|stage| match stage.pid {
            Some(pid) => format!("{}={pid}", stage.id),
            None => stage.id.clone(),
        })
        .collect();
    println!(
        "{} {} {} started ({}) {}",
        timestamp().dimmed(),
        "[SESSION]".blue().bold(),
        status.decoder_name.cyan(),
        pids.join(", "),
        format!("session={}", status.session_id).dimmed()
    );
    let _ = io::stdout().flush();
}

/// Print one decoded line.
pub fn print_event(event: &DecodedEvent) {
    println!(
        "{} {} {}",
        format_time(&event.timestamp).dimmed(),
        format!("[{}/{}]", event.decoder_name, event.stage_id)
            .green()
            .bold(),
        event.raw_line
    );
    let _ = io::stdout().flush();
}

/// Print the end of a session.
pub fn print_session_end(decoder: &str, state: SessionState, reason: Option<&str>) {
    let ts = timestamp();
    if state == SessionState::Failed {
        println!(
            "{} {} {} failed: {}",
            ts.dimmed(),
            "[SESSION]".red().bold(),
            decoder.cyan(),
            reason.unwrap_or("unknown error").red()
        );
    } else {
        println!(
            "{} {} {} {}",
            ts.dimmed(),
            "[SESSION]".blue().bold(),
            decoder.cyan(),
            state
        );
    }
    let _ = io::stdout().flush();
}

/// Print how each stage of a stopped session ended.
pub fn print_stop_report(report: &StopReport) {
    for reaped in &report.killed {
        let pid = reaped
            .pid
            .map_or_else(|| "-".to_string(), |pid| pid.to_string());
        let exit = reaped.exit.describe();
        if reaped.exit.forced {
            println!(
                "{} {} pid={} {}",
                "[KILL]".yellow().bold(),
                reaped.stage_id,
                pid.dimmed(),
                exit.yellow()
            );
        } else {
            println!(
                "{} {} pid={} {}",
                "[STOP]".blue().bold(),
                reaped.stage_id,
                pid.dimmed(),
                exit
            );
        }
    }
    let _ = io::stdout().flush();
}

/// Print one row of `check` output.
pub fn print_decoder_check(name: &str, decoder: &DecoderConfig) {
    let marker = if decoder.is_available() {
        "[OK]".green().bold().to_string()
    } else {
        "[MISSING]".red().bold().to_string()
    };
    println!(
        "{} {} {}",
        marker,
        name.cyan().bold(),
        truncate(&decoder.description, 60).dimmed()
    );
    for stage in &decoder.stages {
        let found = stage
            .resolve_executable()
            .map_or_else(|| "not found".red().to_string(), |p| p.display().to_string());
        println!("    {} {} ({})", stage.id.bold(), stage.command, found.dimmed());
    }
    let _ = io::stdout().flush();
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), message);
}
