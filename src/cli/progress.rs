//! Console Progress Rendering
//!
//! Turns pipeline [`ProgressEvent`]s into terminal output. On a terminal
//! the item line is redrawn in place; otherwise only phase boundaries and
//! messages are printed.

use console::{Term, style};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::pipeline::{AnalysisPhase, MessageLevel, ProgressEvent};

const BAR_WIDTH: usize = 30;

pub struct ConsoleRenderer {
    term: Term,
    quiet: bool,
}

impl ConsoleRenderer {
    pub fn new(quiet: bool) -> Self {
        Self {
            term: Term::stderr(),
            quiet,
        }
    }

    /// Render events until every sender is dropped
    pub fn spawn(self, mut events: broadcast::Receiver<ProgressEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.render(&event),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn render(&self, event: &ProgressEvent) {
        if self.quiet {
            return;
        }
        let live = self.term.is_term();
        let line = match event {
            ProgressEvent::ItemProgress { .. } if !live => return,
            ProgressEvent::ItemProgress { .. } => {
                let _ = self.term.clear_line();
                let _ = self.term.write_str(&format_event(event));
                return;
            }
            _ => format_event(event),
        };
        if live {
            let _ = self.term.clear_line();
        }
        let _ = self.term.write_line(&line);
    }
}

fn phase_label(phase: AnalysisPhase) -> String {
    format!("[{}/{}] {}", phase.index() + 1, AnalysisPhase::ALL.len(), phase.describe())
}

pub fn format_event(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::PhaseStarted {
            phase,
            total_items,
            resumed_at,
        } => {
            let mut line = format!("{} {}", style("▸").cyan(), phase_label(*phase));
            if *total_items > 0 {
                line.push_str(&format!(" ({} items", total_items));
                if *resumed_at > 0 {
                    line.push_str(&format!(", resuming at {}", resumed_at));
                }
                line.push(')');
            }
            line
        }
        ProgressEvent::ItemProgress {
            completed,
            failed,
            total,
            current_item,
            ..
        } => {
            let mut line = format!(
                "  {} {}/{}",
                render_progress_bar(*completed, *total, BAR_WIDTH),
                completed,
                total
            );
            if *failed > 0 {
                line.push_str(&format!(" {}", style(format!("({} failed)", failed)).red()));
            }
            line.push_str(&format!(" {}", style(current_item).dim()));
            line
        }
        ProgressEvent::PhaseCompleted { phase, elapsed } => format!(
            "{} {} {}",
            style("✓").green(),
            phase_label(*phase),
            style(format_duration(*elapsed)).dim()
        ),
        ProgressEvent::Message { level, message } => match level {
            MessageLevel::Info => format!("{} {}", style("ℹ").blue(), message),
            MessageLevel::Warning => format!("{} {}", style("⚠").yellow(), message),
            MessageLevel::Error => format!("{} {}", style("✗").red(), message),
        },
    }
}

/// Render a simple progress bar
fn render_progress_bar(completed: usize, total: usize, width: usize) -> String {
    if total == 0 {
        return format!("[{}]", " ".repeat(width));
    }

    let progress = (completed as f32 / total as f32).min(1.0);
    let filled = (progress * width as f32) as usize;
    let empty = width.saturating_sub(filled);

    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

/// Format duration as human-readable string
fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
