//! Terminal resume confirmation

use console::{Term, style};

use crate::pipeline::{ProgressSummary, ResumePrompt};
use crate::types::Result;

pub struct TermPrompt {
    term: Term,
}

impl TermPrompt {
    pub fn new() -> Self {
        Self {
            term: Term::stderr(),
        }
    }

    /// Ask a yes/no question; anything but `y`/`yes` is a no
    pub fn ask(&self, question: &str) -> Result<bool> {
        self.term
            .write_str(&format!("{} {} [y/N] ", style("?").cyan(), question))?;
        let answer = self.term.read_line()?;
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    }
}

impl Default for TermPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl ResumePrompt for TermPrompt {
    fn is_interactive(&self) -> bool {
        self.term.is_term() && console::user_attended()
    }

    fn confirm(&self, summary: &ProgressSummary) -> Result<bool> {
        self.term.write_line(&format!(
            "{} Found an unfinished analysis",
            style("ℹ").blue()
        ))?;
        self.term.write_line(&format!("  {}", summary))?;
        self.ask("Resume it?")
    }
}
