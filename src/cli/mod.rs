pub mod commands;
pub mod progress;
pub mod ui;

pub use progress::ConsoleRenderer;
pub use ui::{Output, TermPrompt};
