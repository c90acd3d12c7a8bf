pub mod output;
pub mod prompt;

pub use output::Output;
pub use prompt::TermPrompt;
