//! Clean Command
//!
//! Discard saved analysis progress and caches. The last rules report and
//! the project configuration are left in place.

use std::path::Path;
use std::time::Duration;

use super::start::resolve_repo;
use crate::cli::ui::{Output, TermPrompt};
use crate::config::ConfigLoader;
use crate::pipeline::{CheckpointStore, Loaded, ResumePrompt};
use crate::types::{Result, RulectlError};

pub fn run(dir: Option<&Path>, force: bool) -> Result<()> {
    let repo = resolve_repo(dir)?;
    let output = Output::new();

    if !CheckpointStore::open_read_only(&repo).has_state() {
        output.info("Nothing to clean");
        return Ok(());
    }

    let config = ConfigLoader::load(&repo)?;
    let store = CheckpointStore::open(
        &repo,
        Duration::from_secs(config.session.lock_timeout_secs),
    )?;

    if !force {
        let prompt = TermPrompt::new();
        if !prompt.is_interactive() {
            return Err(RulectlError::Session(
                "refusing to discard analysis state without --force".to_string(),
            ));
        }
        if let Loaded::Present(session) = store.load()? {
            output.info(&session.summary().to_string());
        }
        if !prompt.ask("Discard saved analysis progress?")? {
            output.info("Kept existing state");
            return Ok(());
        }
    }

    store.clear()?;
    output.success(&format!("Cleared {}", store.state_dir().display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{RunOptions, Session};
    use tempfile::TempDir;

    #[test]
    fn test_clean_removes_session_but_keeps_report() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        {
            let store = CheckpointStore::open(&root, Duration::from_secs(1)).unwrap();
            store
                .save_session(&Session::new(&root, RunOptions::default()))
                .unwrap();
            store.write_report(&serde_json::json!({"rules": []})).unwrap();
        }

        run(Some(&root), true).unwrap();

        let store = CheckpointStore::open_read_only(&root);
        assert!(matches!(store.load().unwrap(), Loaded::Missing));
        assert!(store.rules_path().exists());
    }

    #[test]
    fn test_clean_without_state_is_noop() {
        let dir = TempDir::new().unwrap();
        assert!(run(Some(dir.path()), false).is_ok());
    }
}
