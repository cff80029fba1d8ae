//! Resumable progress for mid-phase worker restarts.
//!
//! A `PhaseCheckpoint` lives for one phase: it collects the worker's explicit
//! progress signals and the files touched since the phase started, and is
//! rendered into the briefing handed to a replacement worker session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::tracker::GitTracker;

/// Modified files listed in a restart briefing before truncation.
pub const MAX_LISTED_FILES: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Progress snapshot for the phase in flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseCheckpoint {
    pub phase_id: String,
    pub entries: Vec<ProgressEntry>,
    pub modified_files: Vec<String>,
    pub restart_count: u32,
    /// HEAD at phase start; `None` for unborn branches or no repository
    pub base_revision: Option<String>,
}

pub struct CheckpointManager {
    project_dir: PathBuf,
    current: Option<PhaseCheckpoint>,
}

impl CheckpointManager {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            current: None,
        }
    }

    fn git(&self) -> Option<GitTracker> {
        match GitTracker::new(&self.project_dir) {
            Ok(tracker) => Some(tracker),
            Err(e) => {
                debug!(error = %e, "git unavailable, checkpoint degrades to progress only");
                None
            }
        }
    }

    /// Open a fresh checkpoint, replacing any previous one.
    pub fn start_phase(&mut self, phase_id: &str) {
        let base_revision = self.git().and_then(|g| g.head_sha());
        self.current = Some(PhaseCheckpoint {
            phase_id: phase_id.to_string(),
            base_revision,
            ..Default::default()
        });
    }

    /// Append a timestamped progress entry. Ignored when no phase is open.
    pub fn record_progress(&mut self, message: &str) {
        match self.current.as_mut() {
            Some(cp) => cp.entries.push(ProgressEntry {
                timestamp: Utc::now(),
                message: message.to_string(),
            }),
            None => debug!(progress = message, "progress recorded outside a phase, dropped"),
        }
    }

    /// Refresh the modified-file list from version control.
    ///
    /// If git is unavailable the previous list is kept.
    pub fn capture_state(&mut self) -> Option<&PhaseCheckpoint> {
        let git = self.git();
        let cp = self.current.as_mut()?;
        if let Some(git) = git {
            match git.modified_files_since(cp.base_revision.as_deref()) {
                Ok(files) => cp.modified_files = files,
                Err(e) => debug!(error = %e, "could not list modified files"),
            }
        }
        Some(&*cp)
    }

    /// Bump the restart counter and render the briefing for the next session.
    pub fn prepare_restart(&mut self) -> String {
        self.capture_state();
        match self.current.as_mut() {
            Some(cp) => {
                cp.restart_count += 1;
                render_restart_context(cp)
            }
            None => String::new(),
        }
    }

    pub fn checkpoint(&self) -> Option<&PhaseCheckpoint> {
        self.current.as_ref()
    }

    /// Discard the checkpoint at phase resolution.
    pub fn finish_phase(&mut self) -> Option<PhaseCheckpoint> {
        self.current.take()
    }
}

/// Render a file list capped at `MAX_LISTED_FILES` entries.
pub fn render_file_list(files: &[String]) -> String {
    let mut out = String::new();
    for file in files.iter().take(MAX_LISTED_FILES) {
        out.push_str("- ");
        out.push_str(file);
        out.push('\n');
    }
    if files.len() > MAX_LISTED_FILES {
        out.push_str(&format!(
            "... and {} more files\n",
            files.len() - MAX_LISTED_FILES
        ));
    }
    out
}

fn render_restart_context(cp: &PhaseCheckpoint) -> String {
    let mut out = String::new();
    out.push_str("## SESSION RESET: CONTEXT RESTART\n\n");
    out.push_str(&format!(
        "Your previous session on phase {} reached its context budget and was replaced. \
         This is restart {}.\n\n",
        cp.phase_id, cp.restart_count
    ));

    out.push_str("### Progress so far\n");
    if cp.entries.is_empty() {
        out.push_str("(no progress recorded)\n");
    }
    for entry in &cp.entries {
        out.push_str(&format!(
            "- [{}] {}\n",
            entry.timestamp.format("%H:%M:%S"),
            entry.message
        ));
    }

    out.push_str("\n### Files modified since phase start\n");
    if cp.modified_files.is_empty() {
        out.push_str("(none detected)\n");
    } else {
        out.push_str(&render_file_list(&cp.modified_files));
    }

    out.push_str(
        "\nDo NOT redo work that is already complete. Check the files above, \
         then continue with what remains.\n",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_file_list_caps_at_twenty() {
        let files: Vec<String> = (1..=25).map(|i| format!("src/file{:02}.rs", i)).collect();
        let rendered = render_file_list(&files);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 21);
        assert!(lines[..20].iter().all(|l| l.starts_with("- src/file")));
        assert_eq!(lines[19], "- src/file20.rs");
        assert_eq!(lines[20], "... and 5 more files");
    }

    #[test]
    fn test_file_list_under_cap_has_no_suffix() {
        let files = vec!["a.rs".to_string(), "b.rs".to_string()];
        let rendered = render_file_list(&files);
        assert_eq!(rendered, "- a.rs\n- b.rs\n");
    }

    #[test]
    fn test_progress_without_git_degrades() {
        let dir = tempdir().unwrap();
        let mut mgr = CheckpointManager::new(dir.path());
        mgr.start_phase("03");
        mgr.record_progress("schema migrated");
        mgr.record_progress("handlers written");

        let block = mgr.prepare_restart();
        assert!(block.contains("SESSION RESET"));
        assert!(block.contains("phase 03"));
        assert!(block.contains("restart 1"));
        assert!(block.contains("schema migrated"));
        assert!(block.contains("handlers written"));
        assert!(block.contains("(none detected)"));
        assert!(block.contains("Do NOT redo work"));

        let block = mgr.prepare_restart();
        assert!(block.contains("restart 2"));
        assert_eq!(mgr.checkpoint().unwrap().restart_count, 2);
    }

    #[test]
    fn test_progress_entries_keep_emission_order() {
        let dir = tempdir().unwrap();
        let mut mgr = CheckpointManager::new(dir.path());
        mgr.start_phase("01");
        for i in 0..5 {
            mgr.record_progress(&format!("step {}", i));
        }
        let messages: Vec<&str> = mgr
            .checkpoint()
            .unwrap()
            .entries
            .iter()
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(messages, vec!["step 0", "step 1", "step 2", "step 3", "step 4"]);
    }

    #[test]
    fn test_capture_state_lists_files_since_start() {
        let dir = tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        fs::write(dir.path().join("base.txt"), "base").unwrap();
        GitTracker::new(dir.path()).unwrap().commit_all("init").unwrap();

        let mut mgr = CheckpointManager::new(dir.path());
        mgr.start_phase("02");
        assert!(mgr.checkpoint().unwrap().base_revision.is_some());

        fs::write(dir.path().join("added.rs"), "fn f() {}").unwrap();
        let cp = mgr.capture_state().unwrap();
        assert_eq!(cp.modified_files, vec!["added.rs"]);
    }

    #[test]
    fn test_finish_phase_discards_checkpoint() {
        let dir = tempdir().unwrap();
        let mut mgr = CheckpointManager::new(dir.path());
        mgr.start_phase("01");
        assert!(mgr.finish_phase().is_some());
        assert!(mgr.checkpoint().is_none());
        assert!(mgr.prepare_restart().is_empty());
        mgr.record_progress("dropped");
        assert!(mgr.checkpoint().is_none());
    }
}
