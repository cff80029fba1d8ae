use anyhow::{Context, Result};
use git2::{Delta, DiffOptions, IndexAddOption, Repository, Signature, StatusOptions};
use std::path::Path;

pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    /// Open the repository containing `project_dir`.
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::discover(project_dir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn get_head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Get current HEAD SHA (returns None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        self.get_head_commit().map(|c| c.id().to_string())
    }

    /// Names of files added, modified, deleted or renamed since `base_sha`.
    ///
    /// With no base (unborn branch at phase start) everything in the working
    /// tree counts. Untracked files are included; ignored files are not.
    pub fn modified_files_since(&self, base_sha: Option<&str>) -> Result<Vec<String>> {
        let base_tree = match base_sha {
            Some(sha) => {
                let oid = git2::Oid::from_str(sha)
                    .with_context(|| format!("Invalid revision marker '{}'", sha))?;
                let commit = self
                    .repo
                    .find_commit(oid)
                    .with_context(|| format!("Revision {} not found", sha))?;
                Some(commit.tree()?)
            }
            None => None,
        };

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);

        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(base_tree.as_ref(), Some(&mut opts))
            .context("Failed to diff working tree")?;

        let mut files: Vec<String> = diff
            .deltas()
            .filter(|delta| {
                matches!(
                    delta.status(),
                    Delta::Added
                        | Delta::Untracked
                        | Delta::Modified
                        | Delta::Deleted
                        | Delta::Renamed
                        | Delta::Typechange
                )
            })
            .filter_map(|delta| {
                delta
                    .new_file()
                    .path()
                    .or_else(|| delta.old_file().path())
                    .map(|p| p.to_string_lossy().into_owned())
            })
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Whether any tracked file differs from HEAD (staged or not).
    ///
    /// Untracked files are ignored here: they never trigger an auto-commit.
    pub fn has_tracked_changes(&self) -> Result<bool> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(false).include_ignored(false);
        let statuses = self
            .repo
            .statuses(Some(&mut opts))
            .context("Failed to read repository status")?;
        Ok(statuses
            .iter()
            .any(|entry| !entry.status().is_empty() && !entry.status().is_ignored()))
    }

    /// Stage all changes and commit them on HEAD. Returns the new commit sha.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;

        let sig = self
            .repo
            .signature()
            .or_else(|_| Signature::now("conductor", "conductor@localhost"))?;

        // Handle unborn branch (new repo with no commits yet)
        let parents: Vec<git2::Commit<'_>> = self.get_head_commit().into_iter().collect();
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();

        let commit_id = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .context("Failed to create commit")?;

        Ok(commit_id.to_string())
    }
}
