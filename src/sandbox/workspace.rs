use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{IoContext, JudgeError};
use crate::language::LanguageTemplate;

// Workspace directory permissions
const WORKSPACE_PERMISSIONS: u32 = 0o700;

/// Private, single-use directory holding one submission's source
///
/// Dropping the workspace deletes the directory tree. A workspace is handed
/// to `SandboxRuntime::execute` by value, so it never outlives the execution
/// that consumes it.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    dir: PathBuf,
    language: LanguageTemplate,
}

impl Workspace {
    /// Creates the directory under `root` and writes the source file into it
    pub fn create(
        root: &Path,
        language: &LanguageTemplate,
        code: &str,
    ) -> Result<Self, JudgeError> {
        let id = Uuid::new_v4();
        let dir = root.join(format!("ws-{id}"));

        fs::DirBuilder::new()
            .mode(WORKSPACE_PERMISSIONS)
            .create(&dir)
            .sandbox_context(|| format!("Failed to create workspace {}", dir.display()))?;

        // From here on Drop owns the directory
        let workspace = Self {
            id,
            dir,
            language: language.clone(),
        };

        let source_path = workspace.source_path();
        fs::write(&source_path, format!("{code}\n"))
            .sandbox_context(|| format!("Failed to write source {}", source_path.display()))?;

        Ok(workspace)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn language(&self) -> &LanguageTemplate {
        &self.language
    }

    pub fn source_path(&self) -> PathBuf {
        self.dir.join(&self.language.file_name)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if remove_tree_reporting(&self.dir, "workspace") == 0 {
            log::debug!("Workspace {} released", self.id);
        }
    }
}

/// Deletes `path` recursively, logging one warning for all failures
///
/// Returns the number of entries that could not be removed.
pub(crate) fn remove_tree_reporting(path: &Path, what: &str) -> usize {
    let mut failures = Vec::new();
    remove_tree(path, &mut failures);

    if let Some((first_path, first_err)) = failures.first() {
        log::warn!(
            "Failed to remove {} entries of {what} {} (first: {}: {first_err})",
            failures.len(),
            path.display(),
            first_path.display(),
        );
    }
    failures.len()
}

fn remove_tree(path: &Path, failures: &mut Vec<(PathBuf, io::Error)>) {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => {
            failures.push((path.to_path_buf(), e));
            return;
        }
    };

    if !metadata.is_dir() {
        if let Err(e) = fs::remove_file(path) {
            failures.push((path.to_path_buf(), e));
        }
        return;
    }

    // Submitted programs may have revoked access to their own directories
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(WORKSPACE_PERMISSIONS));

    match fs::read_dir(path) {
        Ok(entries) => {
            for entry in entries {
                match entry {
                    Ok(entry) => remove_tree(&entry.path(), failures),
                    Err(e) => failures.push((path.to_path_buf(), e)),
                }
            }
        }
        Err(e) => failures.push((path.to_path_buf(), e)),
    }

    if let Err(e) = fs::remove_dir(path) {
        failures.push((path.to_path_buf(), e));
    }
}
