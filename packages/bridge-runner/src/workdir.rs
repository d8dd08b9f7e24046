//! Per-project working directories for stateful CLI sessions.
//!
//! A request carrying a project id runs its CLI inside
//! `<temp-dir>/<session-subdir>/<project-id>` so the assistant's own session
//! state survives across requests on the same connection. The resolved path
//! must stay strictly inside the session subdirectory even if a hostile
//! project id slipped past frame validation.

use std::path::{Component, Path, PathBuf};

use crate::process::SpawnError;

pub fn session_workdir(session_dir: &str, project_id: &str) -> Result<PathBuf, SpawnError> {
    // A project id must be a single normal path component.
    let mut components = Path::new(project_id).components();
    let valid = matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none();
    if !valid {
        return Err(SpawnError::setup(format!(
            "Project id escapes the session directory: {project_id}"
        )));
    }

    let base = std::env::temp_dir().join(session_dir);
    let workdir = base.join(project_id);
    std::fs::create_dir_all(&workdir).map_err(|err| {
        SpawnError::setup(format!(
            "Failed to create project directory {}: {err}",
            workdir.display()
        ))
    })?;

    // Belt and braces: resolve symlinks and re-check containment.
    let canonical_base = base
        .canonicalize()
        .map_err(|err| SpawnError::setup(format!("Failed to resolve session directory: {err}")))?;
    let canonical = workdir
        .canonicalize()
        .map_err(|err| SpawnError::setup(format!("Failed to resolve project directory: {err}")))?;
    if !canonical.starts_with(&canonical_base) {
        return Err(SpawnError::setup(format!(
            "Project id escapes the session directory: {project_id}"
        )));
    }

    Ok(workdir)
}
