//! Loading migration scripts from files.
//!
//! Script files are named `v<version>_<description words>.sql`, for example
//! `v1.2.0_add_user_email.sql`, or `R_<description words>.sql` for a
//! repeatable migration. The description is the remaining underscore
//! separated words joined with spaces.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{MigrateResult, MigrationError};
use crate::registry::Registry;

/// Split a script file name into its version and description.
pub fn parse_script_name(file_name: &str) -> MigrateResult<(String, String)> {
    let stem = file_name.strip_suffix(".sql").unwrap_or(file_name);
    let parts: Vec<&str> = stem.split('_').collect();

    if parts.len() < 2 {
        return Err(MigrationError::migration_name(format!(
            "{} (expected v<version>_<description>.sql)",
            file_name
        )));
    }

    let version = parts[0].strip_prefix('v').unwrap_or(parts[0]).to_string();
    let description = parts[1..]
        .iter()
        .filter(|word| !word.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ");

    Ok((version, description))
}

impl Registry {
    /// Register a single SQL script as a migration.
    ///
    /// The whole script is sent as one command, so it may hold several
    /// statements.
    pub fn add_script(&mut self, file_name: &str, sql: impl Into<String>) -> MigrateResult<()> {
        let (version, description) = parse_script_name(file_name)?;
        let sql = sql.into();
        self.register(&version, &description, move |m| {
            m.exec_sql(sql.clone());
        })
    }

    /// Register every `*.sql` file below `dir`, recursing into
    /// subdirectories. Files are registered in path order.
    pub async fn add_directory(&mut self, dir: impl AsRef<Path>) -> MigrateResult<usize> {
        let dir = dir.as_ref();
        let files = collect_scripts(dir).await?;

        for path in &files {
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| MigrationError::migration_name(path.display().to_string()))?;
            let sql = tokio::fs::read_to_string(path).await?;
            debug!(path = %path.display(), "Loaded migration script");
            self.add_script(file_name, sql)?;
        }

        info!(
            dir = %dir.display(),
            count = files.len(),
            "Registered migration scripts"
        );
        Ok(files.len())
    }
}

async fn collect_scripts(root: &Path) -> MigrateResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "sql") {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}
