//! Migration registration and ordering.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::debug;

use crate::error::{MigrateResult, MigrationError};
use crate::migration::{Migration, MigrationCommand, Procedure, Procedures};
use crate::version::MigrationVersion;

/// Hook that appends commands to a migration. Invoked once per run.
pub type PrepareFn = dyn Fn(&mut Migration) + Send + Sync;

struct Registration {
    version: MigrationVersion,
    description: String,
    prepare: Arc<PrepareFn>,
}

/// The set of migrations and procedures for one migration target.
///
/// A registry is owned by the caller and handed to
/// [`Migrator::migrate`](crate::Migrator::migrate); nothing is registered
/// globally.
#[derive(Default)]
pub struct Registry {
    entries: Vec<Registration>,
    procedures: Procedures,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("migrations", &self.entries.len())
            .field("procedures", &self.procedures.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration.
    ///
    /// `version` is a semantic version or the repeatable marker `R`. The
    /// `prepare` hook appends the migration's commands; it runs when the
    /// registry is prepared, before the database is touched.
    pub fn register<F>(&mut self, version: &str, description: &str, prepare: F) -> MigrateResult<()>
    where
        F: Fn(&mut Migration) + Send + Sync + 'static,
    {
        let parsed = MigrationVersion::parse(version)?;

        if description.is_empty() {
            return Err(MigrationError::MissingDescription(version.to_string()));
        }
        let description: String = description
            .chars()
            .take(crate::migration::MAX_DESCRIPTION_LEN)
            .collect();

        if !parsed.is_repeatable() {
            if let Some(existing) = self.entries.iter().find(|e| e.version == parsed) {
                return Err(MigrationError::DuplicateVersion {
                    version: parsed.to_string(),
                    first: existing.description.clone(),
                    second: description,
                });
            }
        }

        debug!(version = %parsed, description = %description, "Registered migration");

        self.entries.push(Registration {
            version: parsed,
            description,
            prepare: Arc::new(prepare),
        });
        Ok(())
    }

    /// Register a named procedure that migrations can call.
    pub fn procedure(&mut self, name: impl Into<String>, procedure: impl Procedure + 'static) {
        self.procedures.insert(name.into(), Arc::new(procedure));
    }

    /// Number of registered migrations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no migrations are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sort the registered migrations and run their hooks.
    ///
    /// Versioned migrations come first in ascending semver order, followed by
    /// repeatable migrations in registration order. Fails if a hook panics or
    /// a command names an unregistered procedure.
    pub fn prepare(&self) -> MigrateResult<PreparedMigrations> {
        let mut entries: Vec<&Registration> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.version.cmp(&b.version));

        let mut migrations = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut migration = Migration::new(entry.version.clone(), &entry.description);
            let prepare = &entry.prepare;
            std::panic::catch_unwind(AssertUnwindSafe(|| prepare(&mut migration)))
                .map_err(MigrationError::from_panic)?;

            for command in migration.commands() {
                if let MigrationCommand::Procedure { name, .. } = command {
                    if !self.procedures.contains_key(name) {
                        return Err(MigrationError::UnknownProcedure {
                            migration: migration.identifier(),
                            procedure: name.clone(),
                        });
                    }
                }
            }

            migrations.push(migration);
        }

        Ok(PreparedMigrations {
            migrations,
            procedures: self.procedures.clone(),
        })
    }
}

/// Migrations in application order, with their commands populated.
pub struct PreparedMigrations {
    migrations: Vec<Migration>,
    procedures: Procedures,
}

impl PreparedMigrations {
    /// The migrations in application order.
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Procedures available to the migrations.
    pub fn procedures(&self) -> &Procedures {
        &self.procedures
    }
}

impl fmt::Debug for PreparedMigrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedMigrations")
            .field("migrations", &self.migrations)
            .finish_non_exhaustive()
    }
}
