//! Reconciliation of local migrations against the history table.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MigrateResult, MigrationError};
use crate::history::AppliedMigration;
use crate::migration::{Migration, MigrationState};
use crate::version::{MigrationVersion, SchemaVersion};

/// When a repeatable migration runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatablePolicy {
    /// Run on every migration run.
    #[default]
    Always,
    /// Run only when no successful history row with the same description
    /// carries the current checksum.
    OnChecksumChange,
}

/// Outcome of comparing local migrations with the history table.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// State of each local migration, in application order.
    pub states: Vec<MigrationState>,
    /// Index of the next migration to apply.
    pub next: Option<usize>,
    /// Highest successfully applied version.
    pub current_version: Option<SchemaVersion>,
}

impl Reconciliation {
    /// Indexes of all pending migrations.
    pub fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == MigrationState::Pending)
            .map(|(idx, _)| idx)
    }
}

/// Compare `migrations` with the `applied` history rows.
///
/// `ran` holds the indexes of repeatable migrations already executed during
/// the current run; they are never selected again. Fails on any drift
/// between the two sides.
pub fn reconcile(
    migrations: &[Migration],
    applied: &[AppliedMigration],
    ran: &HashSet<usize>,
    policy: RepeatablePolicy,
    schema: &str,
) -> MigrateResult<Reconciliation> {
    // Rows are in rank order, so later rows for a version win.
    let mut by_version: BTreeMap<SchemaVersion, &AppliedMigration> = BTreeMap::new();
    let mut repeatable_runs: HashMap<&str, &AppliedMigration> = HashMap::new();

    for row in applied {
        match MigrationVersion::parse(&row.version)? {
            MigrationVersion::Versioned(version) => {
                by_version.insert(version, row);
            }
            MigrationVersion::Repeatable => {
                if row.success {
                    repeatable_runs.insert(row.description.as_str(), row);
                }
            }
        }
    }

    let current_version = by_version
        .iter()
        .filter(|(_, row)| row.success)
        .map(|(version, _)| version.clone())
        .next_back();

    let mut unresolved: HashSet<&SchemaVersion> = by_version.keys().collect();
    let mut states = Vec::with_capacity(migrations.len());

    for (idx, migration) in migrations.iter().enumerate() {
        let version = match migration.version() {
            MigrationVersion::Versioned(version) => version,
            MigrationVersion::Repeatable => {
                let done = ran.contains(&idx)
                    || (policy == RepeatablePolicy::OnChecksumChange
                        && repeatable_runs
                            .get(migration.description())
                            .is_some_and(|row| row.checksum == migration.checksum()));
                states.push(if done {
                    MigrationState::Success
                } else {
                    MigrationState::Pending
                });
                continue;
            }
        };

        unresolved.remove(version);

        let state = match by_version.get(version) {
            None => {
                if let Some(current) = current_version.as_ref().filter(|c| version <= *c) {
                    return Err(MigrationError::OutOfOrderVersion {
                        schema: schema.to_string(),
                        current: current.to_string(),
                        version: version.to_string(),
                    });
                }
                MigrationState::Pending
            }
            Some(row) if !row.success => MigrationState::Pending,
            Some(row) => {
                if row.checksum != migration.checksum() {
                    let details = migration.describe_commands();
                    info!("{}", details);
                    return Err(MigrationError::ChecksumMismatch {
                        migration: migration.identifier(),
                        applied: row.checksum.clone(),
                        resolved: migration.checksum().to_string(),
                        details,
                    });
                }
                if row.description != migration.description() {
                    return Err(MigrationError::DescriptionMismatch {
                        migration: migration.identifier(),
                        applied: row.description.clone(),
                        resolved: migration.description().to_string(),
                    });
                }
                MigrationState::Success
            }
        };
        states.push(state);
    }

    if let Some(orphan) = unresolved.into_iter().min() {
        return Err(MigrationError::OrphanAppliedMigration(format!(
            "version {}",
            orphan
        )));
    }

    let next = states
        .iter()
        .position(|state| *state == MigrationState::Pending);

    Ok(Reconciliation {
        states,
        next,
        current_version,
    })
}
