//! Error types for the migration engine.

use thiserror::Error;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database operation error.
    #[error("Database error: {0}")]
    Database(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The version is neither the repeatable marker nor a semantic version.
    #[error("migration has an invalid semantic version ({0})")]
    InvalidVersion(String),

    /// A migration was registered without a description.
    #[error("migration description is required (v{0})")]
    MissingDescription(String),

    /// Two non-repeatable migrations share a version.
    #[error(
        "found more than one migration with version {version}\nOffenders:\n-> {first}\n-> {second}"
    )]
    DuplicateVersion {
        /// The duplicated version.
        version: String,
        /// Description of the migration registered first.
        first: String,
        /// Description of the migration registered second.
        second: String,
    },

    /// A script file name does not follow `v<version>_<description>.sql`.
    #[error("invalid migration name: {0}")]
    InvalidMigrationName(String),

    /// A command references a procedure that was never registered.
    #[error("migration {migration} calls unknown procedure '{procedure}'")]
    UnknownProcedure {
        /// Migration identifier.
        migration: String,
        /// Procedure name.
        procedure: String,
    },

    /// The commands of an applied migration changed locally.
    #[error(
        "Migration checksum mismatch for migration {migration}\n\
         -> Applied to database : {applied}\n\
         -> Resolved locally    : {resolved}. \
         Revert the changes to the migration, or update the schema history."
    )]
    ChecksumMismatch {
        /// Migration identifier.
        migration: String,
        /// Checksum recorded in the ledger.
        applied: String,
        /// Checksum of the local definition.
        resolved: String,
        /// Listing of the local commands, for diagnosis.
        details: String,
    },

    /// The description of an applied migration changed locally.
    #[error(
        "Migration description mismatch for migration {migration}\n\
         -> Applied to database : {applied}\n\
         -> Resolved locally    : {resolved}. \
         Revert the changes to the migration, or update the schema history."
    )]
    DescriptionMismatch {
        /// Migration identifier.
        migration: String,
        /// Description recorded in the ledger.
        applied: String,
        /// Description of the local definition.
        resolved: String,
    },

    /// A local migration is older than the schema but was never applied.
    #[error(
        "Schema {schema} has a version ({current}) that is newer than the available migration ({version})"
    )]
    OutOfOrderVersion {
        /// Schema holding the history table.
        schema: String,
        /// Highest successfully applied version.
        current: String,
        /// The unapplied local version.
        version: String,
    },

    /// The ledger records a migration that no longer exists locally.
    #[error("Detected applied migration not resolved locally: {0}")]
    OrphanAppliedMigration(String),

    /// `with_lock` was entered while the lock was already held.
    #[error("schema history table is already locked")]
    AlreadyLocked,

    /// A ledger write was attempted without holding the lock.
    #[error("method can only be invoked when the schema history table is locked")]
    NotLocked,

    /// Lock acquisition failed.
    #[error("Unable to lock schema history table (cause: {0})")]
    LockFailed(String),

    /// A migration command failed; its transaction was rolled back.
    #[error("Migration of {migration} failed!\n    Caused by: {source}")]
    ApplyFailed {
        /// Human readable migration text.
        migration: String,
        /// The command failure.
        #[source]
        source: Box<MigrationError>,
    },

    /// A panic escaped a transactional body.
    #[error("unexpected fault: {message}\n{backtrace}")]
    Panic {
        /// Panic payload, when it was a string.
        message: String,
        /// Backtrace captured where the fault was caught.
        backtrace: String,
    },
}

impl MigrationError {
    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a lock failed error.
    pub fn lock_failed(msg: impl Into<String>) -> Self {
        Self::LockFailed(msg.into())
    }

    /// Create an invalid migration name error.
    pub fn migration_name(msg: impl Into<String>) -> Self {
        Self::InvalidMigrationName(msg.into())
    }

    /// Convert a caught panic payload into an error.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };

        Self::Panic {
            message,
            backtrace: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }

    /// Check if this error was raised while registering migrations.
    pub fn is_registration(&self) -> bool {
        matches!(
            self,
            Self::InvalidVersion(_)
                | Self::MissingDescription(_)
                | Self::DuplicateVersion { .. }
                | Self::InvalidMigrationName(_)
                | Self::UnknownProcedure { .. }
        )
    }

    /// Check if this error reports drift between local migrations and the ledger.
    pub fn is_drift(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. }
                | Self::DescriptionMismatch { .. }
                | Self::OutOfOrderVersion { .. }
                | Self::OrphanAppliedMigration(_)
        )
    }
}
