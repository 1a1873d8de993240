//! Migration definitions and their commands.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::database::Executor;
use crate::error::{MigrateResult, MigrationError};
use crate::value::SqlValue;
use crate::version::MigrationVersion;

/// Maximum description length stored in the history table.
pub const MAX_DESCRIPTION_LEN: usize = 200;

/// Named procedures available to migrations, keyed by name.
pub type Procedures = HashMap<String, Arc<dyn Procedure>>;

/// State of a migration during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationState {
    /// Not applied yet.
    Pending,
    /// Applied successfully.
    Success,
    /// Applied and failed.
    Failed,
}

/// A named step implemented in Rust rather than SQL.
///
/// Procedures are registered on the [`Registry`](crate::Registry) and
/// referenced from migrations by name, so a migration's command list stays
/// plain data that can be described and checksummed.
#[async_trait]
pub trait Procedure: Send + Sync {
    /// Run the procedure inside the migration's transaction.
    async fn call(
        &self,
        db: &dyn Executor,
        migration: &Migration,
        args: &[SqlValue],
    ) -> MigrateResult<()>;
}

/// One executable step of a migration.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationCommand {
    /// A raw SQL statement with bound parameters.
    Sql {
        /// Statement text.
        sql: String,
        /// Bound parameters.
        params: Vec<SqlValue>,
    },
    /// A call to a registered procedure.
    Procedure {
        /// Procedure name.
        name: String,
        /// Procedure arguments.
        args: Vec<SqlValue>,
    },
}

impl MigrationCommand {
    /// The content that contributes to the migration checksum.
    pub fn checksum_content(&self) -> &str {
        match self {
            Self::Sql { sql, .. } => sql,
            Self::Procedure { name, .. } => name,
        }
    }

    /// Human readable description used in diagnostics.
    pub fn describe(&self) -> String {
        let (mut out, args) = match self {
            Self::Sql { sql, params } => (format!("{}\n", sql), params),
            Self::Procedure { name, args } => (format!("procedure {}\n", name), args),
        };
        for (i, arg) in args.iter().enumerate() {
            let _ = writeln!(out, "    ${} = {}", i + 1, arg);
        }
        out
    }

    /// Execute the command.
    pub async fn execute(
        &self,
        db: &dyn Executor,
        migration: &Migration,
        procedures: &Procedures,
    ) -> MigrateResult<()> {
        match self {
            Self::Sql { sql, params } => {
                db.execute(sql, params).await?;
                Ok(())
            }
            Self::Procedure { name, args } => {
                let procedure =
                    procedures
                        .get(name)
                        .ok_or_else(|| MigrationError::UnknownProcedure {
                            migration: migration.identifier(),
                            procedure: name.clone(),
                        })?;
                procedure.call(db, migration, args).await
            }
        }
    }
}

/// A versioned unit of schema change.
///
/// Commands are appended while the registration hook runs; afterwards the
/// migration is only handed out by shared reference.
#[derive(Debug, Clone)]
pub struct Migration {
    version: MigrationVersion,
    description: String,
    checksum: String,
    commands: Vec<MigrationCommand>,
}

impl Migration {
    /// Create an empty migration. Descriptions longer than
    /// [`MAX_DESCRIPTION_LEN`] characters are truncated.
    pub fn new(version: MigrationVersion, description: &str) -> Self {
        Self {
            version,
            description: truncate_description(description),
            checksum: String::new(),
            commands: Vec::new(),
        }
    }

    /// Schedule an SQL statement without parameters.
    pub fn exec_sql(&mut self, sql: impl Into<String>) -> &mut Self {
        self.exec_sql_with(sql, Vec::new())
    }

    /// Schedule an SQL statement with bound parameters.
    pub fn exec_sql_with(&mut self, sql: impl Into<String>, params: Vec<SqlValue>) -> &mut Self {
        self.push(MigrationCommand::Sql {
            sql: sql.into(),
            params,
        })
    }

    /// Schedule a call to a registered procedure.
    pub fn call(&mut self, name: impl Into<String>, args: Vec<SqlValue>) -> &mut Self {
        self.push(MigrationCommand::Procedure {
            name: name.into(),
            args,
        })
    }

    fn push(&mut self, command: MigrationCommand) -> &mut Self {
        let content_hash = md5_hex(command.checksum_content());
        self.checksum = md5_hex(&format!("{}{}", self.checksum, content_hash));
        self.commands.push(command);
        self
    }

    /// The migration version.
    pub fn version(&self) -> &MigrationVersion {
        &self.version
    }

    /// The migration description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The rolling checksum of all commands.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// The scheduled commands, in order.
    pub fn commands(&self) -> &[MigrationCommand] {
        &self.commands
    }

    /// Check if this is a repeatable migration.
    pub fn is_repeatable(&self) -> bool {
        self.version.is_repeatable()
    }

    /// Identifier used in error messages.
    pub fn identifier(&self) -> String {
        match &self.version {
            MigrationVersion::Versioned(v) => format!("version {}", v),
            MigrationVersion::Repeatable => {
                format!("repeatable migration '{}'", self.description)
            }
        }
    }

    /// Text used in progress logs.
    pub fn migration_text(&self) -> String {
        format!("schema to version {} ({})", self.version, self.description)
    }

    /// Listing of all commands, logged when drift is detected.
    pub fn describe_commands(&self) -> String {
        let rule = "-".repeat(78);
        let mut out = format!(
            "\n{rule}\nMigration - {} - {}\n{rule}\n",
            self.identifier(),
            self.description
        );
        for (i, cmd) in self.commands.iter().enumerate() {
            let _ = writeln!(out, "-- ({})", i + 1);
            out.push_str(&cmd.describe());
        }
        out.push_str(&rule);
        out.push('\n');
        out
    }
}

fn truncate_description(description: &str) -> String {
    description.chars().take(MAX_DESCRIPTION_LEN).collect()
}

fn md5_hex(content: &str) -> String {
    hex::encode(Md5::digest(content.as_bytes()))
}
