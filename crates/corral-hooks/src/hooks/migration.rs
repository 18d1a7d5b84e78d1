use std::fs;
use std::path::Path;
use std::sync::Arc;

use corral_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::hook::Hook;
use crate::types::{MigrationChecked, PipelineContext, RunOptions, Stage};

/// Project metadata file, relative to the working-copy root.
pub const METADATA_FILE: &str = ".corral/metadata.toml";

/// Source of the project's metadata schema version and its upgrades.
pub trait Migrations: Send + Sync {
    /// Newest schema version this build understands.
    fn supported_version(&self) -> u32;

    /// Schema version of the project at `root`.
    ///
    /// # Errors
    /// Implementation specific; usually [`Error::Internal`] for unreadable metadata.
    fn current_version(&self, root: &Path) -> Result<u32>;

    /// Upgrade the project at `root` and return its new version.
    ///
    /// # Errors
    /// Implementation specific.
    fn migrate(&self, root: &Path) -> Result<u32>;

    /// Paths a migration may touch; everything when `None`.
    fn commit_paths(&self) -> Option<Vec<String>> {
        None
    }
}

/// One upgrade step from version `n` to `n + 1`.
pub type MigrationStep = Box<dyn Fn(&Path) -> Result<()> + Send + Sync>;

fn metadata_error(action: &'static str, cause: impl std::fmt::Display) -> Error {
    let error = Error::internal(action, None, &cause);
    if let Some(correlation_id) = error.correlation_id() {
        warn!(%correlation_id, error = %cause, "{action} failed");
    }
    error
}

#[derive(Debug, Serialize, Deserialize)]
struct ProjectMetadata {
    schema_version: u32,
}

/// [`Migrations`] backed by [`METADATA_FILE`] and an ordered list of steps.
///
/// The supported version is the number of registered steps. A project without
/// metadata is at version 0, unless the working copy holds nothing but its git
/// directory, in which case it is treated as current.
#[derive(Default)]
pub struct SchemaMigrations {
    steps: Vec<MigrationStep>,
}

impl std::fmt::Debug for SchemaMigrations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaMigrations")
            .field("supported_version", &self.steps.len())
            .finish()
    }
}

impl SchemaMigrations {
    /// No steps; every project is current.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step upgrading from the current supported version.
    #[must_use]
    pub fn with_step(mut self, step: impl Fn(&Path) -> Result<()> + Send + Sync + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    fn read_metadata(path: &Path) -> Result<u32> {
        let raw = fs::read_to_string(path)
            .map_err(|err| metadata_error("read project metadata", err))?;
        let metadata: ProjectMetadata = toml::from_str(&raw)
            .map_err(|err| metadata_error("parse project metadata", err))?;
        Ok(metadata.schema_version)
    }

    fn write_metadata(root: &Path, version: u32) -> Result<()> {
        let path = root.join(METADATA_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| metadata_error("create metadata directory", err))?;
        }
        let raw = toml::to_string(&ProjectMetadata {
            schema_version: version,
        })
        .map_err(|err| metadata_error("encode project metadata", err))?;
        fs::write(&path, raw).map_err(|err| metadata_error("write project metadata", err))
    }
}

fn holds_only_git_dir(root: &Path) -> Result<bool> {
    let entries =
        fs::read_dir(root).map_err(|err| metadata_error("list working copy", err))?;
    for entry in entries {
        let entry = entry.map_err(|err| metadata_error("list working copy", err))?;
        if entry.file_name() != ".git" {
            return Ok(false);
        }
    }
    Ok(true)
}

impl Migrations for SchemaMigrations {
    fn supported_version(&self) -> u32 {
        u32::try_from(self.steps.len()).unwrap_or(u32::MAX)
    }

    fn current_version(&self, root: &Path) -> Result<u32> {
        let path = root.join(METADATA_FILE);
        if path.is_file() {
            return Self::read_metadata(&path);
        }
        if holds_only_git_dir(root)? {
            return Ok(self.supported_version());
        }
        Ok(0)
    }

    fn migrate(&self, root: &Path) -> Result<u32> {
        let mut version = self.current_version(root)?;
        let supported = self.supported_version();
        while version < supported {
            let step = self
                .steps
                .get(usize::try_from(version).unwrap_or(usize::MAX))
                .ok_or_else(|| metadata_error("migrate project metadata", "missing step"))?;
            step(root)?;
            version += 1;
            Self::write_metadata(root, version)?;
            debug!(version, "migration step applied");
        }
        Ok(version)
    }
}

/// Checks the project's schema version before the lock is taken.
///
/// An outdated project fails with [`Error::MigrationRequired`] unless the run
/// asked for migration, in which case the upgrade runs as its own write-locked,
/// committed pipeline run before this one continues.
pub struct MigrationGate {
    migrations: Arc<dyn Migrations>,
}

impl MigrationGate {
    /// Gate consulting `migrations`.
    #[must_use]
    pub fn new(migrations: Arc<dyn Migrations>) -> Self {
        Self { migrations }
    }
}

impl Hook for MigrationGate {
    fn name(&self) -> &'static str {
        "migration-gate"
    }

    fn stage(&self) -> Stage {
        Stage::MigrationCheck
    }

    fn before(&self, ctx: &mut PipelineContext<'_>) -> Result<()> {
        if !ctx.options().requires_migration_check || ctx.state::<MigrationChecked>().is_some() {
            return Ok(());
        }
        ctx.advance(Stage::MigrationCheck);

        let root = &ctx.working_copy().path;
        let current = self.migrations.current_version(root)?;
        let supported = self.migrations.supported_version();
        if current > supported {
            return Err(Error::validation(
                "schema_version",
                format!("project schema v{current} is newer than supported v{supported}"),
            ));
        }
        if current < supported {
            if !ctx.options().migrate_if_required {
                return Err(Error::MigrationRequired { current, supported });
            }
            let mut options = RunOptions::write("migrate")
                .with_commit_message(format!("migrate project metadata to schema v{supported}"));
            options.commit_paths = self.migrations.commit_paths();
            options.lock_timeout = ctx.options().lock_timeout;
            let migrations = Arc::clone(&self.migrations);
            ctx.pipeline().run(ctx.working_copy(), options, |inner| {
                let root = &inner.working_copy().path;
                // Another writer may have migrated while we waited for the lock.
                if migrations.current_version(root)? >= supported {
                    return Ok(());
                }
                migrations.migrate(root).map(drop)
            })?;
            info!(from = current, to = supported, "project metadata migrated");
        }
        ctx.insert_state(MigrationChecked { version: supported });
        Ok(())
    }
}
