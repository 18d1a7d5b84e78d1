use std::io::Write;

use anyhow::{Context, Result};
use corral_app::{CorralConfig, RepositoryCache};
use corral_core::{CacheEntry, CacheKey};
use corral_git::{Git2Backend, GitBackend};
use corral_store::{EntryStore, FileEntryStore};
use time::format_description::well_known::Rfc3339;

use crate::{Command, LsFormat};

/// Cache as wired up by the CLI.
pub type Cache = RepositoryCache<FileEntryStore, Git2Backend>;

/// Build the cache described by `config`.
pub fn open_cache(config: CorralConfig) -> Result<Cache> {
    let entries = config.entry_store_dir();
    let store = FileEntryStore::open(&entries)
        .with_context(|| format!("failed to open entry store at {}", entries.display()))?;
    Ok(RepositoryCache::new(config, store, Git2Backend::new()))
}

pub fn run<S, G, W>(command: Command, cache: &RepositoryCache<S, G>, out: &mut W) -> Result<()>
where
    S: EntryStore,
    G: GitBackend,
    W: Write,
{
    match command {
        Command::Get {
            owner,
            url,
            branch,
            commit,
            full,
        } => {
            let key = CacheKey::new(&owner, &url, branch.as_deref(), commit.as_deref())?;
            let entry = cache.get(&key, !full)?;
            writeln!(
                out,
                "{}\t{}",
                entry.project_id,
                entry.abs_path(cache.root()).display()
            )?;
        }
        Command::Ls { format } => {
            let entries = cache.list()?;
            match format {
                LsFormat::Table => print_table(&entries, out)?,
                LsFormat::Json => {
                    serde_json::to_writer_pretty(&mut *out, &entries)?;
                    writeln!(out)?;
                }
            }
        }
        Command::Evict { project } => {
            if cache.evict_by_id(project)? {
                writeln!(out, "evicted {project}")?;
            } else {
                writeln!(out, "{project} is not cached")?;
            }
        }
        Command::Gc => {
            let report = cache.evict_expired()?;
            writeln!(
                out,
                "evicted {} of {} expired entries ({} in use, {} busy)",
                report.evicted.len(),
                report.expired(),
                report.referenced.len(),
                report.contended.len()
            )?;
        }
    }
    Ok(())
}

fn print_table<W: Write>(entries: &[CacheEntry], out: &mut W) -> Result<()> {
    writeln!(out, "{:<32}  {:<7}  {:<25}  KEY", "PROJECT", "DEPTH", "LAST ACCESS")?;
    for entry in entries {
        let depth = entry
            .clone_depth
            .map_or_else(|| "full".to_owned(), |depth| depth.to_string());
        let accessed = entry.accessed_at.format(&Rfc3339)?;
        writeln!(
            out,
            "{:<32}  {:<7}  {:<25}  {}",
            entry.project_id.to_string(),
            depth,
            accessed,
            entry.key
        )?;
    }
    Ok(())
}
