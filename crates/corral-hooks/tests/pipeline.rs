#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use corral_core::{Error, ErrorKind, ProjectId, WorkingCopy};
use corral_git::fixtures::{DEFAULT_BRANCH, RemoteFixture};
use corral_git::{CloneSpec, Git2Backend, GitBackend, Worktree};
use corral_hooks::{
    CommitPolicy, Pipeline, PipelineConfig, PipelineContext, RunOptions, SchemaMigrations, Stage,
};
use corral_lock::{LockMode, RepositoryLock};
use tempfile::TempDir;

struct Fixture {
    _temp: TempDir,
    remote: RemoteFixture,
    wc: WorkingCopy,
}

fn setup() -> Result<Fixture> {
    let temp = TempDir::new()?;
    let remote = RemoteFixture::create(temp.path(), "acme", "data")?;
    let path = temp.path().join("cache").join("wc");
    let spec = CloneSpec {
        branch: Some(DEFAULT_BRANCH.to_owned()),
        ..CloneSpec::default()
    };
    Git2Backend::new().clone_repo(&remote.url, &path, &spec)?;
    let wc = WorkingCopy {
        project_id: ProjectId::new(),
        lock_path: temp.path().join("cache").join("wc.lock"),
        path,
        branch: Some(DEFAULT_BRANCH.to_owned()),
    };
    Ok(Fixture {
        _temp: temp,
        remote,
        wc,
    })
}

fn pipeline_with(migrations: SchemaMigrations) -> Pipeline {
    Pipeline::standard(
        &PipelineConfig::default(),
        Arc::new(migrations),
        Arc::new(Git2Backend::new()),
    )
}

fn pipeline() -> Pipeline {
    pipeline_with(SchemaMigrations::new())
}

fn write(ctx: &PipelineContext<'_>, rel: &str, contents: &str) -> corral_core::Result<()> {
    let path = ctx.working_copy().path.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| Error::internal("write", None, err))?;
    }
    fs::write(path, contents).map_err(|err| Error::internal("write", None, err))
}

fn head_message(wc: &WorkingCopy) -> Result<String> {
    let worktree = Worktree::open(&wc.path)?;
    let commit = worktree.repository().head()?.peel_to_commit()?;
    Ok(commit.message().unwrap_or_default().to_owned())
}

fn commit_count(wc: &WorkingCopy) -> Result<usize> {
    Ok(Worktree::open(&wc.path)?.commit_count()?)
}

fn lock_is_free(wc: &WorkingCopy) -> bool {
    RepositoryLock::try_acquire(&wc.lock_path, LockMode::Write).is_ok()
}

#[test]
fn standard_hook_order() {
    assert_eq!(pipeline().hook_names(), vec!["migration-gate", "lock", "sync", "commit"]);

    let config = PipelineConfig {
        disabled: vec!["sync".to_owned()],
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::standard(
        &config,
        Arc::new(SchemaMigrations::new()),
        Arc::new(Git2Backend::new()),
    );
    assert_eq!(pipeline.hook_names(), vec!["migration-gate", "lock", "commit"]);
}

#[test]
fn write_run_commits_body_changes_once() -> Result<()> {
    let fx = setup()?;
    let before = commit_count(&fx.wc)?;

    let (result, trail) = pipeline().run_with_trail(&fx.wc, RunOptions::write("edit"), |ctx| {
        assert_eq!(ctx.stage(), Stage::Running);
        write(ctx, "data/a.csv", "a\n")?;
        write(ctx, "notes.md", "notes\n")?;
        Ok(42)
    });

    assert_eq!(result?, 42);
    assert_eq!(
        trail,
        vec![Stage::Init, Stage::Locked, Stage::Running, Stage::Committing, Stage::Done]
    );
    assert_eq!(commit_count(&fx.wc)?, before + 1);
    assert_eq!(head_message(&fx.wc)?, "corral: edit");
    assert!(Worktree::open(&fx.wc.path)?.is_clean()?);
    assert!(lock_is_free(&fx.wc));
    Ok(())
}

#[test]
fn unchanged_write_run_makes_no_commit() -> Result<()> {
    let fx = setup()?;
    let before = commit_count(&fx.wc)?;
    pipeline().run(&fx.wc, RunOptions::write("noop"), |_| Ok(()))?;
    assert_eq!(commit_count(&fx.wc)?, before);
    Ok(())
}

#[test]
fn failing_body_commits_nothing_and_releases_lock() -> Result<()> {
    let fx = setup()?;
    let before = commit_count(&fx.wc)?;

    let (result, trail) = pipeline().run_with_trail(&fx.wc, RunOptions::write("edit"), |ctx| {
        write(ctx, "partial.txt", "half\n")?;
        Err::<(), _>(Error::validation("input", "bad input"))
    });

    assert!(matches!(result, Err(Error::Validation { field: "input", .. })));
    assert_eq!(trail.last(), Some(&Stage::Failed));
    assert!(!trail.contains(&Stage::Committing));
    assert_eq!(commit_count(&fx.wc)?, before);
    // Partial writes stay on disk; they are simply never committed.
    assert!(fx.wc.path.join("partial.txt").is_file());
    assert!(lock_is_free(&fx.wc));
    Ok(())
}

#[test]
fn leftovers_of_a_failed_run_stay_out_of_the_next_commit() -> Result<()> {
    let fx = setup()?;
    let before = commit_count(&fx.wc)?;

    let failed = pipeline().run(&fx.wc, RunOptions::write("a"), |ctx| {
        write(ctx, "half-written.txt", "half\n")?;
        Err::<(), _>(Error::validation("input", "bad input"))
    });
    assert!(failed.is_err());

    pipeline().run(&fx.wc, RunOptions::write("b"), |ctx| write(ctx, "b.txt", "b\n"))?;

    assert_eq!(commit_count(&fx.wc)?, before + 1);
    assert_eq!(head_message(&fx.wc)?, "corral: b");
    let worktree = Worktree::open(&fx.wc.path)?;
    let head = worktree.repository().head()?.peel_to_tree()?;
    assert!(head.get_path(std::path::Path::new("b.txt")).is_ok());
    assert!(head.get_path(std::path::Path::new("half-written.txt")).is_err());
    assert_eq!(worktree.changed_paths()?, vec!["half-written.txt".to_owned()]);

    // With nothing new of its own, a later run commits nothing.
    pipeline().run(&fx.wc, RunOptions::write("c"), |_| Ok(()))?;
    assert_eq!(commit_count(&fx.wc)?, before + 1);
    Ok(())
}

#[test]
fn panicking_body_releases_lock() -> Result<()> {
    let fx = setup()?;
    let pipeline = pipeline();

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        pipeline.run(&fx.wc, RunOptions::write("explode"), |_| -> corral_core::Result<()> {
            panic!("body exploded");
        })
    }));

    assert!(outcome.is_err());
    assert!(lock_is_free(&fx.wc));
    Ok(())
}

#[test]
fn lock_is_held_for_the_body() -> Result<()> {
    let fx = setup()?;
    pipeline().run(&fx.wc, RunOptions::write("edit"), |ctx| {
        let lock_path = &ctx.working_copy().lock_path;
        assert!(RepositoryLock::try_acquire(lock_path, LockMode::Read).is_err());
        Ok(())
    })?;

    pipeline().run(&fx.wc, RunOptions::read("show"), |ctx| {
        let lock_path = &ctx.working_copy().lock_path;
        assert!(RepositoryLock::try_acquire(lock_path, LockMode::Read).is_ok());
        assert!(RepositoryLock::try_acquire(lock_path, LockMode::Write).is_err());
        Ok(())
    })?;
    Ok(())
}

#[test]
fn second_writer_times_out_while_first_holds_lock() -> Result<()> {
    let fx = setup()?;
    let pipeline = pipeline();
    let (locked_tx, locked_rx) = mpsc::channel();

    thread::scope(|scope| -> Result<()> {
        let holder = scope.spawn(|| {
            pipeline.run(&fx.wc, RunOptions::write("slow"), |_| {
                locked_tx.send(()).ok();
                thread::sleep(Duration::from_millis(400));
                Ok(())
            })
        });
        locked_rx.recv()?;

        let started = Instant::now();
        let options = RunOptions::write("impatient").with_lock_timeout(Duration::from_millis(50));
        let err = pipeline.run(&fx.wc, options, |_| Ok(())).err();
        assert!(started.elapsed() < Duration::from_millis(400));
        let err = err.expect("lock should be contended");
        assert!(matches!(err, Error::LockContention { .. }));
        assert_eq!(err.kind(), ErrorKind::Intermittent);
        assert!(err.is_retryable());

        let options = RunOptions::write("patient").with_lock_timeout(Duration::from_secs(10));
        pipeline.run(&fx.wc, options, |_| Ok(()))?;

        holder.join().expect("holder thread")?;
        Ok(())
    })
}

#[test]
fn requires_clean_rejects_dirty_working_copy() -> Result<()> {
    let fx = setup()?;
    fs::write(fx.wc.path.join("stray.txt"), "left over\n")?;

    let mut ran = false;
    let options = RunOptions::write("edit").requiring_clean();
    let err = pipeline()
        .run(&fx.wc, options, |_| {
            ran = true;
            Ok(())
        })
        .err();

    assert!(!ran);
    match err {
        Some(Error::RepositoryNotClean { paths }) => assert_eq!(paths, vec!["stray.txt".to_owned()]),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(lock_is_free(&fx.wc));
    Ok(())
}

#[test]
fn commit_paths_limit_what_is_committed() -> Result<()> {
    let fx = setup()?;
    let options = RunOptions::write("dataset.add").with_commit_paths(["data"]);
    pipeline().run(&fx.wc, options, |ctx| {
        write(ctx, "data/a.csv", "a\n")?;
        write(ctx, "scratch.txt", "not for git\n")?;
        Ok(())
    })?;

    let worktree = Worktree::open(&fx.wc.path)?;
    assert_eq!(worktree.changed_paths()?, vec!["scratch.txt".to_owned()]);
    let head = worktree.repository().head()?.peel_to_tree()?;
    assert!(head.get_path(std::path::Path::new("data/a.csv")).is_ok());
    Ok(())
}

#[test]
fn commit_policies() -> Result<()> {
    let fx = setup()?;
    let before = commit_count(&fx.wc)?;

    let required = RunOptions::write("strict").with_commit(CommitPolicy::RequireChanges);
    let err = pipeline().run(&fx.wc, required, |_| Ok(())).err();
    assert!(matches!(err, Some(Error::NothingToCommit)));

    let always = RunOptions::write("mark").with_commit(CommitPolicy::Always);
    pipeline().run(&fx.wc, always, |_| Ok(()))?;
    assert_eq!(commit_count(&fx.wc)?, before + 1);

    let never = RunOptions::write("scratch").with_commit(CommitPolicy::Never);
    pipeline().run(&fx.wc, never, |ctx| write(ctx, "tmp.txt", "x\n"))?;
    assert_eq!(commit_count(&fx.wc)?, before + 1);
    Ok(())
}

#[test]
fn invalid_options_fail_before_any_hook() -> Result<()> {
    let fx = setup()?;
    let options = RunOptions::read("show").with_push(true);
    let (result, trail) = pipeline().run_with_trail(&fx.wc, options, |_| Ok(()));
    assert!(matches!(result, Err(Error::Validation { field: "commit", .. })));
    assert_eq!(trail, vec![Stage::Init, Stage::Failed]);
    Ok(())
}

fn one_step_migrations() -> SchemaMigrations {
    SchemaMigrations::new().with_step(|root| {
        fs::write(root.join("LAYOUT"), "v1\n").map_err(|err| Error::internal("migrate", None, err))
    })
}

#[test]
fn outdated_project_requires_migration() -> Result<()> {
    let fx = setup()?;
    let mut ran = false;
    let options = RunOptions::write("edit").with_migration_check(false);
    let err = pipeline_with(one_step_migrations())
        .run(&fx.wc, options, |_| {
            ran = true;
            Ok(())
        })
        .err();

    assert!(!ran);
    let err = err.expect("migration should be required");
    assert!(matches!(err, Error::MigrationRequired { current: 0, supported: 1 }));
    assert_eq!(err.kind(), ErrorKind::User);
    assert!(lock_is_free(&fx.wc));
    Ok(())
}

#[test]
fn migration_runs_as_its_own_commit_before_the_body() -> Result<()> {
    let fx = setup()?;
    let before = commit_count(&fx.wc)?;
    let options = RunOptions::write("edit").with_migration_check(true);

    let (result, trail) = pipeline_with(one_step_migrations()).run_with_trail(&fx.wc, options, |ctx| {
        assert!(ctx.working_copy().path.join("LAYOUT").is_file());
        write(ctx, "data/a.csv", "a\n")
    });

    result?;
    assert_eq!(
        trail,
        vec![
            Stage::Init,
            Stage::MigrationCheck,
            Stage::Locked,
            Stage::Running,
            Stage::Committing,
            Stage::Done
        ]
    );
    assert_eq!(commit_count(&fx.wc)?, before + 2);
    let worktree = Worktree::open(&fx.wc.path)?;
    let head = worktree.repository().head()?.peel_to_commit()?;
    let parent = head.parent(0)?;
    assert_eq!(parent.message(), Some("migrate project metadata to schema v1"));

    // Already current: the gate lets the next run through without migrating.
    let options = RunOptions::write("edit-again").with_migration_check(false);
    pipeline_with(one_step_migrations()).run(&fx.wc, options, |_| Ok(()))?;
    assert_eq!(commit_count(&fx.wc)?, before + 2);
    Ok(())
}

#[test]
fn push_publishes_the_commit() -> Result<()> {
    let fx = setup()?;
    let options = RunOptions::write("publish").with_push(true);
    pipeline().run(&fx.wc, options, |ctx| write(ctx, "published.txt", "hello\n"))?;

    let local = Worktree::open(&fx.wc.path)?.head_oid()?;
    assert_eq!(local, Some(fx.remote.remote_tip(DEFAULT_BRANCH)?));
    Ok(())
}

#[test]
fn push_is_skipped_without_a_commit() -> Result<()> {
    let fx = setup()?;
    let tip = fx.remote.remote_tip(DEFAULT_BRANCH)?;
    let options = RunOptions::write("publish").with_push(true);
    pipeline().run(&fx.wc, options, |_| Ok(()))?;
    assert_eq!(fx.remote.remote_tip(DEFAULT_BRANCH)?, tip);
    Ok(())
}
