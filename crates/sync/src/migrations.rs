//! Database migrations.
//!
//! Each migration is a named one-shot transformation applied when the
//! database is opened. A migration runs inside one write transaction and
//! records its name in the `Migrations` bucket before committing, so
//! progress and data never diverge. `remove_migration` deletes one record,
//! forcing a re-run on the next open.

use std::sync::Arc;

use strata_kv::buckets::MIGRATIONS;
use strata_kv::{KvStore, KvStoreExt, RwTx};

use crate::error::Result;

/// A named one-shot database transformation.
pub struct Migration {
    /// Unique, stable name. Presence in the `Migrations` bucket means
    /// "applied".
    pub name: &'static str,
    /// The transformation, run inside the migration's transaction.
    pub apply: Box<dyn Fn(&dyn RwTx) -> Result<()> + Send + Sync>,
}

/// The registered migrations, in application order.
///
/// Empty today; the mechanism stays wired so schema changes ship as
/// entries here.
pub fn registered() -> Vec<Migration> {
    Vec::new()
}

/// Applies every registered migration that is not yet recorded.
pub fn run_pending(db: &Arc<dyn KvStore>, migrations: &[Migration]) -> Result<usize> {
    let mut applied = 0;
    for migration in migrations {
        let done =
            db.view(|tx| Ok::<_, crate::SyncError>(tx.has(MIGRATIONS, migration.name.as_bytes())?))?;
        if done {
            continue;
        }
        tracing::info!(name = migration.name, "applying migration");
        db.update(|tx| {
            (migration.apply)(tx)?;
            tx.put(MIGRATIONS, migration.name.as_bytes(), b"")?;
            Ok::<_, crate::SyncError>(())
        })?;
        applied += 1;
    }
    Ok(applied)
}

/// Deletes one migration record so it re-runs on the next open.
pub fn remove(db: &Arc<dyn KvStore>, name: &str) -> Result<()> {
    db.update(|tx| {
        tx.delete(MIGRATIONS, name.as_bytes())?;
        Ok::<_, crate::SyncError>(())
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use strata_kv::buckets::DB_INFO;
    use strata_kv::MemKv;

    use super::*;
    use crate::progress::applied_migrations;

    fn test_migration(name: &'static str) -> Migration {
        Migration {
            name,
            apply: Box::new(|tx| {
                tx.put(DB_INFO, b"migrated", b"yes")?;
                Ok(())
            }),
        }
    }

    #[test]
    fn test_run_pending_applies_once() {
        let db: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let migrations = vec![test_migration("m1")];

        assert_eq!(run_pending(&db, &migrations).unwrap(), 1);
        assert_eq!(run_pending(&db, &migrations).unwrap(), 0);

        let names = db.view(|tx| applied_migrations(tx)).unwrap();
        assert_eq!(names, vec!["m1".to_string()]);
    }

    #[test]
    fn test_remove_forces_rerun() {
        let db: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let migrations = vec![test_migration("m1")];
        run_pending(&db, &migrations).unwrap();

        remove(&db, "m1").unwrap();
        assert!(db.view(|tx| applied_migrations(tx)).unwrap().is_empty());
        assert_eq!(run_pending(&db, &migrations).unwrap(), 1);
    }
}
