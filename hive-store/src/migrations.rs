//! Schema marker and migrations.
//!
//! The schema name is stored in the meta table. Each migration moves the
//! database from one named schema to the next; on open the chain is walked
//! from the stored name until the current one is reached.

use redb::{Database, WriteTransaction};
use snafu::OptionExt;
use tracing::{debug, info};

use crate::{
    error::{LocalStoreError, UnknownSchemaSnafu},
    tables::{META_TABLE, SCHEMA_NAME},
};

/// Schema of a freshly created store.
pub const SCHEMA_INITIAL: &str = "initial";
/// Schema the code reads and writes.
pub const SCHEMA_CURRENT: &str = "sharky";

struct Migration {
    from: &'static str,
    to: &'static str,
    run: fn(&WriteTransaction) -> Result<MigrateOutcome, LocalStoreError>,
}

enum MigrateOutcome {
    Skip,
    /// Rows rewritten, for migrations that move data.
    #[allow(dead_code)]
    Execute(usize),
}

const MIGRATIONS: &[Migration] = &[Migration {
    from: SCHEMA_INITIAL,
    to: SCHEMA_CURRENT,
    run: migration_001_sharky,
}];

/// Reads the stored schema name, [`SCHEMA_INITIAL`] for a fresh store.
pub fn schema_name(db: &Database) -> Result<String, LocalStoreError> {
    let tx = db.begin_read()?;
    let table = tx.open_table(META_TABLE)?;
    let name = match table.get(SCHEMA_NAME)? {
        Some(v) => String::from_utf8_lossy(v.value()).into_owned(),
        None => SCHEMA_INITIAL.to_string(),
    };
    Ok(name)
}

/// Run all database migrations, if needed.
pub fn run_migrations(db: &Database) -> Result<(), LocalStoreError> {
    let mut current = schema_name(db)?;
    while current != SCHEMA_CURRENT {
        let migration = MIGRATIONS
            .iter()
            .find(|m| m.from == current)
            .context(UnknownSchemaSnafu {
                name: current.clone(),
            })?;
        run_migration(db, migration)?;
        current = migration.to.to_string();
    }
    Ok(())
}

fn run_migration(db: &Database, migration: &Migration) -> Result<(), LocalStoreError> {
    let tx = db.begin_write()?;
    debug!("start migration {} -> {}", migration.from, migration.to);
    match (migration.run)(&tx)? {
        MigrateOutcome::Execute(len) => {
            info!(
                "executed migration {} -> {} ({len} rows affected)",
                migration.from, migration.to
            );
        }
        MigrateOutcome::Skip => debug!("skip migration {}: not needed", migration.from),
    }
    {
        let mut meta = tx.open_table(META_TABLE)?;
        meta.insert(SCHEMA_NAME, migration.to.as_bytes())?;
    }
    tx.commit()?;
    Ok(())
}

/// migration 001: chunks live in sharky from the start, nothing to move.
fn migration_001_sharky(_tx: &WriteTransaction) -> Result<MigrateOutcome, LocalStoreError> {
    Ok(MigrateOutcome::Skip)
}

#[cfg(test)]
mod tests {
    use redb::backends::InMemoryBackend;

    use super::*;

    fn db() -> Database {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .unwrap();
        let tx = db.begin_write().unwrap();
        tx.open_table(META_TABLE).unwrap();
        tx.commit().unwrap();
        db
    }

    #[test]
    fn fresh_store_migrates_to_current() {
        let db = db();
        assert_eq!(schema_name(&db).unwrap(), SCHEMA_INITIAL);
        run_migrations(&db).unwrap();
        assert_eq!(schema_name(&db).unwrap(), SCHEMA_CURRENT);
        // idempotent
        run_migrations(&db).unwrap();
    }

    #[test]
    fn unknown_schema() {
        let db = db();
        let tx = db.begin_write().unwrap();
        tx.open_table(META_TABLE)
            .unwrap()
            .insert(SCHEMA_NAME, b"from-the-future".as_slice())
            .unwrap();
        tx.commit().unwrap();
        assert!(matches!(
            run_migrations(&db),
            Err(LocalStoreError::UnknownSchema { .. })
        ));
    }
}
