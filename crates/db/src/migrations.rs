use crate::Db;
use crate::error::Result;

const MIGRATION_0001: &str = include_str!("../migrations/0001_init.sql");
const MIGRATION_0002: &str = include_str!("../migrations/0002_add_closed_block.sql");

const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_init", MIGRATION_0001),
    ("0002_add_closed_block", MIGRATION_0002),
];

impl Db {
    /// Applies every migration. Each one is idempotent, so this is safe on every start.
    pub fn migrate(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (name, sql) in MIGRATIONS {
            tx.execute_batch(sql)?;
            tracing::trace!(migration = *name, "migration applied");
        }
        tx.commit()?;
        Ok(())
    }
}
