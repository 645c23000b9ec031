use crate::db::Db;
use crate::error::Result;
use rusqlite::{OptionalExtension, params};

/// Lookups over the builder / build / step graph that the router walks.
///
/// Only the columns needed for addressing live here; build-step business
/// logic is an external collaborator.
#[derive(Debug, Clone)]
pub struct EntityStore {
    db: Db,
}

impl EntityStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Find a builder by name, creating the row on first use.
    pub fn find_builder_id(&self, name: &str) -> Result<i64> {
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO builders (name) VALUES (?1)",
            params![name],
        )?;
        let id = conn.query_row(
            "SELECT id FROM builders WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_builder_id_by_name(&self, name: &str) -> Result<Option<i64>> {
        let conn = self.db.conn()?;
        let id = conn
            .query_row(
                "SELECT id FROM builders WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn add_build(&self, builder_id: i64, number: i64) -> Result<i64> {
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO builds (builder_id, number) VALUES (?1, ?2)",
            params![builder_id, number],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_build_id(&self, builder_id: i64, number: i64) -> Result<Option<i64>> {
        let conn = self.db.conn()?;
        let id = conn
            .query_row(
                "SELECT id FROM builds WHERE builder_id = ?1 AND number = ?2",
                params![builder_id, number],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn add_step(&self, build_id: i64, number: i64, name: &str) -> Result<i64> {
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO steps (build_id, number, name) VALUES (?1, ?2, ?3)",
            params![build_id, number, name],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_step_id_by_name(&self, build_id: i64, name: &str) -> Result<Option<i64>> {
        let conn = self.db.conn()?;
        let id = conn
            .query_row(
                "SELECT id FROM steps WHERE build_id = ?1 AND name = ?2",
                params![build_id, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn get_step_id_by_number(&self, build_id: i64, number: i64) -> Result<Option<i64>> {
        let conn = self.db.conn()?;
        let id = conn
            .query_row(
                "SELECT id FROM steps WHERE build_id = ?1 AND number = ?2",
                params![build_id, number],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, EntityStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = Db::open(temp_dir.path().join("kiln.db")).unwrap();
        (temp_dir, EntityStore::new(db))
    }

    #[test]
    fn test_find_builder_id_is_get_or_create() {
        let (_t, store) = store();
        let a = store.find_builder_id("runtests").unwrap();
        let b = store.find_builder_id("runtests").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.get_builder_id_by_name("runtests").unwrap(), Some(a));
        assert_eq!(store.get_builder_id_by_name("missing").unwrap(), None);
    }

    #[test]
    fn test_build_and_step_lookups() {
        let (_t, store) = store();
        let builder_id = store.find_builder_id("runtests").unwrap();
        let build_id = store.add_build(builder_id, 7).unwrap();
        let step_id = store.add_step(build_id, 0, "compile").unwrap();

        assert_eq!(store.get_build_id(builder_id, 7).unwrap(), Some(build_id));
        assert_eq!(store.get_build_id(builder_id, 8).unwrap(), None);
        assert_eq!(
            store.get_step_id_by_name(build_id, "compile").unwrap(),
            Some(step_id)
        );
        assert_eq!(
            store.get_step_id_by_number(build_id, 0).unwrap(),
            Some(step_id)
        );
        assert_eq!(store.get_step_id_by_name(build_id, "link").unwrap(), None);
    }
}
