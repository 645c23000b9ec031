use crate::db::Db;
use crate::error::{KilnError, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

/// Kinds of shared resources a master can own exclusively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    ChangeSource,
    Worker,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ChangeSource => "changesource",
            ResourceKind::Worker => "worker",
        }
    }
}

/// One row of a claim listing: the resource plus its current owner, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimRow {
    pub id: i64,
    pub kind: String,
    pub name: String,
    pub master_id: Option<String>,
}

/// Exclusive-claim bookkeeping over the shared relational store.
///
/// The unique index on `claims.resource_id` is the sole serialization
/// point; there is no in-process lock because independent master processes
/// race for the same rows. Exactly one concurrent claimant wins, and every
/// loser observes `AlreadyClaimed` rather than a hang or a silent success.
#[derive(Debug, Clone)]
pub struct ClaimStore {
    db: Db,
}

impl ClaimStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Find the canonical id for a named resource, creating the registry
    /// row on first use.
    pub fn find_resource_id(&self, kind: ResourceKind, name: &str) -> Result<i64> {
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO resources (kind, name) VALUES (?1, ?2)",
            params![kind.as_str(), name],
        )?;
        let id = conn.query_row(
            "SELECT id FROM resources WHERE kind = ?1 AND name = ?2",
            params![kind.as_str(), name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Attempt to bind `resource_id` to `master_id`.
    ///
    /// A blind insert; the unique index decides the winner. Re-claiming a
    /// resource this master already holds is a no-op success.
    pub fn claim(&self, resource_id: i64, master_id: &str) -> Result<()> {
        let conn = self.db.conn()?;
        loop {
            let inserted = conn.execute(
                "INSERT INTO claims (resource_id, master_id, claimed_at)
                 VALUES (?1, ?2, ?3)",
                params![resource_id, master_id, chrono::Utc::now().to_rfc3339()],
            );
            match inserted {
                Ok(_) => {
                    tracing::debug!("master '{}' claimed resource {}", master_id, resource_id);
                    return Ok(());
                }
                Err(e) if is_constraint_violation(&e) => {
                    match self.owner_of(&conn, resource_id)? {
                        Some(owner) if owner == master_id => return Ok(()),
                        Some(owner) => {
                            return Err(KilnError::AlreadyClaimed {
                                resource_id,
                                master_id: owner,
                            });
                        }
                        // The row vanished between the insert and the read:
                        // a concurrent release. Race again.
                        None => continue,
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Delete the claim row, if present. Releasing an unclaimed resource is
    /// a no-op.
    pub fn release(&self, resource_id: i64) -> Result<()> {
        let conn = self.db.conn()?;
        let affected = conn.execute(
            "DELETE FROM claims WHERE resource_id = ?1",
            params![resource_id],
        )?;
        if affected > 0 {
            tracing::debug!("released claim on resource {}", resource_id);
        }
        Ok(())
    }

    /// The master currently holding `resource_id`, if any.
    pub fn get_claim(&self, resource_id: i64) -> Result<Option<String>> {
        let conn = self.db.conn()?;
        self.owner_of(&conn, resource_id)
    }

    /// List resources with their owners, optionally filtered by kind,
    /// activity, or owning master.
    ///
    /// Asking for resources that are both inactive and claimed by a
    /// specific master is logically empty and short-circuits without a
    /// store round-trip.
    pub fn claims(
        &self,
        kind: Option<ResourceKind>,
        active: Option<bool>,
        master_id: Option<&str>,
    ) -> Result<Vec<ClaimRow>> {
        if active == Some(false) && master_id.is_some() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT r.id, r.kind, r.name, c.master_id
             FROM resources r LEFT OUTER JOIN claims c ON r.id = c.resource_id",
        );
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if let Some(kind) = kind {
            args.push(kind.as_str().to_string());
            clauses.push(format!("r.kind = ?{}", args.len()));
        }
        if let Some(master_id) = master_id {
            args.push(master_id.to_string());
            clauses.push(format!("c.master_id = ?{}", args.len()));
        } else if active == Some(true) {
            clauses.push("c.master_id IS NOT NULL".to_string());
        } else if active == Some(false) {
            clauses.push("c.master_id IS NULL".to_string());
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY r.id");

        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| {
            Ok(ClaimRow {
                id: row.get(0)?,
                kind: row.get(1)?,
                name: row.get(2)?,
                master_id: row.get(3)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn owner_of(&self, conn: &Connection, resource_id: i64) -> Result<Option<String>> {
        let owner = conn
            .query_row(
                "SELECT master_id FROM claims WHERE resource_id = ?1",
                params![resource_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }
}

pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ClaimStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = Db::open(temp_dir.path().join("kiln.db")).unwrap();
        (temp_dir, ClaimStore::new(db))
    }

    #[test]
    fn test_claim_exclusivity_scenario() {
        let (_t, store) = store();
        let id = store
            .find_resource_id(ResourceKind::ChangeSource, "poller")
            .unwrap();

        store.claim(id, "masterA").unwrap();
        let err = store.claim(id, "masterB").unwrap_err();
        assert!(matches!(
            err,
            KilnError::AlreadyClaimed { master_id, .. } if master_id == "masterA"
        ));

        store.release(id).unwrap();
        store.claim(id, "masterB").unwrap();
        assert_eq!(store.get_claim(id).unwrap(), Some("masterB".to_string()));
    }

    #[test]
    fn test_idempotent_reclaim_leaves_one_row() {
        let (_t, store) = store();
        let id = store
            .find_resource_id(ResourceKind::Worker, "worker-1")
            .unwrap();

        store.claim(id, "masterA").unwrap();
        store.claim(id, "masterA").unwrap();

        let rows = store.claims(None, Some(true), None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].master_id.as_deref(), Some("masterA"));
    }

    #[test]
    fn test_release_unclaimed_is_noop() {
        let (_t, store) = store();
        let id = store
            .find_resource_id(ResourceKind::ChangeSource, "poller")
            .unwrap();
        store.release(id).unwrap();
        assert_eq!(store.get_claim(id).unwrap(), None);
    }

    #[test]
    fn test_find_resource_id_is_stable() {
        let (_t, store) = store();
        let a = store
            .find_resource_id(ResourceKind::ChangeSource, "poller")
            .unwrap();
        let b = store
            .find_resource_id(ResourceKind::ChangeSource, "poller")
            .unwrap();
        assert_eq!(a, b);

        // Same name under a different kind is a different resource.
        let c = store.find_resource_id(ResourceKind::Worker, "poller").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_claims_filters() {
        let (_t, store) = store();
        let a = store
            .find_resource_id(ResourceKind::ChangeSource, "poller-a")
            .unwrap();
        let b = store
            .find_resource_id(ResourceKind::ChangeSource, "poller-b")
            .unwrap();
        store.claim(a, "masterA").unwrap();

        let all = store.claims(None, None, None).unwrap();
        assert_eq!(all.len(), 2);

        let active = store.claims(None, Some(true), None).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a);

        let inactive = store.claims(None, Some(false), None).unwrap();
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].id, b);

        let mine = store.claims(None, None, Some("masterA")).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].master_id.as_deref(), Some("masterA"));

        // Logically empty combination short-circuits.
        let none = store.claims(None, Some(false), Some("masterA")).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_concurrent_claims_one_winner() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("kiln.db");
        let db = Db::open(&path).unwrap();
        let store = ClaimStore::new(db);
        let id = store
            .find_resource_id(ResourceKind::Worker, "worker-1")
            .unwrap();

        let mut handles = Vec::new();
        for master in ["masterA", "masterB", "masterC"] {
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let store = ClaimStore::new(Db::open(&path).unwrap());
                store.claim(id, master).is_ok()
            }));
        }

        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);

        let rows = store.claims(None, Some(true), None).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
