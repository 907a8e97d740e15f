//! Registry of known remote nodes used as relay destinations.
//!
//! Peers are addressed by public key fingerprint. The registry does not
//! enforce fingerprint uniqueness; [`PeerRegistry::lookup`] resolves to the
//! earliest registration.

use std::collections::VecDeque;

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{OptionalExtension, Row, params};
use tracing::info;

use crate::{error::AppError, store::{self, Database}};

const PAGE_SIZE: usize = 64;
const COLUMNS: &[&str] = &["id", "node_name", "public_key_fingerprint", "network_address", "registered_at"];

/// Registration input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPeer {
    pub name: String,
    pub fingerprint: String,
    pub address: String,
}

impl NewPeer {
    pub fn new(
        name: impl Into<String>,
        fingerprint: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self { name: name.into(), fingerprint: fingerprint.into(), address: address.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Store-assigned, increasing in registration order.
    pub id: i64,
    pub name: String,
    pub fingerprint: String,
    pub address: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PeerRegistry {
    db: Database,
}

impl PeerRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn initialize(&self) -> Result<(), AppError> {
        self.db.write(|tx| {
            store::check_columns(tx, "peers", COLUMNS)?;
            tx.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS peers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    node_name TEXT NOT NULL,
                    public_key_fingerprint TEXT NOT NULL,
                    network_address TEXT NOT NULL,
                    registered_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS peers_fingerprint ON peers (public_key_fingerprint);
                ",
            )
            .map_err(|e| AppError::Storage(format!("create peers table: {e}")))
        })
    }

    pub fn register(&self, peer: NewPeer) -> Result<Peer, AppError> {
        let name = required("name", &peer.name)?;
        let fingerprint = required("public key fingerprint", &peer.fingerprint)?;
        let address = required("network address", &peer.address)?;
        // stored at millisecond precision
        let registered_at = Utc::now().trunc_subsecs(3);

        let id = self.db.write(|tx| {
            tx.execute(
                "INSERT INTO peers (node_name, public_key_fingerprint, network_address, registered_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, fingerprint, address, store::to_millis(registered_at)],
            )?;
            Ok(tx.last_insert_rowid())
        })?;

        info!(peer_id = id, %fingerprint, %address, "peer registered");
        Ok(Peer { id, name, fingerprint, address, registered_at })
    }

    /// Resolve a relay destination by fingerprint.
    pub fn lookup(&self, node_id: &str) -> Result<Peer, AppError> {
        self.db
            .read(|tx| {
                Ok(tx
                    .query_row(
                        "SELECT id, node_name, public_key_fingerprint, network_address, registered_at \
                         FROM peers WHERE public_key_fingerprint = ?1 ORDER BY id LIMIT 1",
                        [node_id.trim()],
                        row_to_peer,
                    )
                    .optional()?)
            })?
            .ok_or_else(|| AppError::NotFound(format!("peer {node_id}")))
    }

    /// Enumerate peers in registration order. Rows are fetched a page at a
    /// time as the iterator advances; call again to restart.
    pub fn list(&self) -> PeerIter {
        PeerIter { db: self.db.clone(), after: 0, page: VecDeque::new(), done: false }
    }
}

/// Lazy page-by-page scan of the peers table, resuming after the last id
/// seen. Peers registered during iteration are picked up by later pages.
pub struct PeerIter {
    db: Database,
    after: i64,
    page: VecDeque<Peer>,
    done: bool,
}

impl PeerIter {
    fn fetch_page(&mut self) -> Result<(), AppError> {
        let after = self.after;
        let rows = self.db.read(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, node_name, public_key_fingerprint, network_address, registered_at \
                 FROM peers WHERE id > ?1 ORDER BY id LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![after, PAGE_SIZE as i64], row_to_peer)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        if rows.len() < PAGE_SIZE {
            self.done = true;
        }
        if let Some(last) = rows.last() {
            self.after = last.id;
        }
        self.page.extend(rows);
        Ok(())
    }
}

impl Iterator for PeerIter {
    type Item = Result<Peer, AppError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.done {
            if let Err(e) = self.fetch_page() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.page.pop_front().map(Ok)
    }
}

fn row_to_peer(row: &Row<'_>) -> rusqlite::Result<Peer> {
    Ok(Peer {
        id: row.get(0)?,
        name: row.get(1)?,
        fingerprint: row.get(2)?,
        address: row.get(3)?,
        registered_at: store::millis_column(row, 4)?,
    })
}

fn required(field: &str, value: &str) -> Result<String, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::Validation(format!("peer {field} cannot be empty")));
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, PeerRegistry) {
        let tmp = TempDir::new().unwrap();
        let reg = PeerRegistry::new(Database::open(&tmp.path().join("pterm.db")).unwrap());
        reg.initialize().unwrap();
        (tmp, reg)
    }

    #[test]
    fn register_then_lookup() {
        let (_tmp, reg) = registry();
        let p = reg.register(NewPeer::new("bravo", "FP-B", "10.0.0.2:7000")).unwrap();
        assert_eq!(reg.lookup("FP-B").unwrap(), p);
    }

    #[test]
    fn lookup_unknown_is_not_found() {
        let (_tmp, reg) = registry();
        assert!(matches!(reg.lookup("nobody"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn empty_fields_rejected() {
        let (_tmp, reg) = registry();
        for p in [
            NewPeer::new("", "FP", "addr"),
            NewPeer::new("n", " ", "addr"),
            NewPeer::new("n", "FP", ""),
        ] {
            assert!(matches!(reg.register(p), Err(AppError::Validation(_))));
        }
        assert_eq!(reg.list().count(), 0);
    }

    #[test]
    fn duplicate_fingerprints_allowed_and_earliest_wins() {
        let (_tmp, reg) = registry();
        let first = reg.register(NewPeer::new("one", "FP", "a:1")).unwrap();
        reg.register(NewPeer::new("two", "FP", "b:2")).unwrap();
        assert_eq!(reg.lookup("FP").unwrap().id, first.id);
        assert_eq!(reg.list().count(), 2);
    }

    #[test]
    fn list_spans_pages_in_insertion_order_and_restarts() {
        let (_tmp, reg) = registry();
        let total = PAGE_SIZE + 5;
        for i in 0..total {
            reg.register(NewPeer::new(format!("p{i}"), format!("FP{i}"), "addr")).unwrap();
        }
        let names: Vec<String> = reg.list().map(|p| p.unwrap().name).collect();
        assert_eq!(names.len(), total);
        assert_eq!(names.first().map(String::as_str), Some("p0"));
        assert_eq!(names.last().map(String::as_str), Some(format!("p{}", total - 1).as_str()));

        let first_two: Vec<_> = reg.list().take(2).map(|p| p.unwrap().name).collect();
        assert_eq!(first_two, vec!["p0", "p1"]);
    }

    #[test]
    fn list_is_lazy() {
        let (_tmp, reg) = registry();
        let mut it = reg.list();
        reg.register(NewPeer::new("late", "FP", "addr")).unwrap();
        assert_eq!(it.next().unwrap().unwrap().name, "late");
        assert!(it.next().is_none());
    }
}
