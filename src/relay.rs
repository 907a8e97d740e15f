//! Store-and-forward relay queue.
//!
//! Per message: `Pending → Attempting → {Delivered, Pending}`. A caller enters
//! `Attempting` by claiming the message (`attempting_since`) in a write
//! transaction before it touches the transport, so the background ticker and
//! an interactive `deliver` never hand off the same payload together. The
//! claim is released in the same transaction that records the outcome. A
//! failed attempt leaves the message pending with `last_forwarding_attempt`
//! moved strictly forward and `attempts` incremented.
//!
//! Delivery is at-least-once: if the process dies between a successful
//! hand-off and the status write, the claim goes stale after [`CLAIM_TTL`]
//! and the payload is sent again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, Transaction, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::AppError,
    peers::PeerRegistry,
    store::{self, Database},
    transport::Transport,
};

/// How long a delivery claim blocks other callers. Past this the claimant is
/// presumed dead and the message may be claimed again.
pub const CLAIM_TTL: Duration = Duration::from_secs(5 * 60);

const COLUMNS: &[&str] = &[
    "id",
    "dest_node_id",
    "payload",
    "created_at",
    "last_forwarding_attempt",
    "attempts",
    "delivery_success",
    "delivered_at",
    "attempting_since",
];

const SELECT_MESSAGE: &str = "SELECT id, dest_node_id, payload, created_at, last_forwarding_attempt, \
     attempts, delivery_success, delivered_at, attempting_since FROM messages";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Pending,
    /// Claimed by a caller that is handing it to the transport.
    Attempting,
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub id: String,
    /// Fingerprint of the destination peer.
    pub destination: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub last_forwarding_attempt: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub delivery_success: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Set while a caller holds the delivery claim.
    pub attempting_since: Option<DateTime<Utc>>,
}

impl RelayMessage {
    pub fn state(&self) -> MessageState {
        match (self.delivery_success, self.attempting_since) {
            (true, _) => MessageState::Delivered,
            (false, Some(_)) => MessageState::Attempting,
            (false, None) => MessageState::Pending,
        }
    }
}

/// Successful result of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Already delivered earlier; the transport was not called again.
    AlreadyDelivered,
    /// Another caller holds the delivery claim; nothing was sent.
    InFlight,
}

enum Claim {
    Claimed(RelayMessage),
    Delivered,
    Held,
}

#[derive(Debug, Clone)]
pub struct RelayQueue {
    db: Database,
}

impl RelayQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn initialize(&self) -> Result<(), AppError> {
        self.db.write(|tx| {
            store::check_columns(tx, "messages", COLUMNS)?;
            tx.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    dest_node_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    last_forwarding_attempt INTEGER,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    delivery_success INTEGER NOT NULL DEFAULT 0,
                    delivered_at INTEGER,
                    attempting_since INTEGER,
                    CHECK ((delivery_success = 1) = (delivered_at IS NOT NULL))
                );
                CREATE INDEX IF NOT EXISTS messages_pending
                    ON messages (delivery_success, last_forwarding_attempt);
                ",
            )
            .map_err(|e| AppError::Storage(format!("create messages table: {e}")))
        })
    }

    /// Accept a message for relay. The destination does not need to resolve
    /// yet.
    pub fn enqueue(&self, destination: &str, payload: &str) -> Result<String, AppError> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(AppError::Validation("destination node id cannot be empty".into()));
        }
        let id = Uuid::now_v7().to_string();
        let now = store::to_millis(Utc::now());
        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO messages (id, dest_node_id, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, destination, payload, now],
            )?;
            Ok(())
        })?;
        info!(message_id = %id, %destination, bytes = payload.len(), "message enqueued");
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<RelayMessage, AppError> {
        self.db
            .read(|tx| fetch(tx, id))?
            .ok_or_else(|| AppError::NotFound(format!("message {id}")))
    }

    /// Undelivered, unclaimed messages, least recently attempted first.
    /// Stale claims count as unclaimed.
    pub fn pending(&self, limit: usize) -> Result<Vec<RelayMessage>, AppError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let stale_before = cutoff_millis(CLAIM_TTL);
        self.db.read(|tx| {
            let mut stmt = tx.prepare(&format!(
                "{SELECT_MESSAGE} WHERE delivery_success = 0 \
                 AND (attempting_since IS NULL OR attempting_since <= ?2) \
                 ORDER BY COALESCE(last_forwarding_attempt, 0), created_at, id LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit, stale_before], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Every retained message, oldest first.
    pub fn list(&self) -> Result<Vec<RelayMessage>, AppError> {
        self.db.read(|tx| {
            let mut stmt = tx.prepare(&format!("{SELECT_MESSAGE} ORDER BY created_at, id"))?;
            let rows = stmt
                .query_map([], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Try to forward one message.
    ///
    /// Unresolved destinations and transport failures record the attempt and
    /// return the retryable [`AppError::PeerUnknown`] / [`AppError::Transport`].
    /// A message claimed by another caller is left alone
    /// ([`Delivery::InFlight`]).
    pub fn attempt_delivery(
        &self,
        id: &str,
        peers: &PeerRegistry,
        transport: &dyn Transport,
    ) -> Result<Delivery, AppError> {
        let message = match self.claim(id)? {
            Claim::Claimed(message) => message,
            Claim::Delivered => {
                debug!(message_id = %id, "already delivered; not resending");
                return Ok(Delivery::AlreadyDelivered);
            }
            Claim::Held => {
                debug!(message_id = %id, "delivery claimed by another caller");
                return Ok(Delivery::InFlight);
            }
        };

        let peer = match peers.lookup(&message.destination) {
            Ok(peer) => peer,
            Err(AppError::NotFound(_)) => {
                let m = self.record_attempt(id, false)?;
                debug!(message_id = %id, destination = %message.destination, attempts = m.attempts, "destination unknown");
                return Err(AppError::PeerUnknown(message.destination));
            }
            Err(e) => {
                if let Err(release_err) = self.release(id) {
                    warn!(message_id = %id, error = %release_err, "cannot release delivery claim");
                }
                return Err(e);
            }
        };

        match transport.send(&peer.address, &message.payload) {
            Ok(()) => {
                self.record_attempt(id, true)?;
                info!(message_id = %id, peer = %peer.name, address = %peer.address, "message delivered");
                Ok(Delivery::Delivered)
            }
            Err(reason) => {
                let m = self.record_attempt(id, false)?;
                warn!(message_id = %id, address = %peer.address, attempts = m.attempts, %reason, "delivery failed");
                Err(AppError::Transport(reason))
            }
        }
    }

    /// Take the delivery claim unless the message is delivered or a live
    /// claim exists.
    fn claim(&self, id: &str) -> Result<Claim, AppError> {
        let now = store::to_millis(Utc::now());
        let stale_before = cutoff_millis(CLAIM_TTL);
        self.db.write(|tx| {
            let message = fetch(tx, id)?.ok_or_else(|| AppError::NotFound(format!("message {id}")))?;
            if message.delivery_success {
                return Ok(Claim::Delivered);
            }
            if let Some(since) = message.attempting_since {
                if store::to_millis(since) > stale_before {
                    return Ok(Claim::Held);
                }
                warn!(message_id = %id, %since, "taking over stale delivery claim");
            }
            tx.execute(
                "UPDATE messages SET attempting_since = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            Ok(Claim::Claimed(message))
        })
    }

    fn release(&self, id: &str) -> Result<(), AppError> {
        self.db.write(|tx| {
            tx.execute("UPDATE messages SET attempting_since = NULL WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    /// Stamp an attempt, set the delivery flag and drop the claim in one
    /// transaction.
    fn record_attempt(&self, id: &str, delivered: bool) -> Result<RelayMessage, AppError> {
        self.db.write(|tx| {
            let current = fetch(tx, id)?.ok_or_else(|| AppError::NotFound(format!("message {id}")))?;
            let now = store::to_millis(Utc::now());
            let stamp = match current.last_forwarding_attempt {
                Some(prev) => now.max(store::to_millis(prev) + 1),
                None => now,
            };
            let delivered_at = delivered.then_some(stamp);
            tx.execute(
                "UPDATE messages SET last_forwarding_attempt = ?1, attempts = attempts + 1, \
                 delivery_success = ?2, delivered_at = COALESCE(delivered_at, ?3), \
                 attempting_since = NULL WHERE id = ?4",
                params![stamp, current.delivery_success || delivered, delivered_at, id],
            )?;
            fetch(tx, id)?.ok_or_else(|| AppError::NotFound(format!("message {id}")))
        })
    }

    /// Remove a delivered message. Undelivered messages cannot be
    /// acknowledged.
    pub fn acknowledge(&self, id: &str) -> Result<(), AppError> {
        self.db.write(|tx| {
            let message = fetch(tx, id)?.ok_or_else(|| AppError::NotFound(format!("message {id}")))?;
            if !message.delivery_success {
                return Err(AppError::Validation(format!("message {id} has not been delivered")));
            }
            tx.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            Ok(())
        })?;
        debug!(message_id = %id, "message acknowledged");
        Ok(())
    }

    /// Remove delivered messages delivered at least `older_than` ago.
    pub fn purge_delivered(&self, older_than: Duration) -> Result<usize, AppError> {
        let cutoff = cutoff_millis(older_than);
        let n = self.db.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM messages WHERE delivery_success = 1 AND delivered_at <= ?1",
                [cutoff],
            )?)
        })?;
        if n > 0 {
            info!(count = n, "purged delivered messages");
        }
        Ok(n)
    }

    /// Remove undelivered messages enqueued at least `max_age` ago.
    pub fn purge_expired(&self, max_age: Duration) -> Result<usize, AppError> {
        let cutoff = cutoff_millis(max_age);
        let n = self.db.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM messages WHERE delivery_success = 0 AND created_at <= ?1",
                [cutoff],
            )?)
        })?;
        if n > 0 {
            warn!(count = n, "expired undelivered messages");
        }
        Ok(n)
    }
}

fn cutoff_millis(age: Duration) -> i64 {
    let age = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
    store::to_millis(Utc::now()).saturating_sub(age)
}

fn fetch(tx: &Transaction<'_>, id: &str) -> Result<Option<RelayMessage>, AppError> {
    Ok(tx
        .query_row(&format!("{SELECT_MESSAGE} WHERE id = ?1"), [id], row_to_message)
        .optional()?)
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<RelayMessage> {
    Ok(RelayMessage {
        id: row.get(0)?,
        destination: row.get(1)?,
        payload: row.get(2)?,
        created_at: store::millis_column(row, 3)?,
        last_forwarding_attempt: store::opt_millis_column(row, 4)?,
        attempts: row.get(5)?,
        delivery_success: row.get(6)?,
        delivered_at: store::opt_millis_column(row, 7)?,
        attempting_since: store::opt_millis_column(row, 8)?,
    })
}
