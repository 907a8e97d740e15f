//! Node identity: the single local identity record and its invariants.
//!
//! The `identity` table holds at most one row (`id = 1` is enforced by a
//! CHECK constraint). The public key fingerprint and the private key path are
//! either both present or both absent; [`Identity::keys`] models that pair as
//! one `Option` so a half-bound identity cannot be represented in memory, and
//! the table carries the same rule as a CHECK so it cannot be stored either.

use rusqlite::{OptionalExtension, Row, Transaction, params};
use tracing::{debug, info, warn};

use crate::{error::AppError, store::{self, Database}};

/// Prompt shown when the identity has none configured.
pub const DEFAULT_PROMPT: &str = "pterm>";

/// Separator appended after the prompt label when displayed.
pub const PROMPT_SEPARATOR: &str = " ";

const IDENTITY_ID: i64 = 1;
const COLUMNS: &[&str] = &[
    "id",
    "node_name",
    "public_key_fingerprint",
    "private_key_path",
    "pgp_email",
    "prompt",
];

const CREATE_IDENTITY: &str = "
    CREATE TABLE IF NOT EXISTS identity (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        node_name TEXT NOT NULL CHECK (length(trim(node_name)) > 0),
        public_key_fingerprint TEXT,
        private_key_path TEXT,
        pgp_email TEXT,
        prompt TEXT,
        CHECK ((public_key_fingerprint IS NULL) = (private_key_path IS NULL))
    );
";

/// A key pair bound to the identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundKeys {
    pub fingerprint: String,
    /// Where the private key material lives. Empty means "not persisted".
    pub private_key_path: String,
}

/// The local node's identity record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub keys: Option<BoundKeys>,
    pub pgp_email: Option<String>,
    /// `None` falls back to [`DEFAULT_PROMPT`].
    pub prompt: Option<String>,
}

impl Identity {
    pub fn has_keys(&self) -> bool {
        self.keys.is_some()
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.keys.as_ref().map(|k| k.fingerprint.as_str())
    }

    pub fn private_key_path(&self) -> Option<&str> {
        self.keys.as_ref().map(|k| k.private_key_path.as_str())
    }

    pub fn prompt(&self) -> &str {
        self.prompt.as_deref().unwrap_or(DEFAULT_PROMPT)
    }

    /// The prompt as the shell prints it, separator included.
    pub fn display_prompt(&self) -> String {
        format!("{}{PROMPT_SEPARATOR}", self.prompt())
    }
}

/// A partial change to one identity field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Field<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T: Clone> Field<T> {
    fn apply(&self, current: Option<T>) -> Option<T> {
        match self {
            Field::Keep => current,
            Field::Set(v) => Some(v.clone()),
            Field::Clear => None,
        }
    }
}

/// Partial identity update. Unset fields are left as they are.
#[derive(Debug, Clone, Default)]
pub struct IdentityUpdate {
    /// Rename. Clearing the name is rejected.
    pub name: Field<String>,
    pub public_key_fingerprint: Field<String>,
    pub private_key_path: Field<String>,
    pub pgp_email: Field<String>,
    pub prompt: Field<String>,
}

impl IdentityUpdate {
    pub fn prompt(text: impl Into<String>) -> Self {
        Self { prompt: Field::Set(text.into()), ..Self::default() }
    }

    /// Bind (or replace) a key pair; both halves are written together.
    pub fn bind_keys(keys: BoundKeys) -> Self {
        Self {
            public_key_fingerprint: Field::Set(keys.fingerprint),
            private_key_path: Field::Set(keys.private_key_path),
            ..Self::default()
        }
    }
}

/// Persistence for the single identity record.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    db: Database,
}

impl IdentityStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the identity table if absent. Idempotent.
    pub fn initialize(&self) -> Result<(), AppError> {
        self.db.write(|tx| {
            store::check_columns(tx, "identity", COLUMNS)?;
            tx.execute_batch(CREATE_IDENTITY)
                .map_err(|e| AppError::Storage(format!("create identity table: {e}")))
        })
    }

    /// Return the identity, creating it first when none exists.
    ///
    /// `name_provider` is only invoked when a record has to be created, and
    /// runs outside any transaction so an interactive prompt never holds the
    /// write lock. If another caller creates the record in the meantime, that
    /// record wins and the provided name is discarded.
    pub fn ensure_identity<F>(&self, name_provider: F) -> Result<Identity, AppError>
    where
        F: FnOnce() -> Result<String, AppError>,
    {
        if let Some(identity) = self.db.read(|tx| fetch(tx))? {
            return Ok(identity);
        }

        let name = name_provider()?;
        let name = validate_name(&name)?;

        let created = self.db.write(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO identity (id, node_name) VALUES (?1, ?2)",
                params![IDENTITY_ID, name],
            )?;
            let identity = fetch(tx)?
                .ok_or_else(|| AppError::Storage("identity row vanished after insert".into()))?;
            Ok((inserted == 1, identity))
        })?;

        match created {
            (true, identity) => {
                info!(name = %identity.name, "identity created");
                Ok(identity)
            }
            (false, identity) => {
                warn!(name = %identity.name, "identity created concurrently; keeping existing record");
                Ok(identity)
            }
        }
    }

    /// The identity record. `NotFound` means `ensure_identity` never ran.
    pub fn get(&self) -> Result<Identity, AppError> {
        self.db
            .read(|tx| fetch(tx))?
            .ok_or_else(|| AppError::NotFound("identity record (ensure_identity was never called)".into()))
    }

    /// Apply `update` atomically and return the resulting identity.
    pub fn update(&self, update: &IdentityUpdate) -> Result<Identity, AppError> {
        self.update_checked(update, |_| Ok(()))
    }

    /// Like [`update`](Self::update), but `precondition` sees the current
    /// record inside the write transaction and may refuse the change.
    pub(crate) fn update_checked(
        &self,
        update: &IdentityUpdate,
        precondition: impl FnOnce(&Identity) -> Result<(), AppError>,
    ) -> Result<Identity, AppError> {
        if update.name == Field::Clear {
            return Err(AppError::Validation("node name cannot be cleared".into()));
        }

        let updated = self.db.write(|tx| {
            let current = fetch(tx)?.ok_or_else(|| {
                AppError::NotFound("identity record (ensure_identity was never called)".into())
            })?;
            precondition(&current)?;
            let next = merge(&current, update)?;
            let (fingerprint, key_path) = match &next.keys {
                Some(k) => (Some(k.fingerprint.as_str()), Some(k.private_key_path.as_str())),
                None => (None, None),
            };
            tx.execute(
                "UPDATE identity SET node_name = ?1, public_key_fingerprint = ?2, \
                 private_key_path = ?3, pgp_email = ?4, prompt = ?5 WHERE id = ?6",
                params![next.name, fingerprint, key_path, next.pgp_email, next.prompt, IDENTITY_ID],
            )?;
            Ok(next)
        })?;

        debug!(has_keys = updated.has_keys(), "identity updated");
        Ok(updated)
    }

    /// Every identity row. Never more than one; exposed for developer
    /// inspection of the raw table.
    pub fn records(&self) -> Result<Vec<Identity>, AppError> {
        self.db.read(|tx| {
            let mut stmt = tx.prepare(
                "SELECT node_name, public_key_fingerprint, private_key_path, pgp_email, prompt \
                 FROM identity ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], row_to_identity)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Drop and recreate the identity table, leaving it empty. Irreversible;
    /// the caller is responsible for gating this away from normal flows.
    pub fn reset(&self) -> Result<(), AppError> {
        self.db.write(recreate_table)?;
        warn!("identity table reset");
        Ok(())
    }

    /// Replace the identity with a fresh keyless one named `name`. The drop
    /// and the insert share a transaction, so a failure keeps the old record.
    pub fn reset_with(&self, name: &str) -> Result<Identity, AppError> {
        let name = validate_name(name)?;
        let identity = self.db.write(|tx| {
            recreate_table(tx)?;
            tx.execute(
                "INSERT INTO identity (id, node_name) VALUES (?1, ?2)",
                params![IDENTITY_ID, name],
            )?;
            fetch(tx)?.ok_or_else(|| AppError::Storage("identity row vanished after insert".into()))
        })?;
        warn!(name = %identity.name, "identity replaced");
        Ok(identity)
    }
}

fn recreate_table(tx: &Transaction<'_>) -> Result<(), AppError> {
    tx.execute_batch("DROP TABLE IF EXISTS identity;")
        .map_err(|e| AppError::Storage(format!("drop identity table: {e}")))?;
    tx.execute_batch(CREATE_IDENTITY)
        .map_err(|e| AppError::Storage(format!("create identity table: {e}")))
}

fn fetch(tx: &Transaction<'_>) -> Result<Option<Identity>, AppError> {
    Ok(tx
        .query_row(
            "SELECT node_name, public_key_fingerprint, private_key_path, pgp_email, prompt \
             FROM identity WHERE id = ?1",
            [IDENTITY_ID],
            row_to_identity,
        )
        .optional()?)
}

fn row_to_identity(row: &Row<'_>) -> rusqlite::Result<Identity> {
    let fingerprint: Option<String> = row.get(1)?;
    let key_path: Option<String> = row.get(2)?;
    Ok(Identity {
        name: row.get(0)?,
        keys: fingerprint.zip(key_path).map(|(fingerprint, private_key_path)| BoundKeys {
            fingerprint,
            private_key_path,
        }),
        pgp_email: row.get(3)?,
        prompt: row.get(4)?,
    })
}

fn merge(current: &Identity, update: &IdentityUpdate) -> Result<Identity, AppError> {
    let name = match &update.name {
        Field::Set(n) => validate_name(n)?,
        _ => current.name.clone(),
    };

    let fingerprint = update
        .public_key_fingerprint
        .apply(current.fingerprint().map(str::to_string));
    let key_path = update
        .private_key_path
        .apply(current.private_key_path().map(str::to_string));
    let keys = match (fingerprint, key_path) {
        (Some(fingerprint), Some(private_key_path)) => {
            if fingerprint.trim().is_empty() {
                return Err(AppError::Validation("public key fingerprint cannot be empty".into()));
            }
            Some(BoundKeys { fingerprint, private_key_path })
        }
        (None, None) => None,
        (Some(_), None) => {
            return Err(AppError::Validation(
                "public key fingerprint requires a private key path".into(),
            ));
        }
        (None, Some(_)) => {
            return Err(AppError::Validation(
                "private key path requires a public key fingerprint".into(),
            ));
        }
    };

    let pgp_email = update.pgp_email.apply(current.pgp_email.clone());
    if let Some(email) = &pgp_email {
        validate_email(email)?;
    }

    let prompt = update.prompt.apply(current.prompt.clone());
    if prompt.as_deref().is_some_and(|p| p.trim().is_empty()) {
        return Err(AppError::Validation("prompt cannot be blank; clear it instead".into()));
    }

    Ok(Identity { name, keys, pgp_email, prompt })
}

fn validate_name(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("node name cannot be empty".into()));
    }
    Ok(name.to_string())
}

/// Check `local@domain.tld` syntax: a non-empty local part of atext
/// characters and dots, and a domain of at least two dot-separated labels.
pub fn validate_email(email: &str) -> Result<(), AppError> {
    let invalid = || AppError::Validation(format!("'{email}' is not a valid email address"));

    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || local.len() > 64 || domain.contains('@') {
        return Err(invalid());
    }
    let local_ok = local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "!#$%&'*+/=?^_`{|}~.-".contains(c))
        && !local.starts_with('.')
        && !local.ends_with('.')
        && !local.contains("..");
    if !local_ok {
        return Err(invalid());
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(invalid());
    }
    let labels_ok = labels.iter().all(|l| {
        !l.is_empty()
            && !l.starts_with('-')
            && !l.ends_with('-')
            && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if !labels_ok {
        return Err(invalid());
    }
    Ok(())
}

// ── tests ─────────────────────────────────────────────────────────────────────
