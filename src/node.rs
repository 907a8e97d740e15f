//! `NodeFacade`, the single entry point for front-ends.
//!
//! Composes the identity store, key manager, peer registry and relay queue.
//! No state is cached between calls; every read goes back to the store.
//! Errors leave as [`NodeError`], with storage and crypto internals logged
//! here and replaced by a generic message.

use std::{fmt, sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    config::Config,
    error::AppError,
    identity::{Field, Identity, IdentityStore, IdentityUpdate},
    keys::{Ed25519Backend, KeyBackend, KeyManager, KeyOutcome, KeyPrompts},
    peers::{NewPeer, Peer, PeerRegistry},
    relay::{Delivery, RelayMessage, RelayQueue},
    store::Database,
    transport::{OutboxTransport, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Storage,
    Crypto,
    PeerUnknown,
    Transport,
    Denied,
    Internal,
}

/// Caller-facing error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::PeerUnknown | ErrorKind::Transport)
    }
}

/// Back into the crate error for callers outside the facade (the binary).
/// The message is already the sanitized one.
impl From<NodeError> for AppError {
    fn from(e: NodeError) -> Self {
        let m = e.message;
        match e.kind {
            ErrorKind::Validation => AppError::Validation(m),
            ErrorKind::NotFound => AppError::NotFound(m),
            ErrorKind::Storage => AppError::Storage(m),
            ErrorKind::Crypto => AppError::Crypto(m),
            ErrorKind::PeerUnknown => AppError::PeerUnknown(m),
            ErrorKind::Transport => AppError::Transport(m),
            ErrorKind::Denied => AppError::Denied(m),
            ErrorKind::Internal => AppError::Internal(m),
        }
    }
}

impl From<AppError> for NodeError {
    fn from(e: AppError) -> Self {
        let (kind, message) = match e {
            AppError::Validation(m) => (ErrorKind::Validation, m),
            AppError::NotFound(m) => (ErrorKind::NotFound, format!("{m} not found")),
            AppError::PeerUnknown(m) => (ErrorKind::PeerUnknown, format!("no registered peer for {m}; will retry")),
            AppError::Transport(m) => (ErrorKind::Transport, format!("delivery failed: {m}; will retry")),
            AppError::Denied(m) => (ErrorKind::Denied, m),
            AppError::Storage(m) => {
                error!(detail = %m, "storage failure");
                (ErrorKind::Storage, "node storage is unavailable".to_string())
            }
            AppError::Crypto(m) => {
                error!(detail = %m, "crypto failure");
                (ErrorKind::Crypto, "key operation failed".to_string())
            }
            other => {
                error!(detail = %other, "internal failure");
                (ErrorKind::Internal, "internal error".to_string())
            }
        };
        NodeError { kind, message }
    }
}

/// Identity as presented to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoAmI {
    pub name: String,
    pub has_keys: bool,
    pub fingerprint: Option<String>,
    pub private_key_path: Option<String>,
    pub email: Option<String>,
    /// Display form, separator included.
    pub prompt: String,
}

impl From<&Identity> for WhoAmI {
    fn from(id: &Identity) -> Self {
        Self {
            name: id.name.clone(),
            has_keys: id.has_keys(),
            fingerprint: id.fingerprint().map(str::to_string),
            private_key_path: id.private_key_path().map(str::to_string),
            email: id.pgp_email.clone(),
            prompt: id.display_prompt(),
        }
    }
}

impl fmt::Display for WhoAmI {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Node name: {}", self.name)?;
        writeln!(f, "Node public key: {}", self.fingerprint.as_deref().unwrap_or("(none)"))?;
        let key_path = match self.private_key_path.as_deref() {
            None => "(none)",
            Some("") => "(not persisted)",
            Some(p) => p,
        };
        writeln!(f, "Node private key path: {key_path}")?;
        writeln!(f, "PGP email: {}", self.email.as_deref().unwrap_or("(none)"))?;
        write!(f, "Prompt: {}", self.prompt.trim_end())
    }
}

/// What one relay pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub purged_delivered: usize,
    pub purged_expired: usize,
    pub attempted: usize,
    pub delivered: usize,
    pub retrying: usize,
    /// Claimed by a concurrent caller and skipped this pass.
    pub in_flight: usize,
}

/// Facade policy knobs, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub developer_mode: bool,
    pub batch_size: usize,
    pub delivered_retention: Duration,
    pub max_age: Duration,
}

impl From<&Config> for NodeSettings {
    fn from(c: &Config) -> Self {
        Self {
            developer_mode: c.developer_mode,
            batch_size: c.relay.batch_size,
            delivered_retention: c.relay.delivered_retention,
            max_age: c.relay.max_age,
        }
    }
}

pub struct NodeFacade {
    identities: IdentityStore,
    keys: KeyManager,
    peers: PeerRegistry,
    relay: RelayQueue,
    transport: Arc<dyn Transport>,
    settings: NodeSettings,
}

impl NodeFacade {
    /// Open the node described by `config` with the default key backend and
    /// outbox transport.
    pub fn open<F>(config: &Config, name_provider: F) -> Result<Self, NodeError>
    where
        F: FnOnce() -> Result<String, AppError>,
    {
        let keys_dir = config.keys.persist_private_key.then(|| config.keys_dir());
        Self::with_parts(
            Database::open(&config.db_path)?,
            Arc::new(Ed25519Backend::new(keys_dir)),
            Arc::new(OutboxTransport::new(config.relay.outbox_file.clone())),
            NodeSettings::from(config),
            name_provider,
        )
    }

    /// Initialize every table and make sure the identity exists.
    pub fn with_parts<F>(
        db: Database,
        backend: Arc<dyn KeyBackend>,
        transport: Arc<dyn Transport>,
        settings: NodeSettings,
        name_provider: F,
    ) -> Result<Self, NodeError>
    where
        F: FnOnce() -> Result<String, AppError>,
    {
        let identities = IdentityStore::new(db.clone());
        let peers = PeerRegistry::new(db.clone());
        let relay = RelayQueue::new(db.clone());
        identities.initialize()?;
        peers.initialize()?;
        relay.initialize()?;

        let identity = identities.ensure_identity(name_provider)?;
        info!(name = %identity.name, has_keys = identity.has_keys(), db = %db.path().display(), "node ready");

        Ok(Self {
            keys: KeyManager::new(identities.clone(), backend),
            identities,
            peers,
            relay,
            transport,
            settings,
        })
    }

    pub fn who_am_i(&self) -> Result<WhoAmI, NodeError> {
        Ok(WhoAmI::from(&self.identities.get()?))
    }

    /// Set the prompt label. Blank text restores the default.
    pub fn set_prompt(&self, text: &str) -> Result<WhoAmI, NodeError> {
        let text = text.trim();
        let update = if text.is_empty() {
            IdentityUpdate { prompt: Field::Clear, ..IdentityUpdate::default() }
        } else {
            IdentityUpdate::prompt(text)
        };
        Ok(WhoAmI::from(&self.identities.update(&update)?))
    }

    pub fn generate_keys(
        &self,
        email: &str,
        prompts: &mut dyn KeyPrompts,
    ) -> Result<KeyOutcome, NodeError> {
        let identity = self.identities.get()?;
        Ok(self.keys.generate_keys(&identity, email, prompts)?)
    }

    pub fn register_peer(&self, name: &str, fingerprint: &str, address: &str) -> Result<Peer, NodeError> {
        Ok(self.peers.register(NewPeer::new(name, fingerprint, address))?)
    }

    pub fn lookup_peer(&self, fingerprint: &str) -> Result<Peer, NodeError> {
        Ok(self.peers.lookup(fingerprint)?)
    }

    pub fn peers(&self) -> Result<Vec<Peer>, NodeError> {
        Ok(self.peers.list().collect::<Result<Vec<_>, _>>()?)
    }

    /// Accept a message for relay; returns its id.
    pub fn send_message(&self, destination: &str, payload: &str) -> Result<String, NodeError> {
        Ok(self.relay.enqueue(destination, payload)?)
    }

    pub fn deliver(&self, message_id: &str) -> Result<Delivery, NodeError> {
        Ok(self.relay.attempt_delivery(message_id, &self.peers, self.transport.as_ref())?)
    }

    pub fn acknowledge(&self, message_id: &str) -> Result<(), NodeError> {
        Ok(self.relay.acknowledge(message_id)?)
    }

    pub fn messages(&self) -> Result<Vec<RelayMessage>, NodeError> {
        Ok(self.relay.list()?)
    }

    /// One relay pass: apply retention, then attempt up to `batch_size`
    /// pending messages once each.
    pub fn tick(&self) -> Result<TickReport, NodeError> {
        let mut report = TickReport {
            purged_delivered: self.relay.purge_delivered(self.settings.delivered_retention)?,
            purged_expired: self.relay.purge_expired(self.settings.max_age)?,
            ..TickReport::default()
        };

        for message in self.relay.pending(self.settings.batch_size)? {
            report.attempted += 1;
            match self.relay.attempt_delivery(&message.id, &self.peers, self.transport.as_ref()) {
                Ok(Delivery::Delivered) => report.delivered += 1,
                Ok(Delivery::AlreadyDelivered) => {}
                Ok(Delivery::InFlight) => report.in_flight += 1,
                Err(e) if e.is_retryable() => report.retrying += 1,
                // acknowledged or purged by another caller mid-pass
                Err(AppError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        debug!(?report, "relay tick");
        Ok(report)
    }

    /// Raw identity rows. Developer mode only.
    pub fn list_core(&self) -> Result<Vec<Identity>, NodeError> {
        self.require_developer_mode("list_core")?;
        Ok(self.identities.records()?)
    }

    /// Replace the identity with a fresh one named by `name_provider`.
    /// Developer mode only. The name is obtained before anything is dropped;
    /// if the provider fails the current identity stays.
    pub fn drop_core<F>(&self, name_provider: F) -> Result<WhoAmI, NodeError>
    where
        F: FnOnce() -> Result<String, AppError>,
    {
        self.require_developer_mode("drop_core")?;
        let name = name_provider()?;
        Ok(WhoAmI::from(&self.identities.reset_with(&name)?))
    }

    fn require_developer_mode(&self, op: &str) -> Result<(), NodeError> {
        if self.settings.developer_mode {
            Ok(())
        } else {
            Err(AppError::Denied(format!("{op} requires developer_mode")).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Answers;
    use tempfile::TempDir;

    struct AlwaysOk;

    impl Transport for AlwaysOk {
        fn send(&self, _: &str, _: &str) -> Result<(), String> {
            Ok(())
        }
    }

    fn settings(developer_mode: bool) -> NodeSettings {
        NodeSettings {
            developer_mode,
            batch_size: 10,
            delivered_retention: Duration::from_secs(3600),
            max_age: Duration::from_secs(3600),
        }
    }

    fn node(developer_mode: bool) -> (TempDir, NodeFacade) {
        let tmp = TempDir::new().unwrap();
        let node = NodeFacade::with_parts(
            Database::open(&tmp.path().join("pterm.db")).unwrap(),
            Arc::new(Ed25519Backend::new(None)),
            Arc::new(AlwaysOk),
            settings(developer_mode),
            || Ok("alpha".into()),
        )
        .unwrap();
        (tmp, node)
    }

    #[test]
    fn set_prompt_round_trips_with_separator() {
        let (_tmp, node) = node(false);
        node.set_prompt("ops").unwrap();
        assert_eq!(node.who_am_i().unwrap().prompt, "ops ");
        node.set_prompt("  ").unwrap();
        assert_eq!(node.who_am_i().unwrap().prompt, "pterm> ");
    }

    #[test]
    fn who_am_i_display() {
        let (_tmp, node) = node(false);
        let text = node.who_am_i().unwrap().to_string();
        assert!(text.contains("Node name: alpha"));
        assert!(text.contains("Node public key: (none)"));
        node.generate_keys("", &mut Answers::YES).unwrap();
        let text = node.who_am_i().unwrap().to_string();
        assert!(text.contains("Node private key path: (not persisted)"));
    }

    #[test]
    fn storage_details_are_hidden() {
        let e: NodeError = AppError::Storage("disk I/O error at /secret/path".into()).into();
        assert_eq!(e.kind, ErrorKind::Storage);
        assert!(!e.message.contains("/secret/path"));
    }

    #[test]
    fn tick_counts_outcomes() {
        let (_tmp, node) = node(false);
        node.register_peer("bravo", "FP-B", "addr").unwrap();
        node.send_message("FP-B", "one").unwrap();
        node.send_message("FP-Z", "two").unwrap();

        let report = node.tick().unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.retrying, 1);

        let report = node.tick().unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.retrying, 1);
    }

    #[test]
    fn developer_commands_are_gated() {
        let (_tmp, node) = node(false);
        assert_eq!(node.list_core().unwrap_err().kind, ErrorKind::Denied);
        assert_eq!(node.drop_core(|| Ok("x".into())).unwrap_err().kind, ErrorKind::Denied);
        assert_eq!(node.who_am_i().unwrap().name, "alpha");
    }

    #[test]
    fn drop_core_keeps_identity_when_name_is_unavailable() {
        let (_tmp, node) = node(true);
        node.generate_keys("", &mut Answers::YES).unwrap();
        let before = node.who_am_i().unwrap();

        let err = node
            .drop_core(|| Err(AppError::Io(std::io::ErrorKind::UnexpectedEof.into())))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(node.who_am_i().unwrap(), before);

        let err = node.drop_core(|| Ok("   ".into())).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(node.who_am_i().unwrap(), before);
    }

    /// Records sends after holding each one open for `delay`.
    struct SlowRecorder {
        delay: Duration,
        sent: std::sync::Mutex<Vec<String>>,
    }

    impl Transport for SlowRecorder {
        fn send(&self, _: &str, payload: &str) -> Result<(), String> {
            std::thread::sleep(self.delay);
            self.sent.lock().unwrap().push(payload.to_string());
            Ok(())
        }
    }

    #[test]
    fn deliver_and_tick_race_sends_once() {
        let tmp = TempDir::new().unwrap();
        let transport = Arc::new(SlowRecorder {
            delay: Duration::from_millis(200),
            sent: Default::default(),
        });
        let node = NodeFacade::with_parts(
            Database::open(&tmp.path().join("pterm.db")).unwrap(),
            Arc::new(Ed25519Backend::new(None)),
            transport.clone(),
            settings(false),
            || Ok("alpha".into()),
        )
        .unwrap();
        node.register_peer("bravo", "FP-B", "addr").unwrap();
        let id = node.send_message("FP-B", "hello").unwrap();

        let (delivery, report) = std::thread::scope(|s| {
            let shell = s.spawn(|| node.deliver(&id).unwrap());
            let ticker = s.spawn(|| node.tick().unwrap());
            (shell.join().unwrap(), ticker.join().unwrap())
        });

        assert_eq!(*transport.sent.lock().unwrap(), vec!["hello".to_string()]);
        let delivered_by_shell = usize::from(delivery == Delivery::Delivered);
        assert_eq!(delivered_by_shell + report.delivered, 1);
        assert!(node.messages().unwrap()[0].delivery_success);
    }

    #[test]
    fn node_error_keeps_its_kind_as_app_error() {
        let e: AppError = NodeError { kind: ErrorKind::Validation, message: "bad".into() }.into();
        assert!(matches!(e, AppError::Validation(ref m) if m == "bad"));
        let e: AppError = NodeError { kind: ErrorKind::Internal, message: "x".into() }.into();
        assert!(matches!(e, AppError::Internal(_)));
    }

    #[test]
    fn drop_core_recreates_identity() {
        let (_tmp, node) = node(true);
        node.generate_keys("", &mut Answers::YES).unwrap();
        let who = node.drop_core(|| Ok("beta".into())).unwrap();
        assert_eq!(who.name, "beta");
        assert!(!who.has_keys);
        assert_eq!(node.list_core().unwrap().len(), 1);
    }
}
