//! Key generation and binding for the node identity.
//!
//! [`KeyManager::generate_keys`] walks the identity through two confirmation
//! points (overwrite, then the assembled user binding) before anything is
//! written. The crypto work sits behind [`KeyBackend`]; [`Ed25519Backend`] is
//! the production implementation.
//!
//! Key material layout under `keys_dir`:
//! ```text
//! keys/
//! └── {first 16 fingerprint chars}/
//!     ├── id_ed25519       (32-byte signing key seed, mode 0600)
//!     ├── id_ed25519.pub   (32-byte verifying key, mode 0644)
//!     └── binding.json     (user id, preferences, self-signature)
//! ```

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{
    error::AppError,
    identity::{self, BoundKeys, Field, Identity, IdentityStore, IdentityUpdate},
};

/// Signature algorithm used for every generated identity key.
pub const KEY_ALGORITHM: KeyAlgorithm = KeyAlgorithm::Ed25519;

/// Number of fingerprint bytes kept (40 hex chars).
const FINGERPRINT_BYTES: usize = 20;

const SECRET_FILE: &str = "id_ed25519";
const PUBLIC_FILE: &str = "id_ed25519.pub";
const BINDING_FILE: &str = "binding.json";

// ── Binding parameters ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    Ed25519,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCapability {
    Sign,
    EncryptCommunications,
    EncryptStorage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
    Sha224,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherAlgorithm {
    Aes256,
    Aes192,
    Aes128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    Zlib,
    Bzip2,
    Zip,
    Uncompressed,
}

pub const CAPABILITIES: [KeyCapability; 3] = [
    KeyCapability::Sign,
    KeyCapability::EncryptCommunications,
    KeyCapability::EncryptStorage,
];
pub const HASH_PREFERENCES: [HashAlgorithm; 4] = [
    HashAlgorithm::Sha256,
    HashAlgorithm::Sha384,
    HashAlgorithm::Sha512,
    HashAlgorithm::Sha224,
];
pub const CIPHER_PREFERENCES: [CipherAlgorithm; 3] = [
    CipherAlgorithm::Aes256,
    CipherAlgorithm::Aes192,
    CipherAlgorithm::Aes128,
];
pub const COMPRESSION_PREFERENCES: [CompressionAlgorithm; 4] = [
    CompressionAlgorithm::Zlib,
    CompressionAlgorithm::Bzip2,
    CompressionAlgorithm::Zip,
    CompressionAlgorithm::Uncompressed,
];

/// Identity metadata bound to a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBinding {
    pub name: String,
    pub email: Option<String>,
    pub capabilities: Vec<KeyCapability>,
    pub hash_preferences: Vec<HashAlgorithm>,
    pub cipher_preferences: Vec<CipherAlgorithm>,
    pub compression_preferences: Vec<CompressionAlgorithm>,
}

impl UserBinding {
    /// Binding with the fixed capability set and preference lists.
    pub fn new(name: impl Into<String>, email: Option<String>) -> Self {
        Self {
            name: name.into(),
            email,
            capabilities: CAPABILITIES.to_vec(),
            hash_preferences: HASH_PREFERENCES.to_vec(),
            cipher_preferences: CIPHER_PREFERENCES.to_vec(),
            compression_preferences: COMPRESSION_PREFERENCES.to_vec(),
        }
    }

    /// `Name <email>`, or just `Name`.
    pub fn user_id(&self) -> String {
        match &self.email {
            Some(email) => format!("{} <{email}>", self.name),
            None => self.name.clone(),
        }
    }
}

// ── Key handle ───────────────────────────────────────────────────────────────

/// A generated key pair, optionally carrying its user binding.
pub struct KeyHandle {
    algorithm: KeyAlgorithm,
    signing_key: SigningKey,
    binding: Option<UserBinding>,
}

impl KeyHandle {
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Uppercase hex of the first 20 bytes of `SHA256(verifying_key)`.
    pub fn fingerprint(&self) -> String {
        compute_fingerprint(&self.verifying_key_bytes())
    }

    pub fn binding(&self) -> Option<&UserBinding> {
        self.binding.as_ref()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandle")
            .field("algorithm", &self.algorithm)
            .field("fingerprint", &self.fingerprint())
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

pub fn compute_fingerprint(verifying_key_bytes: &[u8; 32]) -> String {
    let digest = Sha256::digest(verifying_key_bytes);
    hex::encode_upper(&digest[..FINGERPRINT_BYTES])
}

// ── Backend ──────────────────────────────────────────────────────────────────

/// Crypto collaborator: key generation, binding and key material storage.
pub trait KeyBackend: Send + Sync {
    fn generate(&self, algorithm: KeyAlgorithm) -> Result<KeyHandle, AppError>;

    /// Attach `binding` to the key, replacing any previous one.
    fn bind_identity(&self, handle: KeyHandle, binding: UserBinding) -> Result<KeyHandle, AppError>;

    /// Persist private key material. Returns its location, or `""` when the
    /// backend keeps nothing on disk.
    fn persist(&self, handle: &KeyHandle) -> Result<String, AppError>;

    /// Remove material previously written by [`persist`](Self::persist).
    fn discard(&self, location: &str) -> Result<(), AppError>;
}

/// On-disk shape of `binding.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct BindingRecord {
    pub algorithm: KeyAlgorithm,
    pub fingerprint: String,
    pub user_id: String,
    pub binding: UserBinding,
    /// Hex ed25519 signature over the JSON-serialized `binding`.
    pub self_signature: String,
}

/// Ed25519 backend. With no `keys_dir` nothing is written and `persist`
/// returns the empty-path sentinel.
#[derive(Debug, Clone, Default)]
pub struct Ed25519Backend {
    keys_dir: Option<PathBuf>,
}

impl Ed25519Backend {
    pub fn new(keys_dir: Option<PathBuf>) -> Self {
        Self { keys_dir }
    }

    fn write_material(dir: &Path, handle: &KeyHandle) -> Result<(), AppError> {
        let secret_path = dir.join(SECRET_FILE);
        let pub_path = dir.join(PUBLIC_FILE);
        fs::write(&secret_path, handle.signing_key.to_bytes())
            .map_err(|e| AppError::Crypto(format!("cannot write {SECRET_FILE}: {e}")))?;
        fs::write(&pub_path, handle.verifying_key_bytes())
            .map_err(|e| AppError::Crypto(format!("cannot write {PUBLIC_FILE}: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&secret_path, fs::Permissions::from_mode(0o600))
                .map_err(|e| AppError::Crypto(format!("cannot set permissions on {SECRET_FILE}: {e}")))?;
            fs::set_permissions(&pub_path, fs::Permissions::from_mode(0o644))
                .map_err(|e| AppError::Crypto(format!("cannot set permissions on {PUBLIC_FILE}: {e}")))?;
        }

        Self::write_binding(dir, handle)
    }

    fn write_binding(dir: &Path, handle: &KeyHandle) -> Result<(), AppError> {
        let Some(binding) = handle.binding() else {
            return Ok(());
        };
        let canonical = serde_json::to_vec(binding)
            .map_err(|e| AppError::Crypto(format!("serialize binding: {e}")))?;
        let record = BindingRecord {
            algorithm: handle.algorithm(),
            fingerprint: handle.fingerprint(),
            user_id: binding.user_id(),
            binding: binding.clone(),
            self_signature: hex::encode(handle.sign(&canonical).to_bytes()),
        };
        let data = serde_json::to_string_pretty(&record)
            .map_err(|e| AppError::Crypto(format!("serialize binding record: {e}")))?;
        fs::write(dir.join(BINDING_FILE), data)
            .map_err(|e| AppError::Crypto(format!("cannot write {BINDING_FILE}: {e}")))
    }
}

impl KeyBackend for Ed25519Backend {
    fn generate(&self, algorithm: KeyAlgorithm) -> Result<KeyHandle, AppError> {
        match algorithm {
            KeyAlgorithm::Ed25519 => Ok(KeyHandle {
                algorithm,
                signing_key: SigningKey::generate(&mut OsRng),
                binding: None,
            }),
        }
    }

    fn bind_identity(&self, mut handle: KeyHandle, binding: UserBinding) -> Result<KeyHandle, AppError> {
        if binding.name.trim().is_empty() {
            return Err(AppError::Crypto("cannot bind a key to an empty name".into()));
        }
        handle.binding = Some(binding);
        Ok(handle)
    }

    fn persist(&self, handle: &KeyHandle) -> Result<String, AppError> {
        let Some(keys_dir) = &self.keys_dir else {
            return Ok(String::new());
        };
        let fingerprint = handle.fingerprint();
        let dir = keys_dir.join(&fingerprint[..16]);
        fs::create_dir_all(&dir)
            .map_err(|e| AppError::Crypto(format!("cannot create {}: {e}", dir.display())))?;

        // A half-written directory must not outlive the error.
        if let Err(e) = Self::write_material(&dir, handle) {
            if let Err(rm) = fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %rm, "failed to remove partial key material");
            }
            return Err(e);
        }
        debug!(dir = %dir.display(), "key material written");
        Ok(dir.display().to_string())
    }

    fn discard(&self, location: &str) -> Result<(), AppError> {
        if location.is_empty() {
            return Ok(());
        }
        fs::remove_dir_all(location)
            .map_err(|e| AppError::Crypto(format!("cannot remove {location}: {e}")))
    }
}

/// Read a persisted key directory back and check that the pair matches and
/// the binding's self-signature verifies.
pub fn verify_key_dir(dir: &Path) -> Result<BindingRecord, AppError> {
    let seed: [u8; 32] = fs::read(dir.join(SECRET_FILE))
        .map_err(|e| AppError::Crypto(format!("cannot read {SECRET_FILE}: {e}")))?
        .try_into()
        .map_err(|_| AppError::Crypto(format!("{SECRET_FILE} is not 32 bytes")))?;
    let vk: [u8; 32] = fs::read(dir.join(PUBLIC_FILE))
        .map_err(|e| AppError::Crypto(format!("cannot read {PUBLIC_FILE}: {e}")))?
        .try_into()
        .map_err(|_| AppError::Crypto(format!("{PUBLIC_FILE} is not 32 bytes")))?;

    if SigningKey::from_bytes(&seed).verifying_key().to_bytes() != vk {
        return Err(AppError::Crypto(
            "keypair mismatch: verifying key does not match signing key seed".into(),
        ));
    }

    let raw = fs::read_to_string(dir.join(BINDING_FILE))
        .map_err(|e| AppError::Crypto(format!("cannot read {BINDING_FILE}: {e}")))?;
    let record: BindingRecord = serde_json::from_str(&raw)
        .map_err(|e| AppError::Crypto(format!("malformed {BINDING_FILE}: {e}")))?;

    let verifying_key = VerifyingKey::from_bytes(&vk)
        .map_err(|e| AppError::Crypto(format!("invalid verifying key: {e}")))?;
    let sig_bytes: [u8; 64] = hex::decode(&record.self_signature)
        .map_err(|e| AppError::Crypto(format!("self-signature is not hex: {e}")))?
        .try_into()
        .map_err(|_| AppError::Crypto("self-signature is not 64 bytes".into()))?;
    let canonical = serde_json::to_vec(&record.binding)
        .map_err(|e| AppError::Crypto(format!("serialize binding: {e}")))?;
    verifying_key
        .verify(&canonical, &Signature::from_bytes(&sig_bytes))
        .map_err(|e| AppError::Crypto(format!("self-signature does not verify: {e}")))?;

    if record.fingerprint != compute_fingerprint(&vk) {
        return Err(AppError::Crypto("binding fingerprint does not match key".into()));
    }
    Ok(record)
}

// ── KeyManager ───────────────────────────────────────────────────────────────

/// Caller-supplied answers to the two confirmation points.
pub trait KeyPrompts {
    /// The identity already has keys; replace them?
    fn confirm_overwrite(&mut self, current_fingerprint: &str) -> bool;

    /// Bind this name and email to the new key?
    fn confirm_binding(&mut self, name: &str, email: Option<&str>) -> bool;
}

/// Fixed answers, for non-interactive callers.
#[derive(Debug, Clone, Copy)]
pub struct Answers {
    pub overwrite: bool,
    pub binding: bool,
}

impl Answers {
    pub const YES: Answers = Answers { overwrite: true, binding: true };
}

impl KeyPrompts for Answers {
    fn confirm_overwrite(&mut self, _current_fingerprint: &str) -> bool {
        self.overwrite
    }

    fn confirm_binding(&mut self, _name: &str, _email: Option<&str>) -> bool {
        self.binding
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    OverwriteDeclined,
    BindingDeclined,
    /// Another generation is running on this manager.
    InProgress,
    /// The identity's keys changed between the overwrite check and the write.
    IdentityChanged,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AbortReason::OverwriteDeclined => "existing keys kept",
            AbortReason::BindingDeclined => "user binding not confirmed",
            AbortReason::InProgress => "key generation already in progress",
            AbortReason::IdentityChanged => "identity changed during key generation",
        })
    }
}

/// Result of a key generation that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    Generated(BoundKeys),
    Aborted(AbortReason),
}

/// Clears the in-progress flag on drop.
struct GenerationGuard<'a>(&'a AtomicBool);

impl<'a> GenerationGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct KeyManager {
    identities: IdentityStore,
    backend: Arc<dyn KeyBackend>,
    in_progress: AtomicBool,
}

impl KeyManager {
    pub fn new(identities: IdentityStore, backend: Arc<dyn KeyBackend>) -> Self {
        Self { identities, backend, in_progress: AtomicBool::new(false) }
    }

    /// Generate a key pair for `identity` and bind it.
    ///
    /// Nothing is written unless both confirmations pass and the email is
    /// valid. The final identity write is compare-and-set against the keys
    /// `identity` carried, so a concurrent change aborts rather than being
    /// overwritten.
    pub fn generate_keys(
        &self,
        identity: &Identity,
        email_input: &str,
        prompts: &mut dyn KeyPrompts,
    ) -> Result<KeyOutcome, AppError> {
        let Some(_guard) = GenerationGuard::acquire(&self.in_progress) else {
            return Ok(KeyOutcome::Aborted(AbortReason::InProgress));
        };

        if let Some(current) = identity.fingerprint() {
            if !prompts.confirm_overwrite(current) {
                debug!("key overwrite declined");
                return Ok(KeyOutcome::Aborted(AbortReason::OverwriteDeclined));
            }
        }

        let email = match email_input.trim() {
            "" => None,
            e => {
                identity::validate_email(e)?;
                Some(e.to_string())
            }
        };
        if identity.name.trim().is_empty() {
            return Err(AppError::Validation("node name cannot be empty".into()));
        }

        let handle = self.backend.generate(KEY_ALGORITHM)?;
        let handle = self
            .backend
            .bind_identity(handle, UserBinding::new(identity.name.clone(), email.clone()))?;

        if !prompts.confirm_binding(&identity.name, email.as_deref()) {
            debug!("key binding declined");
            return Ok(KeyOutcome::Aborted(AbortReason::BindingDeclined));
        }

        let location = self.backend.persist(&handle)?;
        let keys = BoundKeys { fingerprint: handle.fingerprint(), private_key_path: location };

        let mut update = IdentityUpdate::bind_keys(keys.clone());
        update.pgp_email = match email {
            Some(e) => Field::Set(e),
            None => Field::Clear,
        };

        let expected = identity.fingerprint().map(str::to_string);
        let mut changed = false;
        let written = self.identities.update_checked(&update, |current| {
            if current.fingerprint().map(str::to_string) != expected {
                changed = true;
                return Err(AppError::Validation("identity keys changed".into()));
            }
            Ok(())
        });

        match written {
            Ok(_) => {
                info!(fingerprint = %keys.fingerprint, algorithm = ?KEY_ALGORITHM, "keys generated");
                if let Some(old) = identity.private_key_path().filter(|p| !p.is_empty()) {
                    info!(old_key_dir = old, "previous key material left on disk");
                }
                Ok(KeyOutcome::Generated(keys))
            }
            Err(e) => {
                if let Err(discard_err) = self.backend.discard(&keys.private_key_path) {
                    warn!(error = %discard_err, "failed to remove orphaned key material");
                }
                if changed {
                    Ok(KeyOutcome::Aborted(AbortReason::IdentityChanged))
                } else {
                    Err(e)
                }
            }
        }
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        keys_dir: PathBuf,
        identities: IdentityStore,
        manager: KeyManager,
    }

    fn fixture_with(backend: impl FnOnce(PathBuf) -> Arc<dyn KeyBackend>) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let keys_dir = tmp.path().join("keys");
        let identities = IdentityStore::new(Database::open(&tmp.path().join("pterm.db")).unwrap());
        identities.initialize().unwrap();
        identities.ensure_identity(|| Ok("alpha".into())).unwrap();
        let manager = KeyManager::new(identities.clone(), backend(keys_dir.clone()));
        Fixture { _tmp: tmp, keys_dir, identities, manager }
    }

    fn fixture() -> Fixture {
        fixture_with(|dir| Arc::new(Ed25519Backend::new(Some(dir))))
    }

    /// Records every prompt it is shown.
    #[derive(Default)]
    struct Recorder {
        overwrite: bool,
        binding: bool,
        seen_overwrite: Vec<String>,
        seen_binding: Vec<(String, Option<String>)>,
    }

    impl KeyPrompts for Recorder {
        fn confirm_overwrite(&mut self, fp: &str) -> bool {
            self.seen_overwrite.push(fp.to_string());
            self.overwrite
        }
        fn confirm_binding(&mut self, name: &str, email: Option<&str>) -> bool {
            self.seen_binding.push((name.to_string(), email.map(str::to_string)));
            self.binding
        }
    }

    struct FailingBackend;

    impl KeyBackend for FailingBackend {
        fn generate(&self, _: KeyAlgorithm) -> Result<KeyHandle, AppError> {
            Err(AppError::Crypto("entropy source unavailable".into()))
        }
        fn bind_identity(&self, h: KeyHandle, _: UserBinding) -> Result<KeyHandle, AppError> {
            Ok(h)
        }
        fn persist(&self, _: &KeyHandle) -> Result<String, AppError> {
            Ok(String::new())
        }
        fn discard(&self, _: &str) -> Result<(), AppError> {
            Ok(())
        }
    }

    fn key_dirs(dir: &Path) -> usize {
        fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn fingerprint_is_40_uppercase_hex() {
        let h = Ed25519Backend::default().generate(KEY_ALGORITHM).unwrap();
        let fp = h.fingerprint();
        assert_eq!(fp.len(), 40);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn user_id_formats() {
        assert_eq!(UserBinding::new("alpha", None).user_id(), "alpha");
        assert_eq!(
            UserBinding::new("alpha", Some("a@b.co".into())).user_id(),
            "alpha <a@b.co>"
        );
    }

    #[test]
    fn generate_with_valid_email_binds_keys() {
        let f = fixture();
        let id = f.identities.get().unwrap();
        let mut prompts = Recorder { overwrite: true, binding: true, ..Default::default() };

        let outcome = f.manager.generate_keys(&id, "a@b.co", &mut prompts).unwrap();
        let KeyOutcome::Generated(keys) = outcome else { panic!("expected keys") };

        let after = f.identities.get().unwrap();
        assert!(after.has_keys());
        assert!(!after.fingerprint().unwrap().is_empty());
        assert_eq!(after.keys, Some(keys.clone()));
        assert_eq!(after.pgp_email.as_deref(), Some("a@b.co"));
        assert!(prompts.seen_overwrite.is_empty());
        assert_eq!(prompts.seen_binding, vec![("alpha".to_string(), Some("a@b.co".to_string()))]);

        let record = verify_key_dir(Path::new(&keys.private_key_path)).unwrap();
        assert_eq!(record.fingerprint, keys.fingerprint);
        assert_eq!(record.user_id, "alpha <a@b.co>");
        assert_eq!(record.binding.capabilities, CAPABILITIES.to_vec());
    }

    #[test]
    fn empty_email_means_no_email() {
        let f = fixture();
        let id = f.identities.get().unwrap();
        let outcome = f.manager.generate_keys(&id, "  ", &mut Answers::YES).unwrap();
        assert!(matches!(outcome, KeyOutcome::Generated(_)));
        assert_eq!(f.identities.get().unwrap().pgp_email, None);
    }

    #[test]
    fn invalid_email_writes_nothing() {
        let f = fixture();
        let id = f.identities.get().unwrap();
        let mut prompts = Recorder { overwrite: true, binding: true, ..Default::default() };
        let err = f.manager.generate_keys(&id, "not-an-email", &mut prompts).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(f.identities.get().unwrap(), id);
        assert!(prompts.seen_binding.is_empty());
        assert_eq!(key_dirs(&f.keys_dir), 0);
    }

    #[test]
    fn declined_overwrite_writes_nothing() {
        let f = fixture();
        let id = f.identities.get().unwrap();
        f.manager.generate_keys(&id, "", &mut Answers::YES).unwrap();
        let keyed = f.identities.get().unwrap();

        let mut prompts = Recorder { overwrite: false, binding: true, ..Default::default() };
        let outcome = f.manager.generate_keys(&keyed, "a@b.co", &mut prompts).unwrap();
        assert_eq!(outcome, KeyOutcome::Aborted(AbortReason::OverwriteDeclined));
        assert_eq!(f.identities.get().unwrap(), keyed);
        assert_eq!(prompts.seen_overwrite, vec![keyed.fingerprint().unwrap().to_string()]);
        assert_eq!(key_dirs(&f.keys_dir), 1);
    }

    #[test]
    fn confirmed_overwrite_replaces_keys() {
        let f = fixture();
        let id = f.identities.get().unwrap();
        f.manager.generate_keys(&id, "", &mut Answers::YES).unwrap();
        let first = f.identities.get().unwrap();
        f.manager.generate_keys(&first, "", &mut Answers::YES).unwrap();
        let second = f.identities.get().unwrap();
        assert_ne!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn declined_binding_writes_nothing() {
        let f = fixture();
        let id = f.identities.get().unwrap();
        let mut answers = Answers { overwrite: true, binding: false };
        let outcome = f.manager.generate_keys(&id, "a@b.co", &mut answers).unwrap();
        assert_eq!(outcome, KeyOutcome::Aborted(AbortReason::BindingDeclined));
        assert_eq!(f.identities.get().unwrap(), id);
        assert_eq!(key_dirs(&f.keys_dir), 0);
    }

    #[test]
    fn crypto_failure_leaves_identity_untouched() {
        let f = fixture_with(|_| Arc::new(FailingBackend));
        let id = f.identities.get().unwrap();
        let err = f.manager.generate_keys(&id, "", &mut Answers::YES).unwrap_err();
        assert!(matches!(err, AppError::Crypto(_)));
        assert_eq!(f.identities.get().unwrap(), id);
    }

    #[test]
    fn stale_identity_aborts_and_cleans_up() {
        let f = fixture();
        let stale = f.identities.get().unwrap();
        f.manager.generate_keys(&stale, "", &mut Answers::YES).unwrap();
        let current = f.identities.get().unwrap();

        // `stale` still claims no keys, so no overwrite prompt is shown.
        let outcome = f.manager.generate_keys(&stale, "", &mut Answers::YES).unwrap();
        assert_eq!(outcome, KeyOutcome::Aborted(AbortReason::IdentityChanged));
        assert_eq!(f.identities.get().unwrap(), current);
        assert_eq!(key_dirs(&f.keys_dir), 1);
    }

    #[test]
    fn concurrent_generation_is_refused() {
        let f = fixture();
        let id = f.identities.get().unwrap();
        let _held = GenerationGuard::acquire(&f.manager.in_progress).unwrap();
        let outcome = f.manager.generate_keys(&id, "", &mut Answers::YES).unwrap();
        assert_eq!(outcome, KeyOutcome::Aborted(AbortReason::InProgress));
        drop(_held);
        assert!(matches!(
            f.manager.generate_keys(&id, "", &mut Answers::YES).unwrap(),
            KeyOutcome::Generated(_)
        ));
    }

    #[test]
    fn unpersisted_keys_use_empty_path_sentinel() {
        let f = fixture_with(|_| Arc::new(Ed25519Backend::new(None)));
        let id = f.identities.get().unwrap();
        f.manager.generate_keys(&id, "", &mut Answers::YES).unwrap();
        let after = f.identities.get().unwrap();
        assert!(after.has_keys());
        assert_eq!(after.private_key_path(), Some(""));
    }

    #[test]
    fn failed_persist_removes_partial_key_dir() {
        let tmp = TempDir::new().unwrap();
        let backend = Ed25519Backend::new(Some(tmp.path().to_path_buf()));
        let handle = backend.generate(KEY_ALGORITHM).unwrap();
        let handle = backend.bind_identity(handle, UserBinding::new("alpha", None)).unwrap();

        // A directory where binding.json should go makes the last write fail.
        let dir = tmp.path().join(&handle.fingerprint()[..16]);
        fs::create_dir_all(dir.join(BINDING_FILE)).unwrap();

        let err = backend.persist(&handle).unwrap_err();
        assert!(matches!(err, AppError::Crypto(_)));
        assert!(!dir.exists());
    }

    #[test]
    fn unwritable_keys_dir_leaves_identity_untouched() {
        let f = fixture();
        fs::write(&f.keys_dir, b"not a directory").unwrap();
        let id = f.identities.get().unwrap();
        let err = f.manager.generate_keys(&id, "", &mut Answers::YES).unwrap_err();
        assert!(matches!(err, AppError::Crypto(_)));
        assert_eq!(f.identities.get().unwrap(), id);
    }

    #[cfg(unix)]
    #[test]
    fn secret_key_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let f = fixture();
        let id = f.identities.get().unwrap();
        let KeyOutcome::Generated(keys) = f.manager.generate_keys(&id, "", &mut Answers::YES).unwrap()
        else {
            panic!("expected keys")
        };
        let mode = fs::metadata(Path::new(&keys.private_key_path).join(SECRET_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
