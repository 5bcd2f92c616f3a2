//! Persistent credential and routing-entity store
//!
//! One JSON document (`{"credentials": {..}, "routing_entities": {..}}`)
//! is the single source of truth, shared by every gateway process pointed at
//! the same path. Every mutation rewrites it atomically (temp file + rename,
//! mode 0600). Secrets are stored as cipher envelopes and held decrypted in
//! memory only inside `Secret`.
//!
//! Locking, outermost first:
//! - a per-credential row lock (`lock_credential`) held across a whole
//!   read-refresh-write cycle: an in-process mutex plus an exclusive
//!   advisory lock on `<file>.locks/<id>.lock`
//! - a tokio Mutex over the in-memory mirror
//! - an advisory lock on `<file>.locks/document.lock` around each read or
//!   rewrite of the file
//!
//! Every mutation re-reads the file under the document lock, applies the
//! change to a copy, and only replaces the mirror once the write succeeded.
//! A failed write leaves memory exactly as it was on disk.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::{Secret, now_millis};
use fs2::FileExt;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::cipher::SecretCipher;
use crate::error::{Error, Result};
use crate::model::{
    Credential, CredentialSummary, NewCredential, RoutingEntity, StoredCredential, TokenUpdate,
};

/// Prefix of issued client tokens, so they are recognizable in config and logs.
const CLIENT_TOKEN_PREFIX: &str = "gwk_";

const DOCUMENT_LOCK: &str = "document.lock";

#[derive(Clone)]
struct Row {
    credential: Credential,
    secret_envelope: String,
    refresh_envelope: Option<String>,
}

impl Row {
    fn stored(&self) -> StoredCredential {
        let c = &self.credential;
        StoredCredential {
            id: c.id.clone(),
            name: c.name.clone(),
            kind: c.kind,
            provider_kind: c.provider_kind,
            secret: self.secret_envelope.clone(),
            refresh_secret: self.refresh_envelope.clone(),
            expires_at_ms: c.expires_at_ms,
            scopes: c.scopes.clone(),
            region: c.region.clone(),
            active: c.active,
            created_at_ms: c.created_at_ms,
            last_used_at_ms: c.last_used_at_ms,
        }
    }

    /// Whether `stored` carries the same envelopes, so the decrypted secrets
    /// can be reused.
    fn same_envelopes(&self, stored: &StoredCredential) -> bool {
        self.secret_envelope == stored.secret && self.refresh_envelope == stored.refresh_secret
    }
}

#[derive(Default, Clone)]
struct State {
    rows: BTreeMap<String, Row>,
    routing_entities: BTreeMap<String, RoutingEntity>,
    /// File contents as last read or written by this process.
    snapshot: String,
}

#[derive(Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    credentials: BTreeMap<String, StoredCredential>,
    #[serde(default)]
    routing_entities: BTreeMap<String, RoutingEntity>,
}

/// Thread-safe credential store backed by an encrypted JSON file.
pub struct CredentialStore {
    path: PathBuf,
    lock_dir: PathBuf,
    cipher: SecretCipher,
    state: Mutex<State>,
    row_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialStore {
    /// Load the document at `path`, decrypting every secret.
    ///
    /// If the file doesn't exist it is created empty (cold start). A wrong
    /// master key fails here rather than on first use.
    pub async fn load(path: PathBuf, cipher: SecretCipher) -> Result<Self> {
        let lock_dir = lock_dir_for(&path)?;
        tokio::fs::create_dir_all(&lock_dir)
            .await
            .map_err(|e| Error::Io(format!("creating lock directory: {e}")))?;

        let store = Self {
            path,
            lock_dir,
            cipher,
            state: Mutex::new(State::default()),
            row_locks: std::sync::Mutex::new(HashMap::new()),
        };

        {
            let mut state = store.state.lock().await;
            let _document = store.lock_document().await?;
            if store.path.exists() {
                store.sync_from_disk(&mut state).await?;
                info!(
                    path = %store.path.display(),
                    credentials = state.rows.len(),
                    routing_entities = state.routing_entities.len(),
                    "loaded credential store"
                );
            } else {
                info!(path = %store.path.display(), "credential file not found, starting with empty store");
                state.snapshot = store.persist(&state).await?;
            }
        }
        Ok(store)
    }

    async fn lock_document(&self) -> Result<FileLock> {
        FileLock::acquire(self.lock_dir.join(DOCUMENT_LOCK)).await
    }

    /// Bring the mirror up to date with the file. Rows whose envelopes are
    /// unchanged keep their decrypted secrets; the rest are decrypted again.
    /// Caller holds the document lock.
    async fn sync_from_disk(&self, state: &mut State) -> Result<()> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            // Recreated by the next write.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::Io(format!("reading credential file: {e}"))),
        };
        if contents == state.snapshot {
            return Ok(());
        }

        let document: Document = serde_json::from_str(&contents)
            .map_err(|e| Error::Parse(format!("parsing credential file: {e}")))?;
        let mut rows = BTreeMap::new();
        for (id, stored) in document.credentials {
            let row = match state.rows.get(&id) {
                Some(known) if known.same_envelopes(&stored) => row_from_stored(
                    stored,
                    known.credential.secret.clone(),
                    known.credential.refresh_secret.clone(),
                ),
                _ => decrypt_row(&self.cipher, stored)?,
            };
            rows.insert(id, row);
        }
        debug!(credentials = rows.len(), "reloaded credential document");

        state.rows = rows;
        state.routing_entities = document.routing_entities;
        state.snapshot = contents;
        Ok(())
    }

    /// Serialize `state` and write it. Returns the written contents.
    async fn persist(&self, state: &State) -> Result<String> {
        let document = Document {
            credentials: state
                .rows
                .iter()
                .map(|(id, row)| (id.clone(), row.stored()))
                .collect(),
            routing_entities: state.routing_entities.clone(),
        };
        let json = serde_json::to_string_pretty(&document)
            .map_err(|e| Error::Parse(format!("serializing credential document: {e}")))?;
        write_atomic(&self.path, &json).await?;
        Ok(json)
    }

    /// Read-modify-write under the document lock.
    ///
    /// `change` runs against a copy of the freshly synced state; the copy
    /// replaces the mirror only after it reached disk.
    async fn mutate<T>(&self, change: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().await;
        let _document = self.lock_document().await?;
        self.sync_from_disk(&mut state).await?;

        let mut next = state.clone();
        let out = change(&mut next)?;
        next.snapshot = self.persist(&next).await?;
        *state = next;
        Ok(out)
    }

    /// Look a credential up by its unique name.
    pub async fn fetch_by_name(&self, name: &str) -> Result<Credential> {
        let state = self.state.lock().await;
        state
            .rows
            .values()
            .find(|row| row.credential.name == name)
            .map(|row| row.credential.clone())
            .ok_or_else(|| Error::NotFound(format!("credential named {name}")))
    }

    pub async fn credential(&self, id: &str) -> Option<Credential> {
        let state = self.state.lock().await;
        state.rows.get(id).map(|row| row.credential.clone())
    }

    /// The row as currently persisted, picking up other processes' writes.
    pub async fn reload_credential(&self, id: &str) -> Result<Credential> {
        let mut state = self.state.lock().await;
        let _document = self.lock_document().await?;
        self.sync_from_disk(&mut state).await?;
        state
            .rows
            .get(id)
            .map(|row| row.credential.clone())
            .ok_or_else(|| Error::NotFound(format!("credential {id}")))
    }

    /// Validate, encrypt and persist a new credential.
    pub async fn create_credential(&self, new: NewCredential) -> Result<CredentialSummary> {
        new.validate()?;
        let secret_envelope = self.cipher.encrypt(new.secret.expose())?;
        let refresh_envelope = new
            .refresh_secret
            .as_ref()
            .map(|r| self.cipher.encrypt(r.expose()))
            .transpose()?;

        let summary = self
            .mutate(move |state| {
                if state.rows.values().any(|row| row.credential.name == new.name) {
                    return Err(Error::DuplicateName(new.name));
                }
                let credential = Credential {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: new.name,
                    kind: new.kind,
                    provider_kind: new.provider_kind,
                    secret: new.secret,
                    refresh_secret: new.refresh_secret,
                    expires_at_ms: new.expires_at_ms,
                    scopes: new.scopes,
                    region: new.region,
                    active: true,
                    created_at_ms: now_millis(),
                    last_used_at_ms: None,
                };
                let summary = credential.summary();
                state.rows.insert(
                    credential.id.clone(),
                    Row {
                        credential,
                        secret_envelope,
                        refresh_envelope,
                    },
                );
                Ok(summary)
            })
            .await?;
        info!(credential = %summary.name, id = %summary.id, kind = summary.kind.label(), "created credential");
        Ok(summary)
    }

    /// Remove a credential and unlink it from every routing entity.
    pub async fn delete_credential(&self, id: &str) -> Result<()> {
        let row = self
            .mutate(|state| {
                let row = state
                    .rows
                    .remove(id)
                    .ok_or_else(|| Error::NotFound(format!("credential {id}")))?;
                for entity in state.routing_entities.values_mut() {
                    entity.credential_ids.retain(|c| c != id);
                }
                Ok(row)
            })
            .await?;

        self.row_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        info!(credential = %row.credential.name, id, "deleted credential");
        Ok(())
    }

    /// Summaries of every credential, without secret material.
    pub async fn list_credentials(&self) -> Vec<CredentialSummary> {
        let state = self.state.lock().await;
        state.rows.values().map(|row| row.credential.summary()).collect()
    }

    pub async fn set_active(&self, id: &str, active: bool) -> Result<()> {
        self.mutate(|state| {
            let row = state
                .rows
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("credential {id}")))?;
            row.credential.active = active;
            Ok(())
        })
        .await
    }

    /// Exclusive row lock for `id`, across tasks and across processes
    /// sharing the file. Waits while another holder has it.
    pub async fn lock_credential(&self, id: &str) -> Result<CredentialLock<'_>> {
        if !self.state.lock().await.rows.contains_key(id) {
            return Err(Error::NotFound(format!("credential {id}")));
        }
        let lock = {
            let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;
        let file = FileLock::acquire(self.lock_dir.join(format!("{id}.lock"))).await?;
        Ok(CredentialLock {
            store: self,
            id: id.to_string(),
            _file: file,
            _guard: guard,
        })
    }

    /// Replace OAuth token material under the row lock.
    pub async fn replace_oauth_tokens(&self, id: &str, update: TokenUpdate) -> Result<Credential> {
        let lock = self.lock_credential(id).await?;
        lock.replace_oauth_tokens(update).await
    }

    /// Record that a credential served a request. Bookkeeping only.
    pub async fn touch_last_used(&self, id: &str, at_ms: u64) -> Result<()> {
        self.mutate(|state| {
            let row = state
                .rows
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("credential {id}")))?;
            row.credential.last_used_at_ms = Some(at_ms);
            Ok(())
        })
        .await
    }

    /// Insert or replace a routing entity. Every linked credential must exist.
    pub async fn put_routing_entity(&self, entity: RoutingEntity) -> Result<()> {
        self.mutate(move |state| {
            if let Some(missing) = entity
                .credential_ids
                .iter()
                .find(|id| !state.rows.contains_key(id.as_str()))
            {
                return Err(Error::NotFound(format!("credential {missing}")));
            }
            debug!(routing_entity = %entity.id, credentials = entity.credential_ids.len(), "stored routing entity");
            state.routing_entities.insert(entity.id.clone(), entity);
            Ok(())
        })
        .await
    }

    /// Create a routing entity with a freshly issued client token.
    ///
    /// The plaintext token is returned once; only its hash is stored.
    pub async fn create_routing_entity(
        &self,
        name: &str,
        credential_ids: Vec<String>,
    ) -> Result<(RoutingEntity, Secret<String>)> {
        let token = generate_client_token();
        let mut entity = RoutingEntity::new(name, credential_ids);
        entity.client_token_hashes.push(hash_client_token(token.expose()));
        self.put_routing_entity(entity.clone()).await?;
        info!(routing_entity = %entity.id, name, "created routing entity");
        Ok((entity, token))
    }

    pub async fn routing_entity(&self, id: &str) -> Option<RoutingEntity> {
        let state = self.state.lock().await;
        state.routing_entities.get(id).cloned()
    }

    pub async fn list_routing_entities(&self) -> Vec<RoutingEntity> {
        let state = self.state.lock().await;
        state.routing_entities.values().cloned().collect()
    }

    /// Resolve a presented client token to its routing entity.
    pub async fn routing_entity_by_client_token(&self, token: &str) -> Option<RoutingEntity> {
        let hash = hash_client_token(token);
        let state = self.state.lock().await;
        state
            .routing_entities
            .values()
            .find(|entity| entity.client_token_hashes.iter().any(|h| *h == hash))
            .cloned()
    }

    /// An entity's active credentials in stored order. Missing or inactive
    /// rows are skipped.
    pub async fn credentials_for_entity(&self, entity_id: &str) -> Result<Vec<Credential>> {
        let state = self.state.lock().await;
        let entity = state
            .routing_entities
            .get(entity_id)
            .ok_or_else(|| Error::NotFound(format!("routing entity {entity_id}")))?;
        Ok(entity
            .credential_ids
            .iter()
            .filter_map(|id| state.rows.get(id))
            .filter(|row| row.credential.active)
            .map(|row| row.credential.clone())
            .collect())
    }
}

/// Exclusive hold on one credential row.
///
/// While held, `current` always observes the latest committed tokens, from
/// this process or any other.
pub struct CredentialLock<'a> {
    store: &'a CredentialStore,
    id: String,
    _file: FileLock,
    _guard: OwnedMutexGuard<()>,
}

impl CredentialLock<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Re-read the row from disk.
    pub async fn current(&self) -> Result<Credential> {
        self.store.reload_credential(&self.id).await
    }

    /// Write new OAuth tokens and persist.
    pub async fn replace_oauth_tokens(&self, update: TokenUpdate) -> Result<Credential> {
        let secret_envelope = self.store.cipher.encrypt(update.access.expose())?;
        let refresh_envelope = update
            .refresh
            .as_ref()
            .map(|r| self.store.cipher.encrypt(r.expose()))
            .transpose()?;
        let expires_at_ms = update.expires_at_ms;

        let updated = self
            .store
            .mutate(|state| {
                let row = state
                    .rows
                    .get_mut(&self.id)
                    .ok_or_else(|| Error::NotFound(format!("credential {}", self.id)))?;
                if !row.credential.is_oauth() {
                    return Err(Error::KindMismatch(format!(
                        "credential {} is {}, not oauth",
                        row.credential.name,
                        row.credential.kind.label()
                    )));
                }

                row.credential.secret = update.access;
                row.secret_envelope = secret_envelope;
                if let (Some(refresh), Some(envelope)) = (update.refresh, refresh_envelope) {
                    row.credential.refresh_secret = Some(refresh);
                    row.refresh_envelope = Some(envelope);
                }
                row.credential.expires_at_ms = Some(expires_at_ms);
                if let Some(scopes) = update.scopes {
                    row.credential.scopes = scopes;
                }
                Ok(row.credential.clone())
            })
            .await?;
        debug!(credential = %updated.name, expires_at_ms, "replaced oauth tokens");
        Ok(updated)
    }
}

/// Advisory lock on a file, released on drop.
struct FileLock {
    file: std::fs::File,
}

impl FileLock {
    /// Block (off the runtime) until the exclusive lock on `path` is ours.
    async fn acquire(path: PathBuf) -> Result<Self> {
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| Error::Io(format!("opening lock file {}: {e}", path.display())))?;
            FileExt::lock_exclusive(&file)
                .map_err(|e| Error::Io(format!("acquiring lock {}: {e}", path.display())))?;
            Ok(Self { file })
        })
        .await
        .map_err(|e| Error::Io(format!("lock task failed: {e}")))?
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// `<dir>/<file name>.locks`
fn lock_dir_for(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| Error::Io(format!("credential path {} has no file name", path.display())))?;
    let mut dir_name = name.to_os_string();
    dir_name.push(".locks");
    Ok(path.with_file_name(dir_name))
}

/// SHA-256 hex digest of a client token.
pub fn hash_client_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// New random client token.
pub fn generate_client_token() -> Secret<String> {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    Secret::new(format!("{CLIENT_TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes)))
}

fn decrypt_row(cipher: &SecretCipher, stored: StoredCredential) -> Result<Row> {
    let secret = cipher.decrypt(&stored.secret)?;
    let refresh_secret = stored
        .refresh_secret
        .as_deref()
        .map(|env| cipher.decrypt(env))
        .transpose()?;
    Ok(row_from_stored(stored, secret, refresh_secret))
}

fn row_from_stored(
    stored: StoredCredential,
    secret: Secret<String>,
    refresh_secret: Option<Secret<String>>,
) -> Row {
    Row {
        credential: Credential {
            id: stored.id,
            name: stored.name,
            kind: stored.kind,
            provider_kind: stored.provider_kind,
            secret,
            refresh_secret,
            expires_at_ms: stored.expires_at_ms,
            scopes: stored.scopes,
            region: stored.region,
            active: stored.active,
            created_at_ms: stored.created_at_ms,
            last_used_at_ms: stored.last_used_at_ms,
        },
        secret_envelope: stored.secret,
        refresh_envelope: stored.refresh_secret,
    }
}

/// Write the document atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target, so a crash mid-write never leaves a truncated document.
/// Permissions are 0600 since the file holds encrypted credentials.
async fn write_atomic(path: &Path, json: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    if !dir.as_os_str().is_empty() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Io(format!("creating credential directory: {e}")))?;
    }

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential document");
    Ok(())
}
