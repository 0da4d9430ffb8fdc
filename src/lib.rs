use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub mod client;
pub mod server;

use crate::server::crypto::CryptoError;
use crate::server::time::is_expired;

/// Account reference of a paste owner. Issued by the external session layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Discoverability of a paste. Has no bearing on confidentiality.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Unlisted,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Unlisted => "unlisted",
            Visibility::Private => "private",
        }
    }
}

/// Per-ciphertext parameters persisted next to the ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionMaterial {
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub auth_tag: Vec<u8>,
    /// PBKDF2 salt for password-derived keys; empty for client-held keys.
    #[serde(with = "b64", default)]
    pub salt: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedPayload {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    pub material: EncryptionMaterial,
}

/// Which server-side secret a sealed paste was encrypted under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServerKey {
    Password,
    MasterKey,
}

/// Who holds the key able to open an encrypted paste.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "holder", content = "key", rename_all = "snake_case")]
pub enum KeyHolder {
    Server(ServerKey),
    /// Zero-knowledge paste: the key never reaches the server.
    Client,
}

impl KeyHolder {
    pub fn label(&self) -> &'static str {
        match self {
            KeyHolder::Server(ServerKey::Password) => "password",
            KeyHolder::Server(ServerKey::MasterKey) => "master_key",
            KeyHolder::Client => "client",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredContent {
    Plain {
        text: String,
    },
    Encrypted {
        holder: KeyHolder,
        payload: EncryptedPayload,
    },
}

/// The persisted unit. `version` is owned by the store and bumped on every
/// successful conditional update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasteRecord {
    pub id: String,
    pub owner: Option<OwnerId>,
    pub title: String,
    pub language: String,
    pub content: StoredContent,
    #[serde(default)]
    pub visibility: Visibility,
    pub password_hash: Option<String>,
    #[serde(default)]
    pub burn_after_read: bool,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub view_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub folder: Option<String>,
    #[serde(default)]
    pub version: u64,
}

impl PasteRecord {
    pub fn is_encrypted(&self) -> bool {
        matches!(self.content, StoredContent::Encrypted { .. })
    }

    pub fn key_holder(&self) -> Option<KeyHolder> {
        match &self.content {
            StoredContent::Plain { .. } => None,
            StoredContent::Encrypted { holder, .. } => Some(*holder),
        }
    }

    pub fn encryption_material(&self) -> Option<&EncryptionMaterial> {
        match &self.content {
            StoredContent::Plain { .. } => None,
            StoredContent::Encrypted { payload, .. } => Some(&payload.material),
        }
    }

    pub fn has_password(&self) -> bool {
        self.password_hash.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.expires_at, now)
    }

    /// A burn-after-read paste whose single disclosure has been committed.
    /// It stays unreadable even if the follow-up delete never landed.
    pub fn is_consumed(&self) -> bool {
        self.burn_after_read && self.view_count > 0
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && !self.is_consumed()
    }

    pub fn is_owned_by(&self, owner: &OwnerId) -> bool {
        self.owner.as_ref() == Some(owner)
    }

    fn scheme_label(&self) -> &'static str {
        self.key_holder().map_or("none", |holder| holder.label())
    }
}

/// Listing view of a paste. Never carries content or the password hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasteSummary {
    pub id: String,
    pub title: String,
    pub language: String,
    pub visibility: Visibility,
    pub encrypted: bool,
    pub zero_knowledge: bool,
    pub has_password: bool,
    pub burn_after_read: bool,
    pub view_count: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub folder_id: Option<String>,
}

impl From<&PasteRecord> for PasteSummary {
    fn from(record: &PasteRecord) -> Self {
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            language: record.language.clone(),
            visibility: record.visibility,
            encrypted: record.is_encrypted(),
            zero_knowledge: record.key_holder() == Some(KeyHolder::Client),
            has_password: record.has_password(),
            burn_after_read: record.burn_after_read,
            view_count: record.view_count,
            expires_at: record.expires_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
            folder_id: record.folder.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_pastes: usize,
    pub active_pastes: usize,
    pub expired_pastes: usize,
    pub burn_after_read_count: usize,
    pub password_protected_count: usize,
    pub encryption_usage: Vec<EncryptionUsage>,
    pub visibility_usage: Vec<VisibilityUsage>,
    pub created_by_day: Vec<DailyCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionUsage {
    pub scheme: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityUsage {
    pub visibility: Visibility,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyCount {
    pub date: String,
    pub count: usize,
}

pub fn compute_stats<'a, I>(records: I, now: DateTime<Utc>) -> StoreStats
where
    I: IntoIterator<Item = &'a PasteRecord>,
{
    let mut stats = StoreStats::default();
    let mut schemes: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut visibility: HashMap<Visibility, usize> = HashMap::new();
    let mut daily: BTreeMap<String, usize> = BTreeMap::new();

    for record in records {
        stats.total_pastes += 1;
        if record.is_live(now) {
            stats.active_pastes += 1;
        } else {
            stats.expired_pastes += 1;
        }
        if record.burn_after_read {
            stats.burn_after_read_count += 1;
        }
        if record.has_password() {
            stats.password_protected_count += 1;
        }
        *schemes.entry(record.scheme_label()).or_default() += 1;
        *visibility.entry(record.visibility).or_default() += 1;
        let date = record.created_at.date_naive().format("%Y-%m-%d").to_string();
        *daily.entry(date).or_default() += 1;
    }

    stats.encryption_usage = schemes
        .into_iter()
        .map(|(scheme, count)| EncryptionUsage {
            scheme: scheme.to_string(),
            count,
        })
        .collect();
    let mut visibility_usage: Vec<VisibilityUsage> = visibility
        .into_iter()
        .map(|(visibility, count)| VisibilityUsage { visibility, count })
        .collect();
    visibility_usage.sort_by_key(|usage| usage.visibility.as_str());
    stats.visibility_usage = visibility_usage;
    stats.created_by_day = daily
        .into_iter()
        .map(|(date, count)| DailyCount { date, count })
        .collect();
    stats
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("paste not found: {0}")]
    NotFound(String),
    #[error("paste {id} changed concurrently (expected version {expected}, found {actual})")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("paste id already taken: {0}")]
    Duplicate(String),
    #[error("store backend failure: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum PasteError {
    #[error("paste not found: {0}")]
    NotFound(String),
    #[error("not permitted to modify paste {0}")]
    Forbidden(String),
    #[error("invalid paste request: {0}")]
    Invalid(String),
    #[error("paste {0} is under contention, retry later")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Edit applied by [`PasteStore::conditional_update`] while the record is held.
pub type RecordMutator = Box<dyn FnOnce(&mut PasteRecord) + Send>;

/// Keyed record store consumed by the paste engine.
///
/// `conditional_update` must be linearizable per id: the mutator runs only
/// when the stored version equals `expected_version`, and the write becomes
/// visible atomically with the version bump.
#[async_trait]
pub trait PasteStore: Send + Sync + 'static {
    async fn insert(&self, record: PasteRecord) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<Option<PasteRecord>, StoreError>;
    async fn conditional_update(
        &self,
        id: &str,
        expected_version: u64,
        mutator: RecordMutator,
    ) -> Result<PasteRecord, StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<PasteRecord>, StoreError>;
    /// Deletes every expired or already-burned record, returning how many went.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
    async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats, StoreError>;
}

pub type SharedPasteStore = Arc<dyn PasteStore>;

pub struct MemoryPasteStore {
    entries: RwLock<HashMap<String, PasteRecord>>,
}

impl MemoryPasteStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryPasteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PasteStore for MemoryPasteStore {
    async fn insert(&self, record: PasteRecord) -> Result<(), StoreError> {
        let mut map = self.entries.write().await;
        if map.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        map.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PasteRecord>, StoreError> {
        let map = self.entries.read().await;
        Ok(map.get(id).cloned())
    }

    async fn conditional_update(
        &self,
        id: &str,
        expected_version: u64,
        mutator: RecordMutator,
    ) -> Result<PasteRecord, StoreError> {
        let mut map = self.entries.write().await;
        let record = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if record.version != expected_version {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: expected_version,
                actual: record.version,
            });
        }

        let mut next = record.clone();
        mutator(&mut next);
        next.id = id.to_string();
        next.version = expected_version + 1;
        *record = next.clone();
        Ok(next)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut map = self.entries.write().await;
        map.remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<PasteRecord>, StoreError> {
        let map = self.entries.read().await;
        Ok(map
            .values()
            .filter(|record| record.is_owned_by(owner))
            .cloned()
            .collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut map = self.entries.write().await;
        let before = map.len();
        map.retain(|_, record| record.is_live(now));
        Ok(before - map.len())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats, StoreError> {
        let map = self.entries.read().await;
        Ok(compute_stats(map.values(), now))
    }
}

pub(crate) fn bool_is_false(value: &bool) -> bool {
    !*value
}

pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
