use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nanoid::nanoid;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::access::{self, AccessOutcome, AccessRequest};
use super::crypto::{PasteCrypto, IV_LEN, TAG_LEN};
use super::time::{current_time, Expiration};
use crate::{
    EncryptedPayload, KeyHolder, OwnerId, PasteError, PasteRecord, PasteSummary, RecordMutator,
    ServerKey, SharedPasteStore, StoreError, StoreStats, StoredContent, Visibility,
};

/// Fresh evaluations a view gets while owners keep editing the paste, and
/// attempts an owner update gets against concurrent writers.
pub const DEFAULT_CONFLICT_RETRIES: u32 = 16;
pub const DEFAULT_LANGUAGE: &str = "plaintext";
const ID_LENGTH: usize = 10;
const ID_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasteBody {
    Text(String),
    /// Ciphertext sealed under a key the server never sees.
    ClientSealed(EncryptedPayload),
}

#[derive(Debug, Clone)]
pub struct NewPaste {
    pub title: String,
    pub language: Option<String>,
    pub visibility: Visibility,
    pub body: PasteBody,
    pub password: Option<String>,
    pub expiration: Expiration,
    /// Seal text on the server: under the password when one is given,
    /// otherwise under the master key.
    pub encrypted: bool,
    pub burn_after_read: bool,
    pub folder: Option<String>,
}

impl NewPaste {
    pub fn text(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_body(title, PasteBody::Text(content.into()))
    }

    pub fn client_sealed(title: impl Into<String>, payload: EncryptedPayload) -> Self {
        Self::with_body(title, PasteBody::ClientSealed(payload))
    }

    fn with_body(title: impl Into<String>, body: PasteBody) -> Self {
        Self {
            title: title.into(),
            language: None,
            visibility: Visibility::default(),
            body,
            password: None,
            expiration: Expiration::Never,
            encrypted: false,
            burn_after_read: false,
            folder: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn server_encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    pub fn with_burn_after_read(mut self) -> Self {
        self.burn_after_read = true;
        self
    }

    pub fn with_expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = expiration;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordChange {
    Set(String),
    Clear,
}

/// Owner edits. `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct PasteUpdate {
    pub title: Option<String>,
    pub language: Option<String>,
    pub visibility: Option<Visibility>,
    pub folder: Option<String>,
    pub clear_folder: bool,
    pub expiration: Option<Expiration>,
    pub password: Option<PasswordChange>,
    pub body: Option<PasteBody>,
}

#[derive(Clone)]
pub struct PasteService {
    store: SharedPasteStore,
    crypto: Arc<PasteCrypto>,
    conflict_retries: u32,
}

impl PasteService {
    pub fn new(store: SharedPasteStore, crypto: PasteCrypto) -> Self {
        Self {
            store,
            crypto: Arc::new(crypto),
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries.max(1);
        self
    }

    pub fn store(&self) -> &SharedPasteStore {
        &self.store
    }

    pub async fn submit(
        &self,
        owner: Option<OwnerId>,
        paste: NewPaste,
    ) -> Result<PasteRecord, PasteError> {
        self.submit_at(owner, paste, current_time()).await
    }

    pub async fn submit_at(
        &self,
        owner: Option<OwnerId>,
        paste: NewPaste,
        now: DateTime<Utc>,
    ) -> Result<PasteRecord, PasteError> {
        let password = paste.password.filter(|p| !p.is_empty());
        let (content, password_hash) = match paste.body {
            PasteBody::ClientSealed(payload) => {
                if password.is_some() {
                    return Err(PasteError::Invalid(
                        "zero-knowledge pastes cannot carry a password".into(),
                    ));
                }
                validate_client_payload(&payload)?;
                let content = StoredContent::Encrypted {
                    holder: KeyHolder::Client,
                    payload,
                };
                (content, None)
            }
            PasteBody::Text(text) => {
                let content = if paste.encrypted {
                    self.seal(&text, password.as_deref())?
                } else {
                    StoredContent::Plain { text }
                };
                let hash = password
                    .as_deref()
                    .map(|p| self.crypto.hash_password(p))
                    .transpose()?;
                (content, hash)
            }
        };

        let mut record = PasteRecord {
            id: String::new(),
            owner,
            title: paste.title.trim().to_string(),
            language: paste
                .language
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            content,
            visibility: paste.visibility,
            password_hash,
            burn_after_read: paste.burn_after_read,
            expires_at: paste.expiration.expires_at(now),
            view_count: 0,
            created_at: now,
            updated_at: now,
            folder: paste.folder,
            version: 0,
        };

        for _ in 0..ID_ATTEMPTS {
            record.id = nanoid!(ID_LENGTH);
            match self.store.insert(record.clone()).await {
                Ok(()) => {
                    log::info!(
                        "created paste {} ({}, burn_after_read={}, expires={})",
                        record.id,
                        record.key_holder().map_or("plain", |h| h.label()),
                        record.burn_after_read,
                        paste.expiration
                    );
                    return Ok(record);
                }
                Err(StoreError::Duplicate(id)) => {
                    log::debug!("paste id {id} already taken, drawing another");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(PasteError::Conflict(
            "could not allocate a unique paste id".into(),
        ))
    }

    pub async fn retrieve(
        &self,
        id: &str,
        request: &AccessRequest,
    ) -> Result<AccessOutcome, PasteError> {
        let outcome = access::retrieve(
            self.store.as_ref(),
            &self.crypto,
            id,
            request,
            self.conflict_retries,
        )
        .await?;
        match &outcome {
            AccessOutcome::DecryptionFailed => {
                log::warn!("paste {id} could not be decrypted");
            }
            AccessOutcome::Disclosed(_) => {}
            denied => log::debug!("access to paste {id} denied: {}", denied.label()),
        }
        Ok(outcome)
    }

    pub async fn update(
        &self,
        id: &str,
        caller: &OwnerId,
        changes: PasteUpdate,
    ) -> Result<PasteRecord, PasteError> {
        self.update_at(id, caller, changes, current_time()).await
    }

    pub async fn update_at(
        &self,
        id: &str,
        caller: &OwnerId,
        changes: PasteUpdate,
        now: DateTime<Utc>,
    ) -> Result<PasteRecord, PasteError> {
        for _ in 0..self.conflict_retries {
            let record = self.owned_record(id, caller, now).await?;
            let next = self.apply_update(&record, changes.clone(), now)?;
            let mutator: RecordMutator = Box::new(move |r: &mut PasteRecord| *r = next);

            match self
                .store
                .conditional_update(id, record.version, mutator)
                .await
            {
                Ok(updated) => {
                    log::info!("paste {id} updated by its owner");
                    return Ok(updated);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(StoreError::NotFound(_)) => return Err(PasteError::Forbidden(id.to_string())),
                Err(err) => return Err(err.into()),
            }
        }
        log::warn!("update of paste {id} kept conflicting, giving up");
        Err(PasteError::Conflict(id.to_string()))
    }

    pub async fn remove(&self, id: &str, caller: &OwnerId) -> Result<(), PasteError> {
        self.owned_record(id, caller, current_time()).await?;
        match self.store.delete(id).await {
            Ok(()) => {
                log::info!("paste {id} deleted by its owner");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Err(PasteError::Forbidden(id.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// The owner's live pastes, newest first.
    pub async fn list_owned(&self, owner: &OwnerId) -> Result<Vec<PasteSummary>, PasteError> {
        let now = current_time();
        let mut records: Vec<PasteRecord> = self
            .store
            .list_by_owner(owner)
            .await?
            .into_iter()
            .filter(|record| record.is_live(now))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records.iter().map(PasteSummary::from).collect())
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, PasteError> {
        let removed = self.store.purge_expired(now).await?;
        if removed > 0 {
            log::info!("purged {removed} expired or burned pastes");
        }
        Ok(removed)
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats, PasteError> {
        Ok(self.store.stats(now).await?)
    }

    /// Absent, gone and foreign records all read as forbidden to a mutating caller.
    async fn owned_record(
        &self,
        id: &str,
        caller: &OwnerId,
        now: DateTime<Utc>,
    ) -> Result<PasteRecord, PasteError> {
        match self.store.get(id).await? {
            Some(record) if record.is_live(now) && record.is_owned_by(caller) => Ok(record),
            _ => Err(PasteError::Forbidden(id.to_string())),
        }
    }

    fn seal(&self, text: &str, password: Option<&str>) -> Result<StoredContent, PasteError> {
        let payload = self.crypto.encrypt(text.as_bytes(), password)?;
        let key = if password.is_some() {
            ServerKey::Password
        } else {
            ServerKey::MasterKey
        };
        Ok(StoredContent::Encrypted {
            holder: KeyHolder::Server(key),
            payload,
        })
    }

    fn apply_update(
        &self,
        record: &PasteRecord,
        changes: PasteUpdate,
        now: DateTime<Utc>,
    ) -> Result<PasteRecord, PasteError> {
        let mut next = record.clone();
        if let Some(title) = changes.title {
            next.title = title.trim().to_string();
        }
        if let Some(language) = changes.language {
            next.language = language;
        }
        if let Some(visibility) = changes.visibility {
            next.visibility = visibility;
        }
        if changes.clear_folder {
            next.folder = None;
        } else if let Some(folder) = changes.folder {
            next.folder = Some(folder);
        }
        if let Some(expiration) = changes.expiration {
            next.expires_at = expiration.expires_at(now);
        }

        if changes.body.is_some() || changes.password.is_some() {
            let (content, password_hash) =
                self.reseal(record, changes.body, changes.password)?;
            next.content = content;
            next.password_hash = password_hash;
        }
        next.updated_at = now;
        Ok(next)
    }

    fn reseal(
        &self,
        record: &PasteRecord,
        body: Option<PasteBody>,
        password: Option<PasswordChange>,
    ) -> Result<(StoredContent, Option<String>), PasteError> {
        if let Some(PasswordChange::Set(p)) = &password {
            if p.is_empty() {
                return Err(PasteError::Invalid("password must not be empty".into()));
            }
        }

        let key = match record.key_holder() {
            None => {
                let content = match body {
                    None => record.content.clone(),
                    Some(PasteBody::Text(text)) => StoredContent::Plain { text },
                    Some(PasteBody::ClientSealed(_)) => {
                        return Err(PasteError::Invalid(
                            "only zero-knowledge pastes accept client-sealed content".into(),
                        ))
                    }
                };
                let hash = match password {
                    None => record.password_hash.clone(),
                    Some(PasswordChange::Set(p)) => Some(self.crypto.hash_password(&p)?),
                    Some(PasswordChange::Clear) => None,
                };
                return Ok((content, hash));
            }
            Some(KeyHolder::Client) => {
                if matches!(password, Some(PasswordChange::Set(_))) {
                    return Err(PasteError::Invalid(
                        "zero-knowledge pastes cannot carry a password".into(),
                    ));
                }
                let content = match body {
                    None => record.content.clone(),
                    Some(PasteBody::ClientSealed(payload)) => {
                        validate_client_payload(&payload)?;
                        StoredContent::Encrypted {
                            holder: KeyHolder::Client,
                            payload,
                        }
                    }
                    Some(PasteBody::Text(_)) => {
                        return Err(PasteError::Invalid(
                            "zero-knowledge pastes only accept client-sealed content".into(),
                        ))
                    }
                };
                return Ok((content, None));
            }
            Some(KeyHolder::Server(key)) => key,
        };

        let text = match body {
            None => None,
            Some(PasteBody::Text(text)) => Some(text),
            Some(PasteBody::ClientSealed(_)) => {
                return Err(PasteError::Invalid(
                    "server-encrypted pastes cannot take client-sealed content".into(),
                ))
            }
        };

        match (key, password) {
            (_, Some(PasswordChange::Set(p))) => {
                let text = match text {
                    Some(text) => text,
                    None if key == ServerKey::MasterKey => self.open_master_sealed(record)?,
                    None => {
                        return Err(PasteError::Invalid(
                            "changing the password of a password-sealed paste needs its content"
                                .into(),
                        ))
                    }
                };
                let content = self.seal(&text, Some(&p))?;
                Ok((content, Some(self.crypto.hash_password(&p)?)))
            }
            (ServerKey::MasterKey, change) => {
                let content = match text {
                    Some(text) => self.seal(&text, None)?,
                    None => record.content.clone(),
                };
                let hash = match change {
                    Some(PasswordChange::Clear) => None,
                    _ => record.password_hash.clone(),
                };
                Ok((content, hash))
            }
            (ServerKey::Password, Some(PasswordChange::Clear)) => match text {
                Some(text) => Ok((self.seal(&text, None)?, None)),
                None => Err(PasteError::Invalid(
                    "removing the password of a password-sealed paste needs its content".into(),
                )),
            },
            (ServerKey::Password, None) => match text {
                Some(_) => Err(PasteError::Invalid(
                    "re-encrypting a password-sealed paste needs the new password".into(),
                )),
                None => Ok((record.content.clone(), record.password_hash.clone())),
            },
        }
    }

    fn open_master_sealed(&self, record: &PasteRecord) -> Result<String, PasteError> {
        let StoredContent::Encrypted { payload, .. } = &record.content else {
            return Err(PasteError::Invalid("paste is not encrypted".into()));
        };
        let plaintext = self.crypto.decrypt(payload, None)?;
        String::from_utf8(plaintext).map_err(|_| {
            PasteError::Invalid(format!("paste {} does not hold utf-8 text", record.id))
        })
    }
}

/// Runs [`PasteService::purge_expired`] on a fixed interval until the task is aborted.
pub fn spawn_expiry_sweeper(service: PasteService, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = service.purge_expired(current_time()).await {
                log::warn!("expiry sweep failed: {err}");
            }
        }
    })
}

fn validate_client_payload(payload: &EncryptedPayload) -> Result<(), PasteError> {
    let material = &payload.material;
    if payload.ciphertext.is_empty() {
        return Err(PasteError::Invalid("sealed content is empty".into()));
    }
    if material.iv.len() != IV_LEN {
        return Err(PasteError::Invalid(format!("iv must be {IV_LEN} bytes")));
    }
    if material.auth_tag.len() != TAG_LEN {
        return Err(PasteError::Invalid(format!(
            "auth tag must be {TAG_LEN} bytes"
        )));
    }
    if !material.salt.is_empty() {
        return Err(PasteError::Invalid(
            "client-sealed content carries no salt".into(),
        ));
    }
    Ok(())
}
