//! Access evaluation and view accounting for a single retrieval.
//!
//! [`evaluate`] is pure: it decides what a caller may see given a freshly
//! read record. [`retrieve`] wraps it with the store round trip that commits
//! the view (and the burn, when requested) through a version-checked update.
//! A reader that loses a version race to another view keeps its verdict and
//! only repeats the update; it re-evaluates only when an owner changed what
//! gates the content.

use chrono::{DateTime, Utc};

use super::crypto::PasteCrypto;
use crate::{
    EncryptedPayload, KeyHolder, PasteError, PasteRecord, PasteStore, RecordMutator, ServerKey,
    StoreError, StoredContent,
};

#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub supplied_password: Option<String>,
    pub now: DateTime<Utc>,
    /// The caller can only use decrypted text, so client-sealed content is
    /// refused before any view is counted.
    pub text_only: bool,
}

impl AccessRequest {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            supplied_password: None,
            now,
            text_only: false,
        }
    }

    pub fn text_only(mut self) -> Self {
        self.text_only = true;
        self
    }

    /// An empty password counts as none supplied.
    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.supplied_password = password.filter(|p| !p.is_empty());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisclosedContent {
    Text(String),
    /// Client-held-key ciphertext, returned exactly as stored.
    ClientSealed(EncryptedPayload),
}

#[derive(Debug, Clone)]
pub struct Disclosure {
    /// Snapshot after the view was counted.
    pub record: PasteRecord,
    pub content: DisclosedContent,
    pub burned: bool,
}

#[derive(Debug, Clone)]
pub enum AccessOutcome {
    NotFound,
    PasswordRequired,
    PasswordInvalid,
    DecryptionFailed,
    /// Client-sealed content asked for by a text-only caller.
    ClientKeyRequired,
    Disclosed(Box<Disclosure>),
}

impl AccessOutcome {
    pub fn is_disclosed(&self) -> bool {
        matches!(self, AccessOutcome::Disclosed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            AccessOutcome::NotFound => "not_found",
            AccessOutcome::PasswordRequired => "password_required",
            AccessOutcome::PasswordInvalid => "password_invalid",
            AccessOutcome::DecryptionFailed => "decryption_failed",
            AccessOutcome::ClientKeyRequired => "client_key_required",
            AccessOutcome::Disclosed(_) => "disclosed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Deny(DenyReason),
    Disclose(DisclosedContent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NotFound,
    PasswordRequired,
    PasswordInvalid,
    DecryptionFailed,
    ClientKeyRequired,
}

impl From<DenyReason> for AccessOutcome {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::NotFound => AccessOutcome::NotFound,
            DenyReason::PasswordRequired => AccessOutcome::PasswordRequired,
            DenyReason::PasswordInvalid => AccessOutcome::PasswordInvalid,
            DenyReason::DecryptionFailed => AccessOutcome::DecryptionFailed,
            DenyReason::ClientKeyRequired => AccessOutcome::ClientKeyRequired,
        }
    }
}

/// Checks run in a fixed order: presence, expiry/consumption, password gate,
/// then unlocking. Nothing is decrypted before the password gate passes.
pub fn evaluate(
    record: Option<&PasteRecord>,
    request: &AccessRequest,
    crypto: &PasteCrypto,
) -> Verdict {
    let Some(record) = record else {
        return Verdict::Deny(DenyReason::NotFound);
    };
    if !record.is_live(request.now) {
        return Verdict::Deny(DenyReason::NotFound);
    }

    let supplied = request.supplied_password.as_deref();
    if let Some(hash) = record.password_hash.as_deref() {
        match supplied {
            None => return Verdict::Deny(DenyReason::PasswordRequired),
            Some(password) if !crypto.verify_password(password, hash) => {
                return Verdict::Deny(DenyReason::PasswordInvalid)
            }
            Some(_) => {}
        }
    }

    match unlock(&record.content, supplied, request.text_only, crypto) {
        Ok(content) => Verdict::Disclose(content),
        Err(reason) => Verdict::Deny(reason),
    }
}

fn unlock(
    content: &StoredContent,
    supplied: Option<&str>,
    text_only: bool,
    crypto: &PasteCrypto,
) -> Result<DisclosedContent, DenyReason> {
    let (holder, payload) = match content {
        StoredContent::Plain { text } => return Ok(DisclosedContent::Text(text.clone())),
        StoredContent::Encrypted { holder, payload } => (holder, payload),
    };

    let key_password = match holder {
        KeyHolder::Client if text_only => return Err(DenyReason::ClientKeyRequired),
        KeyHolder::Client => return Ok(DisclosedContent::ClientSealed(payload.clone())),
        KeyHolder::Server(ServerKey::MasterKey) => None,
        KeyHolder::Server(ServerKey::Password) => {
            Some(supplied.ok_or(DenyReason::PasswordRequired)?)
        }
    };

    let plaintext = crypto
        .decrypt(payload, key_password)
        .map_err(|_| DenyReason::DecryptionFailed)?;
    String::from_utf8(plaintext)
        .map(DisclosedContent::Text)
        .map_err(|_| DenyReason::DecryptionFailed)
}

#[derive(Debug)]
pub enum Commit {
    Committed { record: PasteRecord, burned: bool },
    /// The record vanished between read and write.
    Gone,
    /// Another writer moved the version first.
    Conflict,
}

/// Counts one view against `record` as read at `record.version`. A burn
/// paste is consumed by this update; the delete that follows only reclaims
/// the row.
pub async fn commit_disclosure(
    store: &dyn PasteStore,
    record: &PasteRecord,
    now: DateTime<Utc>,
) -> Result<Commit, StoreError> {
    let mutator: RecordMutator = Box::new(move |r: &mut PasteRecord| {
        r.view_count += 1;
        r.updated_at = now;
    });

    let updated = match store
        .conditional_update(&record.id, record.version, mutator)
        .await
    {
        Ok(updated) => updated,
        Err(StoreError::Conflict { .. }) => return Ok(Commit::Conflict),
        Err(StoreError::NotFound(_)) => return Ok(Commit::Gone),
        Err(err) => return Err(err),
    };

    if !updated.burn_after_read {
        return Ok(Commit::Committed {
            record: updated,
            burned: false,
        });
    }

    match store.delete(&updated.id).await {
        Ok(()) | Err(StoreError::NotFound(_)) => {}
        Err(err) => log::warn!(
            "burned paste {} stays consumed but could not be deleted: {err}",
            updated.id
        ),
    }
    log::info!("paste {} burned after read", updated.id);
    Ok(Commit::Committed {
        record: updated,
        burned: true,
    })
}

/// Whether two reads of a record gate and hold the same content, so a
/// verdict reached on one still holds for the other.
fn same_gate(read: &PasteRecord, fresh: &PasteRecord) -> bool {
    read.password_hash == fresh.password_hash
        && read.content == fresh.content
        && read.expires_at == fresh.expires_at
        && read.burn_after_read == fresh.burn_after_read
}

/// Read, evaluate, commit.
///
/// A lost version race re-reads the record. While it is still live and its
/// gate is unchanged the earlier verdict stands and only the update is
/// repeated; every such loss means another view committed, so this always
/// makes progress. Owner edits force a fresh evaluation, and only those count
/// against `max_evaluations`.
pub async fn retrieve(
    store: &dyn PasteStore,
    crypto: &PasteCrypto,
    id: &str,
    request: &AccessRequest,
    max_evaluations: u32,
) -> Result<AccessOutcome, PasteError> {
    let mut record = store.get(id).await?;
    let mut evaluations = 0;

    loop {
        evaluations += 1;
        let content = match evaluate(record.as_ref(), request, crypto) {
            Verdict::Deny(reason) => return Ok(reason.into()),
            Verdict::Disclose(content) => content,
        };
        let Some(mut current) = record.take() else {
            return Ok(AccessOutcome::NotFound);
        };

        loop {
            match commit_disclosure(store, &current, request.now).await? {
                Commit::Committed { record, burned } => {
                    return Ok(AccessOutcome::Disclosed(Box::new(Disclosure {
                        record,
                        content,
                        burned,
                    })))
                }
                Commit::Gone => return Ok(AccessOutcome::NotFound),
                Commit::Conflict => {}
            }

            log::debug!("view of paste {id} lost a version race");
            tokio::task::yield_now().await;
            match store.get(id).await? {
                Some(fresh) if fresh.is_live(request.now) && same_gate(&current, &fresh) => {
                    current = fresh;
                }
                fresh => {
                    record = fresh;
                    break;
                }
            }
        }

        if !record.as_ref().is_some_and(|fresh| fresh.is_live(request.now)) {
            return Ok(AccessOutcome::NotFound);
        }
        if evaluations >= max_evaluations.max(1) {
            log::warn!("giving up on paste {id} after {evaluations} evaluations under concurrent edits");
            return Err(PasteError::Conflict(id.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::crypto::{MasterKey, MIN_PBKDF2_ITERATIONS};
    use crate::{MemoryPasteStore, OwnerId, StoreStats, Visibility};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Mutex;

    /// Lets another writer land one edit just before the next versioned update.
    struct Interleaved {
        inner: MemoryPasteStore,
        edit: Mutex<Option<RecordMutator>>,
    }

    impl Interleaved {
        fn new(edit: RecordMutator) -> Self {
            Self {
                inner: MemoryPasteStore::new(),
                edit: Mutex::new(Some(edit)),
            }
        }
    }

    #[async_trait]
    impl PasteStore for Interleaved {
        async fn insert(&self, record: PasteRecord) -> Result<(), StoreError> {
            self.inner.insert(record).await
        }

        async fn get(&self, id: &str) -> Result<Option<PasteRecord>, StoreError> {
            self.inner.get(id).await
        }

        async fn conditional_update(
            &self,
            id: &str,
            expected_version: u64,
            mutator: RecordMutator,
        ) -> Result<PasteRecord, StoreError> {
            let edit = self.edit.lock().unwrap().take();
            if let Some(edit) = edit {
                let current = self.inner.get(id).await?.expect("record");
                self.inner
                    .conditional_update(id, current.version, edit)
                    .await?;
            }
            self.inner
                .conditional_update(id, expected_version, mutator)
                .await
        }

        async fn delete(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete(id).await
        }

        async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<PasteRecord>, StoreError> {
            self.inner.list_by_owner(owner).await
        }

        async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
            self.inner.purge_expired(now).await
        }

        async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats, StoreError> {
            self.inner.stats(now).await
        }
    }

    fn crypto() -> PasteCrypto {
        PasteCrypto::new(MasterKey::generate(), MIN_PBKDF2_ITERATIONS)
    }

    fn plain(id: &str, now: DateTime<Utc>) -> PasteRecord {
        PasteRecord {
            id: id.to_string(),
            owner: Some(OwnerId::new("owner")),
            title: "t".into(),
            language: "plaintext".into(),
            content: StoredContent::Plain {
                text: "body".into(),
            },
            visibility: Visibility::Unlisted,
            password_hash: None,
            burn_after_read: false,
            expires_at: None,
            view_count: 0,
            created_at: now,
            updated_at: now,
            folder: None,
            version: 0,
        }
    }

    #[test]
    fn absent_and_expired_are_indistinguishable() {
        let crypto = crypto();
        let now = Utc::now();
        let request = AccessRequest::new(now);
        let mut expired = plain("x", now);
        expired.expires_at = Some(now - Duration::milliseconds(1));

        assert_eq!(
            evaluate(None, &request, &crypto),
            Verdict::Deny(DenyReason::NotFound)
        );
        assert_eq!(
            evaluate(Some(&expired), &request, &crypto),
            Verdict::Deny(DenyReason::NotFound)
        );
    }

    #[test]
    fn expiry_is_checked_before_password() {
        let crypto = crypto();
        let now = Utc::now();
        let mut record = plain("x", now);
        record.password_hash = Some(crypto.hash_password("pw12").unwrap());
        record.expires_at = Some(now - Duration::seconds(5));

        let verdict = evaluate(Some(&record), &AccessRequest::new(now), &crypto);
        assert_eq!(verdict, Verdict::Deny(DenyReason::NotFound));
    }

    #[test]
    fn consumed_burn_record_reads_as_absent() {
        let crypto = crypto();
        let now = Utc::now();
        let mut record = plain("x", now);
        record.burn_after_read = true;
        record.view_count = 1;

        let verdict = evaluate(Some(&record), &AccessRequest::new(now), &crypto);
        assert_eq!(verdict, Verdict::Deny(DenyReason::NotFound));
    }

    #[test]
    fn empty_password_counts_as_missing() {
        let crypto = crypto();
        let now = Utc::now();
        let mut record = plain("x", now);
        record.password_hash = Some(crypto.hash_password("pw12").unwrap());

        let request = AccessRequest::new(now).with_password(Some(String::new()));
        assert_eq!(
            evaluate(Some(&record), &request, &crypto),
            Verdict::Deny(DenyReason::PasswordRequired)
        );
    }

    #[test]
    fn client_sealed_content_passes_through_untouched() {
        let crypto = crypto();
        let now = Utc::now();
        let payload = EncryptedPayload {
            ciphertext: vec![0xde, 0xad],
            material: crate::EncryptionMaterial {
                iv: vec![1; 12],
                auth_tag: vec![2; 16],
                salt: Vec::new(),
            },
        };
        let mut record = plain("zk", now);
        record.content = StoredContent::Encrypted {
            holder: KeyHolder::Client,
            payload: payload.clone(),
        };

        let verdict = evaluate(Some(&record), &AccessRequest::new(now), &crypto);
        assert_eq!(
            verdict,
            Verdict::Disclose(DisclosedContent::ClientSealed(payload))
        );
    }

    #[test]
    fn password_sealed_without_hash_still_needs_a_password() {
        let crypto = crypto();
        let now = Utc::now();
        let mut record = plain("legacy", now);
        record.content = StoredContent::Encrypted {
            holder: KeyHolder::Server(ServerKey::Password),
            payload: crypto.encrypt(b"old", Some("pw12")).unwrap(),
        };

        assert_eq!(
            evaluate(Some(&record), &AccessRequest::new(now), &crypto),
            Verdict::Deny(DenyReason::PasswordRequired)
        );
        let wrong = AccessRequest::new(now).with_password(Some("nope".into()));
        assert_eq!(
            evaluate(Some(&record), &wrong, &crypto),
            Verdict::Deny(DenyReason::DecryptionFailed)
        );
        let right = AccessRequest::new(now).with_password(Some("pw12".into()));
        assert_eq!(
            evaluate(Some(&record), &right, &crypto),
            Verdict::Disclose(DisclosedContent::Text("old".into()))
        );
    }

    #[tokio::test]
    async fn retrieve_counts_the_view() {
        let store = MemoryPasteStore::new();
        let crypto = crypto();
        let now = Utc::now();
        store.insert(plain("v", now)).await.unwrap();

        let outcome = retrieve(&store, &crypto, "v", &AccessRequest::new(now), 4)
            .await
            .unwrap();
        match outcome {
            AccessOutcome::Disclosed(disclosure) => {
                assert_eq!(disclosure.record.view_count, 1);
                assert!(!disclosure.burned);
                assert_eq!(disclosure.content, DisclosedContent::Text("body".into()));
            }
            other => panic!("expected disclosure, got {}", other.label()),
        }
        assert_eq!(store.get("v").await.unwrap().unwrap().view_count, 1);
    }

    #[tokio::test]
    async fn commit_after_delete_reports_gone() {
        let store = MemoryPasteStore::new();
        let now = Utc::now();
        let record = plain("g", now);
        store.insert(record.clone()).await.unwrap();
        store.delete("g").await.unwrap();

        let commit = commit_disclosure(&store, &record, now).await.unwrap();
        assert!(matches!(commit, Commit::Gone));
    }

    #[tokio::test]
    async fn stale_version_reports_conflict() {
        let store = MemoryPasteStore::new();
        let now = Utc::now();
        let record = plain("c", now);
        store.insert(record.clone()).await.unwrap();
        commit_disclosure(&store, &record, now).await.unwrap();

        let commit = commit_disclosure(&store, &record, now).await.unwrap();
        assert!(matches!(commit, Commit::Conflict));
    }

    #[tokio::test]
    async fn racing_view_keeps_the_verdict() {
        let crypto = crypto();
        let now = Utc::now();
        let store = Interleaved::new(Box::new(|r: &mut PasteRecord| r.view_count += 1));
        let mut record = plain("hot", now);
        record.password_hash = Some(crypto.hash_password("abc1").unwrap());
        store.insert(record).await.unwrap();

        let request = AccessRequest::new(now).with_password(Some("abc1".into()));
        let outcome = retrieve(&store, &crypto, "hot", &request, 1).await.unwrap();
        match outcome {
            AccessOutcome::Disclosed(disclosure) => {
                assert_eq!(disclosure.record.view_count, 2);
                assert_eq!(disclosure.record.version, 2);
            }
            other => panic!("expected disclosure, got {}", other.label()),
        }
    }

    #[tokio::test]
    async fn owner_edit_forces_a_fresh_evaluation() {
        let crypto = crypto();
        let now = Utc::now();
        let hash = crypto.hash_password("new1").unwrap();
        let store = Interleaved::new(Box::new(move |r: &mut PasteRecord| {
            r.password_hash = Some(hash)
        }));
        store.insert(plain("edited", now)).await.unwrap();

        let outcome = retrieve(&store, &crypto, "edited", &AccessRequest::new(now), 4)
            .await
            .unwrap();
        assert!(matches!(outcome, AccessOutcome::PasswordRequired));
        assert_eq!(store.get("edited").await.unwrap().unwrap().view_count, 0);
    }

    #[tokio::test]
    async fn expiry_during_race_reads_as_not_found() {
        let crypto = crypto();
        let now = Utc::now();
        let store = Interleaved::new(Box::new(|r: &mut PasteRecord| {
            r.expires_at = Some(r.created_at - Duration::seconds(1))
        }));
        store.insert(plain("dying", now)).await.unwrap();

        let outcome = retrieve(&store, &crypto, "dying", &AccessRequest::new(now), 1)
            .await
            .unwrap();
        assert!(matches!(outcome, AccessOutcome::NotFound));
    }

    #[tokio::test]
    async fn text_only_request_refuses_client_sealed_content() {
        let crypto = crypto();
        let now = Utc::now();
        let store = MemoryPasteStore::new();
        let mut record = plain("zk", now);
        record.content = StoredContent::Encrypted {
            holder: KeyHolder::Client,
            payload: EncryptedPayload {
                ciphertext: vec![7; 4],
                material: crate::EncryptionMaterial {
                    iv: vec![1; 12],
                    auth_tag: vec![2; 16],
                    salt: Vec::new(),
                },
            },
        };
        store.insert(record).await.unwrap();

        let request = AccessRequest::new(now).text_only();
        let outcome = retrieve(&store, &crypto, "zk", &request, 4).await.unwrap();
        assert!(matches!(outcome, AccessOutcome::ClientKeyRequired));
        assert_eq!(store.get("zk").await.unwrap().unwrap().view_count, 0);
    }
}
