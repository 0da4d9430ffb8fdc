use psti::client::{self, ClientKey};
use psti::server::crypto::{CryptoError, MasterKey, PasteCrypto, MIN_PBKDF2_ITERATIONS};

fn crypto() -> PasteCrypto {
    PasteCrypto::new(MasterKey::generate(), MIN_PBKDF2_ITERATIONS)
}

#[test]
fn password_hash_verifies_only_its_password() {
    let crypto = crypto();
    for password in ["abc1", "correct horse battery staple", "pässwörd", " "] {
        let hash = crypto.hash_password(password).expect("hash");
        assert!(crypto.verify_password(password, &hash));
        assert!(!crypto.verify_password(&format!("{password}x"), &hash));
    }
}

#[test]
fn password_round_trip_recovers_plaintext() {
    let crypto = crypto();
    let plaintext = "Hello, World! This is a test message.";
    let sealed = crypto
        .encrypt(plaintext.as_bytes(), Some("test-password"))
        .expect("encryption should succeed");

    let opened = crypto
        .decrypt(&sealed, Some("test-password"))
        .expect("decryption should succeed");
    assert_eq!(opened, plaintext.as_bytes());
}

#[test]
fn wrong_password_fails_authentication() {
    let crypto = crypto();
    let sealed = crypto.encrypt(b"payload", Some("right")).unwrap();
    assert_eq!(
        crypto.decrypt(&sealed, Some("wrong")),
        Err(CryptoError::AuthenticationFailed)
    );
    assert!(crypto.decrypt(&sealed, None).is_err());
}

#[test]
fn other_master_key_fails_authentication() {
    let sealed = crypto().encrypt(b"payload", None).unwrap();
    assert_eq!(
        crypto().decrypt(&sealed, None),
        Err(CryptoError::AuthenticationFailed)
    );
}

#[test]
fn flipped_ciphertext_byte_is_detected() {
    let crypto = crypto();
    let mut sealed = crypto.encrypt(b"integrity matters", None).unwrap();
    sealed.ciphertext[3] ^= 0x80;
    assert_eq!(
        crypto.decrypt(&sealed, None),
        Err(CryptoError::AuthenticationFailed)
    );
}

#[test]
fn every_encryption_uses_fresh_iv_and_salt() {
    let crypto = crypto();
    let first = crypto.encrypt(b"same", Some("pw")).unwrap();
    let second = crypto.encrypt(b"same", Some("pw")).unwrap();
    assert_ne!(first.material.iv, second.material.iv);
    assert_ne!(first.material.salt, second.material.salt);
    assert_ne!(first.ciphertext, second.ciphertext);
}

#[test]
fn empty_plaintext_round_trips() {
    let crypto = crypto();
    let sealed = crypto.encrypt(b"", None).unwrap();
    assert!(sealed.ciphertext.is_empty());
    assert_eq!(crypto.decrypt(&sealed, None).unwrap(), b"");
}

#[test]
fn client_key_path_is_independent_of_server_keys() {
    let key = ClientKey::generate();
    let sealed = client::seal("zero knowledge", &key).unwrap();

    // The server cannot open it with anything it holds.
    assert!(crypto().decrypt(&sealed, None).is_err());

    let restored = ClientKey::from_fragment(&key.to_fragment()).unwrap();
    assert_eq!(client::open(&sealed, &restored).unwrap(), "zero knowledge");
}
