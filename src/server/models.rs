use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::access::{DisclosedContent, Disclosure};
use super::service::{NewPaste, PasswordChange, PasteBody, PasteUpdate};
use super::time::Expiration;
use crate::{EncryptedPayload, EncryptionMaterial, Visibility};

pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_CONTENT_BYTES: usize = 10 * 1024 * 1024;
pub const MIN_PASSWORD_CHARS: usize = 4;
pub const MAX_FOLDER_CHARS: usize = 100;

pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "plaintext", "javascript", "typescript", "python", "java", "c", "cpp", "csharp", "go",
    "rust", "ruby", "php", "swift", "kotlin", "scala", "r", "perl", "lua", "bash", "shell",
    "powershell", "sql", "html", "css", "scss", "sass", "less", "json", "xml", "yaml", "toml",
    "markdown", "dockerfile", "makefile", "nginx", "apache", "haskell", "elixir", "erlang",
    "clojure", "lisp", "scheme", "ocaml", "fsharp", "dart", "julia", "matlab", "objective-c",
    "assembly", "vhdl", "verilog", "solidity", "graphql", "protobuf",
];

/// Client-sealed ciphertext on the wire, each part standard base64.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SealedContent {
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
}

impl SealedContent {
    pub fn from_payload(payload: &EncryptedPayload) -> Self {
        Self {
            ciphertext: STANDARD.encode(&payload.ciphertext),
            iv: STANDARD.encode(&payload.material.iv),
            auth_tag: STANDARD.encode(&payload.material.auth_tag),
        }
    }

    pub fn into_payload(self) -> Result<EncryptedPayload, String> {
        let decode = |field: &str, value: &str| {
            STANDARD
                .decode(value.trim())
                .map_err(|_| format!("sealed {field} is not valid base64"))
        };
        Ok(EncryptedPayload {
            ciphertext: decode("ciphertext", &self.ciphertext)?,
            material: EncryptionMaterial {
                iv: decode("iv", &self.iv)?,
                auth_tag: decode("auth_tag", &self.auth_tag)?,
                salt: Vec::new(),
            },
        })
    }
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct CreatePasteRequest {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sealed: Option<SealedContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub visibility: Visibility,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub expiration: Expiration,
    #[serde(skip_serializing_if = "crate::bool_is_false")]
    pub encrypted: bool,
    #[serde(skip_serializing_if = "crate::bool_is_false")]
    pub burn_after_read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
}

impl CreatePasteRequest {
    pub fn into_new_paste(self) -> Result<NewPaste, String> {
        validate_title(&self.title)?;
        let language = self.language.map(validate_language).transpose()?;
        let password = self.password.filter(|p| !p.is_empty());
        if let Some(password) = password.as_deref() {
            validate_password(password)?;
        }
        if let Some(folder) = self.folder_id.as_deref() {
            validate_folder(folder)?;
        }

        let body = match (self.content, self.sealed) {
            (Some(content), None) => {
                validate_content(&content)?;
                PasteBody::Text(content)
            }
            (None, Some(sealed)) => PasteBody::ClientSealed(validate_sealed(sealed)?),
            (Some(_), Some(_)) => {
                return Err("send either content or sealed content, not both".into())
            }
            (None, None) => return Err("content is required".into()),
        };

        Ok(NewPaste {
            title: self.title,
            language,
            visibility: self.visibility,
            body,
            password,
            expiration: self.expiration,
            encrypted: self.encrypted,
            burn_after_read: self.burn_after_read,
            folder: self.folder_id,
        })
    }
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct UpdatePasteRequest {
    pub title: Option<String>,
    pub language: Option<String>,
    pub visibility: Option<Visibility>,
    pub folder_id: Option<String>,
    pub clear_folder: bool,
    pub expiration: Option<Expiration>,
    pub password: Option<String>,
    pub remove_password: bool,
    pub content: Option<String>,
    pub sealed: Option<SealedContent>,
}

impl UpdatePasteRequest {
    pub fn into_update(self) -> Result<PasteUpdate, String> {
        if let Some(title) = self.title.as_deref() {
            validate_title(title)?;
        }
        if let Some(folder) = self.folder_id.as_deref() {
            validate_folder(folder)?;
        }
        let password = match (self.password, self.remove_password) {
            (Some(_), true) => return Err("cannot set and remove the password at once".into()),
            (Some(password), false) => {
                validate_password(&password)?;
                Some(PasswordChange::Set(password))
            }
            (None, true) => Some(PasswordChange::Clear),
            (None, false) => None,
        };
        let body = match (self.content, self.sealed) {
            (Some(_), Some(_)) => {
                return Err("send either content or sealed content, not both".into())
            }
            (Some(content), None) => {
                validate_content(&content)?;
                Some(PasteBody::Text(content))
            }
            (None, Some(sealed)) => Some(PasteBody::ClientSealed(validate_sealed(sealed)?)),
            (None, None) => None,
        };

        Ok(PasteUpdate {
            title: self.title,
            language: self.language.map(validate_language).transpose()?,
            visibility: self.visibility,
            folder: self.folder_id,
            clear_folder: self.clear_folder,
            expiration: self.expiration,
            password,
            body,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CreatePasteResponse {
    pub id: String,
    pub path: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PasteViewResponse {
    pub id: String,
    pub title: String,
    pub language: String,
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed: Option<SealedContent>,
    pub encrypted: bool,
    pub zero_knowledge: bool,
    pub has_password: bool,
    pub burn_after_read: bool,
    pub burned: bool,
    pub view_count: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub folder_id: Option<String>,
}

impl PasteViewResponse {
    pub fn from_disclosure(disclosure: &Disclosure) -> Self {
        let record = &disclosure.record;
        let (content, sealed) = match &disclosure.content {
            DisclosedContent::Text(text) => (Some(text.clone()), None),
            DisclosedContent::ClientSealed(payload) => {
                (None, Some(SealedContent::from_payload(payload)))
            }
        };
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            language: record.language.clone(),
            visibility: record.visibility,
            content,
            zero_knowledge: sealed.is_some(),
            sealed,
            encrypted: record.is_encrypted(),
            has_password: record.has_password(),
            burn_after_read: record.burn_after_read,
            burned: disclosure.burned,
            view_count: record.view_count,
            expires_at: record.expires_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
            folder_id: record.folder.clone(),
        }
    }
}

fn validate_title(title: &str) -> Result<(), String> {
    let chars = title.trim().chars().count();
    if chars == 0 {
        return Err("title is required".into());
    }
    if chars > MAX_TITLE_CHARS {
        return Err(format!("title must be at most {MAX_TITLE_CHARS} characters"));
    }
    Ok(())
}

fn validate_content(content: &str) -> Result<(), String> {
    if content.is_empty() {
        return Err("content is required".into());
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(format!("content must be at most {MAX_CONTENT_BYTES} bytes"));
    }
    Ok(())
}

fn validate_sealed(sealed: SealedContent) -> Result<EncryptedPayload, String> {
    let payload = sealed.into_payload()?;
    if payload.ciphertext.len() > MAX_CONTENT_BYTES {
        return Err(format!("content must be at most {MAX_CONTENT_BYTES} bytes"));
    }
    Ok(payload)
}

fn validate_password(password: &str) -> Result<(), String> {
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(format!(
            "password must be at least {MIN_PASSWORD_CHARS} characters"
        ));
    }
    Ok(())
}

fn validate_folder(folder: &str) -> Result<(), String> {
    let chars = folder.trim().chars().count();
    if chars == 0 || chars > MAX_FOLDER_CHARS {
        return Err(format!("folder must be 1 to {MAX_FOLDER_CHARS} characters"));
    }
    Ok(())
}

fn validate_language(language: String) -> Result<String, String> {
    let normalized = language.trim().to_ascii_lowercase();
    if SUPPORTED_LANGUAGES.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(format!("unsupported language {language:?}"))
    }
}
