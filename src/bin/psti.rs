use std::io::{self, Read};

use clap::{Parser, Subcommand, ValueEnum};
use psti::client::{self, split_share_url, ClientKey};
use psti::server::handlers::{OWNER_HEADER, PASSWORD_HEADER};
use psti::server::models::{
    CreatePasteRequest, CreatePasteResponse, PasteViewResponse, SealedContent,
};
use psti::server::time::Expiration;
use psti::Visibility;
use reqwest::StatusCode;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
enum CliVisibility {
    #[default]
    Public,
    Unlisted,
    Private,
}

impl From<CliVisibility> for Visibility {
    fn from(value: CliVisibility) -> Self {
        match value {
            CliVisibility::Public => Visibility::Public,
            CliVisibility::Unlisted => Visibility::Unlisted,
            CliVisibility::Private => Visibility::Private,
        }
    }
}

/// Create and read pastes on a psti server.
#[derive(Parser, Debug)]
#[command(author, version = env!("PSTI_VERSION"), about)]
struct Cli {
    /// Base URL of the psti server (e.g. http://127.0.0.1:8000).
    #[arg(long, global = true, default_value = "http://127.0.0.1:8000")]
    host: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a paste and print its share link.
    Create {
        /// Text to paste. When omitted, stdin is read instead.
        text: Option<String>,

        #[arg(long, default_value = "Untitled")]
        title: String,

        #[arg(long)]
        language: Option<String>,

        #[arg(long, value_enum, default_value_t = CliVisibility::Public)]
        visibility: CliVisibility,

        /// One of 10m, 1h, 1d, 1w, 1m, 6m, 1y, never.
        #[arg(long, default_value = "never")]
        expiration: Expiration,

        #[arg(long)]
        password: Option<String>,

        /// Have the server encrypt the content at rest.
        #[arg(long, conflicts_with = "zero_knowledge")]
        encrypt: bool,

        /// Seal locally; the key only ever appears in the link fragment.
        #[arg(long, conflicts_with = "password")]
        zero_knowledge: bool,

        /// Delete the paste after its first successful view.
        #[arg(long)]
        burn_after_read: bool,

        /// Owner account, normally injected by the session proxy.
        #[arg(long)]
        owner: Option<String>,
    },
    /// Fetch a paste by share link, opening zero-knowledge pastes locally.
    Get {
        url: String,

        #[arg(long)]
        password: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let output = execute(cli)?;
    println!("{output}");
    Ok(())
}

fn execute(cli: Cli) -> io::Result<String> {
    let base_url = cli.host.trim_end_matches('/').to_owned();
    let http = reqwest::blocking::Client::builder()
        .build()
        .map_err(io::Error::other)?;

    match cli.command {
        Command::Create {
            text,
            title,
            language,
            visibility,
            expiration,
            password,
            encrypt,
            zero_knowledge,
            burn_after_read,
            owner,
        } => {
            let content = match text {
                Some(text) => text,
                None => {
                    let mut buffer = String::new();
                    io::stdin().read_to_string(&mut buffer)?;
                    buffer
                }
            };
            if content.trim().is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "No input provided.",
                ));
            }

            let mut request = CreatePasteRequest {
                title,
                language,
                visibility: visibility.into(),
                password,
                expiration,
                encrypted: encrypt,
                burn_after_read,
                ..CreatePasteRequest::default()
            };
            let key = if zero_knowledge {
                let key = ClientKey::generate();
                let payload = client::seal(&content, &key).map_err(invalid_data)?;
                request.sealed = Some(SealedContent::from_payload(&payload));
                Some(key)
            } else {
                request.content = Some(content);
                None
            };

            let mut call = http
                .post(format!("{base_url}/api/pastes"))
                .json(&request);
            if let Some(owner) = owner.as_deref() {
                call = call.header(OWNER_HEADER, owner);
            }
            let response = call.send().map_err(io::Error::other)?;
            if !response.status().is_success() {
                return Err(request_failed(response));
            }
            let created: CreatePasteResponse = response.json().map_err(io::Error::other)?;

            let mut link = format!("{base_url}{}", created.path);
            if let Some(key) = key {
                link.push('#');
                link.push_str(&key.to_fragment());
            }
            Ok(link)
        }
        Command::Get { url, password } => {
            let (location, fragment) = split_share_url(&url);
            let (origin, id) = location
                .trim_end_matches('/')
                .rsplit_once('/')
                .filter(|(_, id)| !id.is_empty())
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "URL does not name a paste")
                })?;

            let mut call = http.get(format!("{origin}/api/pastes/{id}"));
            if let Some(password) = password.as_deref() {
                call = call.header(PASSWORD_HEADER, password);
            }
            let response = call.send().map_err(io::Error::other)?;
            if !response.status().is_success() {
                return Err(request_failed(response));
            }
            let view: PasteViewResponse = response.json().map_err(io::Error::other)?;

            match (view.content, view.sealed) {
                (Some(content), _) => Ok(content),
                (None, Some(sealed)) => {
                    let fragment = fragment.ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "zero-knowledge paste: the link is missing its #key fragment",
                        )
                    })?;
                    let key = ClientKey::from_fragment(fragment).map_err(invalid_data)?;
                    let payload = sealed.into_payload().map_err(invalid_data)?;
                    client::open(&payload, &key).map_err(invalid_data)
                }
                (None, None) => Err(invalid_data("server returned no content")),
            }
        }
    }
}

fn invalid_data(err: impl ToString) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

fn request_failed(response: reqwest::blocking::Response) -> io::Error {
    let status = response.status();
    let reason = match status {
        StatusCode::UNAUTHORIZED => "password required",
        StatusCode::FORBIDDEN => "invalid password or not permitted",
        StatusCode::NOT_FOUND => "paste not found",
        StatusCode::TOO_MANY_REQUESTS => "rate limited",
        _ => "request rejected",
    };
    let detail = response.text().unwrap_or_default();
    io::Error::other(format!(
        "Request failed with status {status}: {reason} {}",
        detail.trim()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use httpmock::prelude::*;
    use serde_json::json;

    fn view(content: Option<&str>, sealed: Option<SealedContent>) -> String {
        let now = Utc::now();
        let response = PasteViewResponse {
            id: "abc123".into(),
            title: "Untitled".into(),
            language: "plaintext".into(),
            visibility: Visibility::Public,
            content: content.map(String::from),
            zero_knowledge: sealed.is_some(),
            encrypted: sealed.is_some(),
            sealed,
            has_password: false,
            burn_after_read: false,
            burned: false,
            view_count: 1,
            expires_at: None,
            created_at: now,
            updated_at: now,
            folder_id: None,
        };
        serde_json::to_string(&response).expect("view json")
    }

    #[test]
    fn create_submits_text_and_prints_link() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/pastes").json_body_partial(
                json!({ "title": "Untitled", "content": "hello", "expiration": "1h" }).to_string(),
            );
            then.status(201)
                .header("content-type", "application/json")
                .body(json!({ "id": "abc123", "path": "/abc123", "expires_at": null }).to_string());
        });

        let base = server.base_url();
        let cli = Cli::parse_from([
            "psti", "--host", base.as_str(), "create", "hello", "--expiration", "1h",
        ]);
        let link = execute(cli).expect("link");
        assert_eq!(link, format!("{base}/abc123"));
        mock.assert();
    }

    #[test]
    fn zero_knowledge_create_keeps_key_in_fragment() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/pastes")
                .json_body_partial(json!({ "title": "Untitled" }).to_string());
            then.status(201)
                .header("content-type", "application/json")
                .body(json!({ "id": "zk1", "path": "/zk1", "expires_at": null }).to_string());
        });

        let base = server.base_url();
        let cli = Cli::parse_from([
            "psti", "--host", base.as_str(), "create", "top secret", "--zero-knowledge",
        ]);
        let link = execute(cli).expect("link");
        let (location, fragment) = split_share_url(&link);
        assert_eq!(location, format!("{base}/zk1"));
        assert!(ClientKey::from_fragment(fragment.expect("fragment")).is_ok());
        mock.assert();
    }

    #[test]
    fn get_opens_zero_knowledge_paste_locally() {
        let key = ClientKey::generate();
        let payload = client::seal("top secret", &key).unwrap();
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/api/pastes/abc123");
            then.status(200)
                .header("content-type", "application/json")
                .body(view(None, Some(SealedContent::from_payload(&payload))));
        });

        let link = format!("{}/abc123#{}", server.base_url(), key.to_fragment());
        let cli = Cli::parse_from(["psti", "get", link.as_str()]);
        assert_eq!(execute(cli).expect("content"), "top secret");
        mock.assert();
    }

    #[test]
    fn get_sends_password_header() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/pastes/abc123")
                .header(PASSWORD_HEADER, "abc1");
            then.status(200)
                .header("content-type", "application/json")
                .body(view(Some("unlocked"), None));
        });

        let link = format!("{}/abc123", server.base_url());
        let cli = Cli::parse_from(["psti", "get", link.as_str(), "--password", "abc1"]);
        assert_eq!(execute(cli).expect("content"), "unlocked");
        mock.assert();
    }

    #[test]
    fn get_reports_password_required() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/api/pastes/abc123");
            then.status(401).body("Password required");
        });

        let link = format!("{}/abc123", server.base_url());
        let cli = Cli::parse_from(["psti", "get", link.as_str()]);
        let err = execute(cli).expect_err("401 expected");
        assert!(err.to_string().contains("password required"));
        mock.assert();
    }

    #[test]
    fn zero_knowledge_rejects_password() {
        let result = Cli::try_parse_from([
            "psti", "create", "x", "--zero-knowledge", "--password", "abcd",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn create_rejects_empty_input() {
        let cli = Cli::parse_from(["psti", "create", " "]);
        let err = execute(cli).expect_err("empty input should fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
