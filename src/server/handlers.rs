use std::net::{IpAddr, Ipv4Addr};

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::{content, status};
use rocket::serde::json::Json;
use rocket::{delete, get, patch, post, routes, Build, Rocket, State};

use super::access::{AccessOutcome, AccessRequest, DisclosedContent};
use super::config::ServerConfig;
use super::models::{
    CreatePasteRequest, CreatePasteResponse, PasteViewResponse, UpdatePasteRequest,
};
use super::ratelimit::{spawn_limiter_sweeper, RateAction, RateDecision, RateLimiter, RateSubject};
use super::service::{spawn_expiry_sweeper, PasteService};
use super::time::current_time;
use crate::{OwnerId, PasteError, PasteSummary, StoreStats};

/// Set by the upstream session layer once it has authenticated the caller.
pub const OWNER_HEADER: &str = "X-Psti-Owner";
/// Header alternative to the `password` query parameter.
pub const PASSWORD_HEADER: &str = "X-Psti-Password";

type ApiError = (Status, String);

pub struct Caller(pub OwnerId);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Caller {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match request
            .headers()
            .get_one(OWNER_HEADER)
            .map(str::trim)
            .filter(|owner| !owner.is_empty())
        {
            Some(owner) => Outcome::Success(Caller(OwnerId::new(owner))),
            None => Outcome::Error((Status::Unauthorized, ())),
        }
    }
}

pub struct PasswordHeader(Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for PasswordHeader {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(PasswordHeader(
            request.headers().get_one(PASSWORD_HEADER).map(String::from),
        ))
    }
}

pub fn build_rocket(service: PasteService, limiter: RateLimiter) -> Rocket<Build> {
    rocket::build().manage(service).manage(limiter).mount(
        "/",
        routes![
            create_api,
            show_api,
            show_raw,
            update_api,
            delete_api,
            list_api,
            stats_summary_api
        ],
    )
}

pub async fn launch(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let crypto = config.build_crypto()?;
    let store = config.open_store()?;
    let service = PasteService::new(store, crypto).with_conflict_retries(config.conflict_retries);

    let sweeper = config
        .gc_interval()
        .map(|every| spawn_expiry_sweeper(service.clone(), every));

    let rocket_config = rocket::Config {
        address: config.address.parse()?,
        port: config.port,
        ..rocket::Config::release_default()
    };

    log::info!(
        "psti {} listening on {}:{} ({:?})",
        env!("PSTI_VERSION"),
        config.address,
        config.port,
        config.storage
    );
    let limiter = config.rate_limiter();
    let limiter_sweeper = config
        .rate_limit_sweep()
        .map(|every| spawn_limiter_sweeper(limiter.clone(), every));

    let result = build_rocket(service, limiter)
        .configure(rocket_config)
        .launch()
        .await;

    for task in [sweeper, limiter_sweeper].into_iter().flatten() {
        task.abort();
    }
    result?;
    Ok(())
}

fn enforce_rate_limit(
    limiter: &RateLimiter,
    ip: Option<IpAddr>,
    caller: Option<&Caller>,
    action: RateAction,
) -> Result<(), ApiError> {
    let subject = match caller {
        Some(Caller(owner)) => RateSubject::Owner(owner.clone()),
        None => RateSubject::Anonymous(ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))),
    };
    match limiter.check(&subject, action) {
        RateDecision::Allowed => Ok(()),
        RateDecision::Limited { retry_after } => Err((
            Status::TooManyRequests,
            format!("Rate limit exceeded, retry in {}s", retry_after.as_secs().max(1)),
        )),
        RateDecision::AtCapacity => Err((
            Status::TooManyRequests,
            "Server is busy, try again later".into(),
        )),
    }
}

fn error_response(id: &str, error: PasteError) -> ApiError {
    match error {
        PasteError::NotFound(_) => (Status::NotFound, "Paste not found".into()),
        PasteError::Forbidden(_) => (
            Status::Forbidden,
            "You do not have permission to modify this paste".into(),
        ),
        PasteError::Invalid(reason) => (Status::BadRequest, reason),
        PasteError::Conflict(_) => (
            Status::Conflict,
            "Paste is busy, try again".into(),
        ),
        PasteError::Store(err) => {
            log::error!("store failure on paste {id}: {err}");
            (Status::InternalServerError, "Storage failure".into())
        }
        PasteError::Crypto(err) => {
            log::error!("crypto failure on paste {id}: {err}");
            (Status::InternalServerError, "Encryption failure".into())
        }
    }
}

fn denied_response(outcome: &AccessOutcome) -> ApiError {
    match outcome {
        AccessOutcome::NotFound => (Status::NotFound, "Paste not found".into()),
        AccessOutcome::PasswordRequired => (Status::Unauthorized, "Password required".into()),
        AccessOutcome::PasswordInvalid => (Status::Forbidden, "Invalid password".into()),
        AccessOutcome::DecryptionFailed => (
            Status::UnprocessableEntity,
            "Paste could not be decrypted".into(),
        ),
        AccessOutcome::ClientKeyRequired => (Status::NotAcceptable, ZERO_KNOWLEDGE_RAW.into()),
        AccessOutcome::Disclosed(_) => (Status::InternalServerError, "Unexpected outcome".into()),
    }
}

const ZERO_KNOWLEDGE_RAW: &str = "Zero-knowledge pastes are only served through /api/pastes";

async fn retrieve(
    service: &PasteService,
    id: &str,
    request: AccessRequest,
) -> Result<AccessOutcome, ApiError> {
    service
        .retrieve(id, &request)
        .await
        .map_err(|err| error_response(id, err))
}

#[post("/api/pastes", data = "<body>")]
async fn create_api(
    service: &State<PasteService>,
    limiter: &State<RateLimiter>,
    ip: Option<IpAddr>,
    caller: Option<Caller>,
    body: Json<CreatePasteRequest>,
) -> Result<status::Created<Json<CreatePasteResponse>>, ApiError> {
    enforce_rate_limit(limiter, ip, caller.as_ref(), RateAction::CreatePaste)?;
    let paste = body
        .into_inner()
        .into_new_paste()
        .map_err(|reason| (Status::BadRequest, reason))?;

    let record = service
        .submit(caller.map(|Caller(owner)| owner), paste)
        .await
        .map_err(|err| error_response("new", err))?;

    let path = format!("/{}", record.id);
    let response = CreatePasteResponse {
        id: record.id,
        path: path.clone(),
        expires_at: record.expires_at,
    };
    Ok(status::Created::new(path).body(Json(response)))
}

#[get("/api/pastes/<id>?<password>")]
async fn show_api(
    service: &State<PasteService>,
    limiter: &State<RateLimiter>,
    ip: Option<IpAddr>,
    caller: Option<Caller>,
    header: PasswordHeader,
    id: &str,
    password: Option<String>,
) -> Result<Json<PasteViewResponse>, ApiError> {
    enforce_rate_limit(limiter, ip, caller.as_ref(), RateAction::ViewPaste)?;
    let request = AccessRequest::new(current_time()).with_password(password.or(header.0));
    match retrieve(service, id, request).await? {
        AccessOutcome::Disclosed(disclosure) => {
            Ok(Json(PasteViewResponse::from_disclosure(&disclosure)))
        }
        denied => Err(denied_response(&denied)),
    }
}

#[get("/raw/<id>?<password>")]
async fn show_raw(
    service: &State<PasteService>,
    limiter: &State<RateLimiter>,
    ip: Option<IpAddr>,
    caller: Option<Caller>,
    header: PasswordHeader,
    id: &str,
    password: Option<String>,
) -> Result<content::RawText<String>, ApiError> {
    enforce_rate_limit(limiter, ip, caller.as_ref(), RateAction::ViewPaste)?;

    // Client-sealed pastes are refused before a view is counted.
    let request = AccessRequest::new(current_time())
        .with_password(password.or(header.0))
        .text_only();
    match retrieve(service, id, request).await? {
        AccessOutcome::Disclosed(disclosure) => match disclosure.content {
            DisclosedContent::Text(text) => Ok(content::RawText(text)),
            DisclosedContent::ClientSealed(_) => {
                Err((Status::NotAcceptable, ZERO_KNOWLEDGE_RAW.into()))
            }
        },
        denied => Err(denied_response(&denied)),
    }
}

#[patch("/api/pastes/<id>", data = "<body>")]
async fn update_api(
    service: &State<PasteService>,
    caller: Caller,
    id: &str,
    body: Json<UpdatePasteRequest>,
) -> Result<Json<PasteSummary>, ApiError> {
    let changes = body
        .into_inner()
        .into_update()
        .map_err(|reason| (Status::BadRequest, reason))?;
    let record = service
        .update(id, &caller.0, changes)
        .await
        .map_err(|err| error_response(id, err))?;
    Ok(Json(PasteSummary::from(&record)))
}

#[delete("/api/pastes/<id>")]
async fn delete_api(
    service: &State<PasteService>,
    caller: Caller,
    id: &str,
) -> Result<Status, ApiError> {
    service
        .remove(id, &caller.0)
        .await
        .map_err(|err| error_response(id, err))?;
    Ok(Status::NoContent)
}

#[get("/api/pastes")]
async fn list_api(
    service: &State<PasteService>,
    caller: Caller,
) -> Result<Json<Vec<PasteSummary>>, ApiError> {
    service
        .list_owned(&caller.0)
        .await
        .map(Json)
        .map_err(|err| error_response("list", err))
}

#[get("/api/stats/summary")]
async fn stats_summary_api(service: &State<PasteService>) -> Result<Json<StoreStats>, ApiError> {
    service
        .stats(current_time())
        .await
        .map(Json)
        .map_err(|err| error_response("stats", err))
}
