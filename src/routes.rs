use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{reject, Filter, Rejection, Reply};

use crate::auth::{cookie_value, extract_credential, Authenticator, TokenAuthenticator};
use crate::config::Config;
use crate::consultations::ConsultationLedger;
use crate::contacts::ContactResolver;
use crate::delivery::DeliveryEngine;
use crate::error::CareError;
use crate::message_store::MessageStore;
use crate::models::{ConsultationId, Identity, Role, UserId};
use crate::registry::ConnectionRegistry;
use crate::server::Server;
use crate::store::Database;

/// The process-wide services, built once and shared by every route.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub auth: Arc<dyn Authenticator>,
    pub registry: Arc<ConnectionRegistry>,
    pub engine: Arc<DeliveryEngine>,
    pub ledger: Arc<ConsultationLedger>,
    pub contacts: Arc<ContactResolver>,
    pub server: Server,
    /// Largest accepted request body or websocket message, in bytes.
    pub body_limit: usize,
}

impl AppState {
    /// Must be called from within a tokio runtime: it starts the fan-out worker.
    pub fn new(db: Arc<Database>, config: &Config) -> Self {
        let auth: Arc<dyn Authenticator> = Arc::new(TokenAuthenticator::new(db.clone()));
        Self::with_authenticator(db, auth, config)
    }

    pub fn with_authenticator(
        db: Arc<Database>,
        auth: Arc<dyn Authenticator>,
        config: &Config,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let engine = DeliveryEngine::start(
            MessageStore::new(db.clone()),
            registry.clone(),
            config.max_message_len,
        );
        let ledger = Arc::new(ConsultationLedger::new(db.clone(), engine.clone()));
        let contacts = Arc::new(ContactResolver::new(db.clone(), registry.clone()));
        let server = Server::new(registry.clone(), engine.clone(), config);
        AppState {
            db,
            auth,
            registry,
            engine,
            ledger,
            contacts,
            server,
            body_limit: body_limit(config.max_message_len),
        }
    }
}

#[derive(Deserialize)]
struct SendMessageRequest {
    recipient_id: UserId,
    message: String,
}

#[derive(Deserialize)]
struct CreateConsultationRequest {
    doctor_id: UserId,
    notes: Option<String>,
    appointment_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Default)]
struct AcceptRequest {
    appointment_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct AssignVolunteerRequest {
    volunteer_id: UserId,
}

#[derive(Deserialize)]
struct HandshakeQuery {
    token: Option<String>,
}

#[derive(Debug)]
struct BodyTooLarge {
    limit: usize,
}

impl reject::Reject for BodyTooLarge {}

/// Room for `max_message_len` characters of up to four UTF-8 bytes each,
/// plus the JSON envelope around them.
fn body_limit(max_message_len: usize) -> usize {
    max_message_len.saturating_mul(4).saturating_add(1024)
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    kind: String,
    message: String,
    timestamp: DateTime<Utc>,
}

/// Full route tree: the API, then `fallback` (static files or nothing),
/// with every rejection rendered as a structured error body.
pub fn routes(
    state: AppState,
    fallback: BoxedFilter<(Response,)>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    api(state).or(fallback).recover(handle_rejection)
}

pub fn static_files(dir: PathBuf) -> BoxedFilter<(Response,)> {
    warp::fs::dir(dir)
        .map(|file: warp::filters::fs::File| file.into_response())
        .boxed()
}

pub fn no_static_files() -> BoxedFilter<(Response,)> {
    warp::any()
        .and_then(|| async { Err::<Response, Rejection>(reject::not_found()) })
        .boxed()
}

pub fn api(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    health(state.clone())
        .or(realtime(state.clone()))
        .or(chats(state.clone()))
        .or(consultations(state.clone()))
        .or(patients(state))
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn with_identity(
    state: AppState,
) -> impl Filter<Extract = (Identity,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(warp::header::optional::<String>("cookie"))
        .and(with_state(state))
        .and_then(
            |header: Option<String>, cookies: Option<String>, state: AppState| async move {
                let cookie = cookies
                    .as_deref()
                    .and_then(|cookies| cookie_value(cookies, "access_token"));
                let credential = extract_credential(header.as_deref(), cookie.as_deref())
                    .ok_or_else(|| {
                        reject::custom(CareError::Unauthorized("missing credential".into()))
                    })?;
                state.auth.resolve(&credential).await.map_err(reject::custom)
            },
        )
}

/// Refuses a body before it is read: too long a declared length, or a
/// streamed body with no declared length at all.
fn body_within(limit: usize) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<u64>("content-length")
        .and(warp::header::optional::<String>("transfer-encoding"))
        .and_then(move |length: Option<u64>, encoding: Option<String>| async move {
            let too_large = length.is_some_and(|length| {
                !usize::try_from(length).is_ok_and(|length| length <= limit)
            });
            if too_large {
                return Err(reject::custom(BodyTooLarge { limit }));
            }
            if length.is_none() && encoding.is_some() {
                return Err(reject::custom(CareError::Validation(
                    "request body needs a Content-Length".into(),
                )));
            }
            Ok(())
        })
        .untuple_one()
}

fn json_body<T: DeserializeOwned + Send>(
    limit: usize,
) -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    body_within(limit).and(warp::body::json())
}

fn json_or_default<T: DeserializeOwned + Default + Send + 'static>(
    limit: usize,
) -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    body_within(limit)
        .and(warp::body::bytes())
        .and_then(|body: warp::hyper::body::Bytes| async move {
            if body.iter().all(u8::is_ascii_whitespace) {
                return Ok(T::default());
            }
            serde_json::from_slice(&body).map_err(|e| {
                reject::custom(CareError::Validation(format!("invalid JSON body: {e}")))
            })
        })
}

fn health(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("health")
        .and(warp::get())
        .and(with_state(state))
        .and_then(|state: AppState| async move {
            let store = if state.db.is_durable() {
                "healthy (snapshot)"
            } else {
                "healthy (in-memory)"
            };
            let connections = state.registry.total_connections().await;
            Ok::<_, Infallible>(warp::reply::json(&json!({
                "success": true,
                "message": "System healthy",
                "data": {
                    "api": "healthy",
                    "store": store,
                    "connections": connections,
                },
                "timestamp": Utc::now(),
            })))
        })
}

fn realtime(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("ws")
        .and(warp::ws())
        .and(warp::query::<HandshakeQuery>())
        .and(warp::header::optional::<String>("authorization"))
        .and(with_state(state))
        .and_then(
            |ws: warp::ws::Ws,
             query: HandshakeQuery,
             header: Option<String>,
             state: AppState| async move {
                let credential = query
                    .token
                    .filter(|token| !token.is_empty())
                    .or_else(|| extract_credential(header.as_deref(), None))
                    .ok_or_else(|| CareError::Unauthorized("missing credential".into()));
                let identity = match credential {
                    Ok(credential) => state.auth.resolve(&credential).await,
                    Err(e) => Err(e),
                };
                let identity = match identity {
                    Ok(identity) => identity,
                    Err(e) => {
                        warn!("Rejected realtime handshake: {e}");
                        return Err(reject::custom(e));
                    }
                };
                let server = state.server.clone();
                let ws = ws
                    .max_message_size(state.body_limit)
                    .max_frame_size(state.body_limit);
                Ok(ws.on_upgrade(move |socket| async move {
                    server.handle_connection(socket, identity).await;
                }))
            },
        )
}

fn chats(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let send = warp::path!("api" / "chats")
        .and(warp::post())
        .and(with_identity(state.clone()))
        .and(json_body(state.body_limit))
        .and(with_state(state.clone()))
        .and_then(send_message);

    let history = warp::path!("api" / "chats" / "history" / UserId)
        .and(warp::get())
        .and(with_identity(state.clone()))
        .and(with_state(state.clone()))
        .and_then(history);

    let contacts = warp::path!("api" / "chats" / "contacts")
        .and(warp::get())
        .and(with_identity(state.clone()))
        .and(with_state(state))
        .and_then(contacts);

    send.or(history).or(contacts)
}

fn consultations(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let create = warp::path!("api" / "consultations")
        .and(warp::post())
        .and(with_identity(state.clone()))
        .and(json_body(state.body_limit))
        .and(with_state(state.clone()))
        .and_then(create_consultation);

    let list = warp::path!("api" / "consultations")
        .and(warp::get())
        .and(with_identity(state.clone()))
        .and(with_state(state.clone()))
        .and_then(list_consultations);

    let pending = warp::path!("api" / "consultations" / "pending")
        .and(warp::get())
        .and(with_identity(state.clone()))
        .and(with_state(state.clone()))
        .and_then(pending_consultations);

    let accept = warp::path!("api" / "consultations" / ConsultationId / "accept")
        .and(warp::post())
        .and(with_identity(state.clone()))
        .and(json_or_default::<AcceptRequest>(state.body_limit))
        .and(with_state(state.clone()))
        .and_then(accept_consultation);

    let decline = warp::path!("api" / "consultations" / ConsultationId / "decline")
        .and(warp::post())
        .and(with_identity(state.clone()))
        .and(with_state(state))
        .and_then(decline_consultation);

    create.or(list).or(pending).or(accept).or(decline)
}

fn patients(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("api" / "patients" / UserId / "volunteer")
        .and(warp::post())
        .and(with_identity(state.clone()))
        .and(json_body(state.body_limit))
        .and(with_state(state))
        .and_then(assign_volunteer)
}

async fn send_message(
    identity: Identity,
    request: SendMessageRequest,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let message = state
        .engine
        .submit(identity.user_id, request.recipient_id, &request.message)
        .await
        .map_err(reject::custom)?;
    Ok(warp::reply::with_status(
        warp::reply::json(&message),
        StatusCode::CREATED,
    ))
}

async fn history(
    counterparty: UserId,
    identity: Identity,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    state
        .db
        .read(|tables| tables.user(counterparty).map(|_| ()))
        .await
        .map_err(reject::custom)?;
    let messages = state.engine.history(identity.user_id, counterparty).await;
    Ok(warp::reply::json(&messages))
}

async fn contacts(identity: Identity, state: AppState) -> Result<impl Reply, Rejection> {
    let contacts = state.contacts.contacts_for(&identity).await;
    Ok(warp::reply::json(&contacts))
}

async fn create_consultation(
    identity: Identity,
    request: CreateConsultationRequest,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    identity.require(Role::Patient).map_err(reject::custom)?;
    let consultation = state
        .ledger
        .create(
            identity.user_id,
            request.doctor_id,
            request.notes,
            request.appointment_time,
        )
        .await
        .map_err(reject::custom)?;
    Ok(warp::reply::with_status(
        warp::reply::json(&consultation),
        StatusCode::CREATED,
    ))
}

async fn list_consultations(identity: Identity, state: AppState) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&state.ledger.list_for(&identity).await))
}

async fn pending_consultations(
    identity: Identity,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    identity.require(Role::Doctor).map_err(reject::custom)?;
    Ok(warp::reply::json(
        &state.ledger.pending_for_doctor(identity.user_id).await,
    ))
}

async fn accept_consultation(
    consultation_id: ConsultationId,
    identity: Identity,
    request: AcceptRequest,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let consultation = state
        .ledger
        .accept(consultation_id, identity.user_id, request.appointment_time)
        .await
        .map_err(reject::custom)?;
    Ok(warp::reply::json(&consultation))
}

async fn decline_consultation(
    consultation_id: ConsultationId,
    identity: Identity,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let consultation = state
        .ledger
        .decline(consultation_id, identity.user_id)
        .await
        .map_err(reject::custom)?;
    Ok(warp::reply::json(&consultation))
}

async fn assign_volunteer(
    patient_id: UserId,
    identity: Identity,
    request: AssignVolunteerRequest,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let profile = state
        .ledger
        .assign_volunteer(&identity, patient_id, request.volunteer_id)
        .await
        .map_err(reject::custom)?;
    Ok(warp::reply::json(&profile))
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, kind, message) = if let Some(e) = err.find::<CareError>() {
        (e.status_code(), e.kind(), e.to_string())
    } else if let Some(e) = err.find::<BodyTooLarge>() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            format!("request body exceeds {} bytes", e.limit),
        )
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not_found", "No such route".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, "validation", e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, "validation", e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            "Method not allowed".to_string(),
        )
    } else {
        error!("Unhandled rejection: {err:?}");
        (
            StatusCode::BAD_REQUEST,
            "bad_request",
            "Request could not be processed".to_string(),
        )
    };

    let body = ErrorBody {
        success: false,
        kind: kind.to_string(),
        message,
        timestamp: Utc::now(),
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}
