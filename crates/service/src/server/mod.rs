//! HTTP-over-local-socket server.
//!
//! Every operation is a POST with a JSON body answered with the uniform
//! `{ok, data?, error?}` envelope. Each accepted connection is verified
//! against the daemon's UID before a single byte is read, then served on
//! its own task.

pub mod security;

use crate::error::{Result as ServiceResult, ServiceError};
use crate::service::Service;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use hyper_util::rt::TokioIo;
use sectap_protocol::{self as proto, routes, ApiError, Envelope, ErrorCode};
use serde::Serialize;
use std::any::Any;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt as _;
use tower_http::catch_panic::CatchPanicLayer;

type AppState = Arc<Service>;

/// Per-request cancellation handle. The accept loop stores the connection's
/// token in the request extensions; it is cancelled when the connection
/// ends, so a client that disconnects or times out aborts the in-flight
/// backend work. Requests without one (tests driving the router directly)
/// get a token that never fires.
#[derive(Clone, Default)]
pub struct RequestContext(pub CancellationToken);

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<CancellationToken>()
            .cloned()
            .map(RequestContext)
            .unwrap_or_default())
    }
}

pub fn router(service: AppState) -> Router {
    Router::new()
        .route(routes::HEALTH, post(health))
        .route(routes::STOP, post(stop))
        .route(routes::PROXY_LIST, post(proxy_list))
        .route(routes::PROXY_EXPORT, post(proxy_export))
        .route(routes::PROXY_RULE_LIST, post(rule_list))
        .route(routes::PROXY_RULE_ADD, post(rule_add))
        .route(routes::PROXY_RULE_UPDATE, post(rule_update))
        .route(routes::PROXY_RULE_DELETE, post(rule_delete))
        .route(routes::REPLAY_SEND, post(replay_send))
        .route(routes::REPLAY_GET, post(replay_get))
        .route(routes::OAST_CREATE, post(oast_create))
        .route(routes::OAST_POLL, post(oast_poll))
        .route(routes::OAST_GET, post(oast_get))
        .route(routes::OAST_LIST, post(oast_list))
        .route(routes::OAST_DELETE, post(oast_delete))
        .route(routes::ENCODE_URL, post(encode_url))
        .route(routes::ENCODE_BASE64, post(encode_base64))
        .route(routes::ENCODE_HTML, post(encode_html))
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(service)
}

/// Accept loop. Runs until the service signals shutdown, then drains
/// in-flight connections up to `drain_deadline`.
pub async fn serve(
    listener: UnixListener,
    service: AppState,
    drain_deadline: Duration,
) -> anyhow::Result<()> {
    let app = router(service.clone());
    let mut tasks = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            _ = service.wait_shutdown() => break,
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        continue;
                    }
                };
                if let Err(reason) = security::verify_peer(&stream) {
                    // Close without reading a byte.
                    log::warn!("rejected connection: {reason}");
                    drop(stream);
                    continue;
                }

                let app = app.clone();
                let token = CancellationToken::new();
                let request_token = token.clone();
                tasks.spawn(async move {
                    // Cancelled when the connection ends (client gone, or
                    // this task aborted at the drain deadline) so in-flight
                    // handlers and their adapter calls stop.
                    let _cancel_on_close = token.drop_guard();
                    let io = TokioIo::new(stream);
                    let hyper_service = hyper::service::service_fn(
                        move |mut request: hyper::Request<hyper::body::Incoming>| {
                            request.extensions_mut().insert(request_token.clone());
                            app.clone().oneshot(request)
                        },
                    );
                    if let Err(err) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, hyper_service)
                        .await
                    {
                        log::debug!("connection ended with error: {err}");
                    }
                });
            }
        }
    }

    log::info!("draining {} in-flight connections", tasks.len());
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(drain_deadline, drain).await.is_err() {
        log::warn!("drain deadline reached; aborting remaining connections");
        tasks.shutdown().await;
    }
    Ok(())
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidRequest | ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::BackendError | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(result: ServiceResult<T>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(Envelope::success(data))).into_response(),
        Err(err) => {
            let envelope = Envelope::<()>::failure(err.to_api_error());
            (status_for(err.code()), Json(envelope)).into_response()
        }
    }
}

fn invalid_body(rejection: JsonRejection) -> Response {
    respond::<()>(Err(ServiceError::InvalidRequest(format!(
        "invalid request body: {rejection}"
    ))))
}

fn panic_response(_err: Box<dyn Any + Send + 'static>) -> axum::http::Response<Body> {
    log::error!("handler panicked; returning INTERNAL_ERROR");
    let envelope = Envelope::<()>::failure(ApiError {
        code: ErrorCode::InternalError,
        message: "internal fault in handler".into(),
        details: None,
    });
    let body = serde_json::to_vec(&envelope).unwrap_or_default();
    axum::http::Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("valid HTTP response")
}

type Payload<T> = Result<Json<T>, JsonRejection>;

async fn health(State(service): State<AppState>, ctx: RequestContext) -> Response {
    respond(service.health(&ctx.0).await)
}

async fn stop(State(service): State<AppState>) -> Response {
    log::info!("stop requested over local socket");
    service.request_shutdown();
    respond(Ok(proto::StopResponse { stopping: true }))
}

async fn proxy_list(
    State(service): State<AppState>,
    ctx: RequestContext,
    body: Payload<proto::ProxyListRequest>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(service.proxy_list(&ctx.0, req).await),
        Err(rejection) => invalid_body(rejection),
    }
}

async fn proxy_export(
    State(service): State<AppState>,
    ctx: RequestContext,
    body: Payload<proto::ProxyExportRequest>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(service.proxy_export(&ctx.0, req).await),
        Err(rejection) => invalid_body(rejection),
    }
}

async fn rule_list(
    State(service): State<AppState>,
    ctx: RequestContext,
    body: Payload<proto::RuleListRequest>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(service.rule_list(&ctx.0, req).await),
        Err(rejection) => invalid_body(rejection),
    }
}

async fn rule_add(
    State(service): State<AppState>,
    ctx: RequestContext,
    body: Payload<proto::RuleAddRequest>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(service.rule_add(&ctx.0, req).await),
        Err(rejection) => invalid_body(rejection),
    }
}

async fn rule_update(
    State(service): State<AppState>,
    ctx: RequestContext,
    body: Payload<proto::RuleUpdateRequest>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(service.rule_update(&ctx.0, req).await),
        Err(rejection) => invalid_body(rejection),
    }
}

async fn rule_delete(
    State(service): State<AppState>,
    ctx: RequestContext,
    body: Payload<proto::RuleDeleteRequest>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(service.rule_delete(&ctx.0, req).await),
        Err(rejection) => invalid_body(rejection),
    }
}

async fn replay_send(
    State(service): State<AppState>,
    ctx: RequestContext,
    body: Payload<proto::ReplaySendRequest>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(service.replay_send(&ctx.0, req).await),
        Err(rejection) => invalid_body(rejection),
    }
}

async fn replay_get(
    State(service): State<AppState>,
    ctx: RequestContext,
    body: Payload<proto::ReplayGetRequest>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(service.replay_get(&ctx.0, req).await),
        Err(rejection) => invalid_body(rejection),
    }
}

async fn oast_create(
    State(service): State<AppState>,
    ctx: RequestContext,
    body: Payload<proto::OastCreateRequest>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(service.oast_create(&ctx.0, req).await),
        Err(rejection) => invalid_body(rejection),
    }
}

async fn oast_poll(
    State(service): State<AppState>,
    ctx: RequestContext,
    body: Payload<proto::OastPollRequest>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(service.oast_poll(&ctx.0, req).await),
        Err(rejection) => invalid_body(rejection),
    }
}

async fn oast_get(
    State(service): State<AppState>,
    ctx: RequestContext,
    body: Payload<proto::OastGetRequest>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(service.oast_get(&ctx.0, req).await),
        Err(rejection) => invalid_body(rejection),
    }
}

async fn oast_list(
    State(service): State<AppState>,
    ctx: RequestContext,
    body: Payload<proto::OastListRequest>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(service.oast_list(&ctx.0, req).await),
        Err(rejection) => invalid_body(rejection),
    }
}

async fn oast_delete(
    State(service): State<AppState>,
    ctx: RequestContext,
    body: Payload<proto::OastDeleteRequest>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(service.oast_delete(&ctx.0, req).await),
        Err(rejection) => invalid_body(rejection),
    }
}

async fn encode_url(State(service): State<AppState>, body: Payload<proto::EncodeRequest>) -> Response {
    match body {
        Ok(Json(req)) => respond(service.encode_url(req)),
        Err(rejection) => invalid_body(rejection),
    }
}

async fn encode_base64(
    State(service): State<AppState>,
    body: Payload<proto::EncodeRequest>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(service.encode_base64(req)),
        Err(rejection) => invalid_body(rejection),
    }
}

async fn encode_html(
    State(service): State<AppState>,
    body: Payload<proto::EncodeRequest>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(service.encode_html(req)),
        Err(rejection) => invalid_body(rejection),
    }
}
