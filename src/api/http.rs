use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast::Receiver;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::clock::MAX_EXTERNAL_STAMP;
use crate::codec::{self, Object, Style};
use crate::storage::store::{ID_FIELD, STAMP_FIELD};
use crate::{AppState, Error, Result};

/// A decoded write body that passed validation.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub id: String,
    /// Writer's own logical clock, when it sent one.
    pub remote_stamp: Option<u64>,
    pub payload: Object,
}

impl TryFrom<Object> for WriteRequest {
    type Error = Error;

    fn try_from(payload: Object) -> Result<Self> {
        let id = match payload.get(ID_FIELD) {
            None => return Err(Error::MissingIdentifier),
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(_) => return Err(Error::InvalidIdentifier),
        };
        let remote_stamp = match payload.get(STAMP_FIELD) {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_u64() {
                Some(stamp) if stamp <= MAX_EXTERNAL_STAMP => Some(stamp),
                _ => return Err(Error::InvalidLogicalStamp),
            },
        };
        Ok(Self { id, remote_stamp, payload })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/weather", get(get_all).fallback(unsupported))
        .route(
            "/weather.json",
            put(put_weather).get(get_all).fallback(unsupported),
        )
        .route("/weather/:id", get(get_station).fallback(unsupported))
        .fallback(unsupported)
        .layer(SetResponseHeaderLayer::overriding(
            header::CONNECTION,
            HeaderValue::from_static("close"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Accept connections until shutdown, one task per connection. Each
/// connection carries exactly one request.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: Receiver<()>,
) -> Result<()> {
    let read_timeout = state.settings.server.read_timeout();
    let app = router(state);

    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let service = TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            let mut builder = http1::Builder::new();
            builder
                .timer(TokioTimer::new())
                .header_read_timeout(read_timeout)
                .keep_alive(false);
            if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
                tracing::debug!(%peer, error = %e, "connection aborted");
            }
        });
    }

    tracing::info!("listener stopped");
    Ok(())
}

async fn get_all(State(state): State<Arc<AppState>>) -> Result<Response> {
    let mut doc = Object::new();
    for (id, record) in state.read_all().await {
        doc.insert(id, Value::Object(record.payload.clone()));
    }
    json_response(&Value::Object(doc))
}

async fn get_station(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response> {
    match state.read(&id).await {
        Some(record) => json_response(&Value::Object(record.payload.clone())),
        None => Err(Error::NotFound(id)),
    }
}

async fn put_weather(State(state): State<Arc<AppState>>, body: Body) -> Result<StatusCode> {
    let limits = &state.settings.server;
    let bytes = tokio::time::timeout(
        limits.read_timeout(),
        axum::body::to_bytes(body, limits.max_body_bytes),
    )
    .await
    .map_err(|_| Error::ReadTimeout)?
    .map_err(|e| Error::MalformedRequest(format!("unreadable body: {e}")))?;

    if bytes.is_empty() {
        return Ok(StatusCode::NO_CONTENT);
    }
    let req = WriteRequest::try_from(codec::decode_object(&bytes)?)?;

    // Detached so a client hanging up cannot cancel a write halfway through.
    let outcome = tokio::spawn(async move { state.write(req).await })
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;

    Ok(if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    })
}

async fn unsupported(method: Method, uri: Uri) -> Error {
    Error::MalformedRequest(format!("unsupported request {method} {uri}"))
}

fn json_response(value: &Value) -> Result<Response> {
    let body = codec::encode(value, Style::Compact)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}
