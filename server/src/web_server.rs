//! Axum HTTP surface: GET / (liveness text) and POST /callback (normalize payload, emit one
//! CallbackEvent, always answer 200 "Callback received").

use axum::{
    extract::{rejection::BytesRejection, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use tower_http::trace::TraceLayer;

use hooktunnel_core::events::{CallbackEvent, Events, Level};
use hooktunnel_core::payload::{self, Note, PayloadKind};

/// Fixed path external services POST to.
pub const CALLBACK_PATH: &str = "/callback";
/// Body of every /callback response.
pub const CALLBACK_RESPONSE: &str = "Callback received";
/// Body of GET /.
pub const ROOT_MESSAGE: &str = "HookTunnel is running. Send webhook callbacks as POST requests to /callback.";

/// Shared app state: the event hub owned by the listener.
#[derive(Clone)]
struct AppState {
    events: Events,
}

/// Build the router. Routing is fixed at construction; handlers only publish to `events`.
pub fn router(events: Events) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route(CALLBACK_PATH, post(callback_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { events })
}

/// GET / — static instructional text, no side effects.
async fn root_handler() -> &'static str {
    ROOT_MESSAGE
}

/// POST /callback. Query + body are normalized and emitted before the response is written.
/// There is no error status: body read failures are logged and treated as an empty body.
async fn callback_handler(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> (StatusCode, &'static str) {
    let raw = match body {
        Ok(b) => b,
        Err(e) => {
            state
                .events
                .log(Level::Warn, format!("Could not read callback body: {}", e));
            Bytes::new()
        }
    };
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let event = build_callback_event(&state.events, query.as_deref(), content_type, &raw);
    tracing::debug!(
        query = event.query_parameters.len(),
        bytes = raw.len(),
        "callback received"
    );
    state.events.emit_callback(&event);
    (StatusCode::OK, CALLBACK_RESPONSE)
}

/// Query + content-type dispatch + body normalization. Notes from normalization become log events.
fn build_callback_event(
    events: &Events,
    query: Option<&str>,
    content_type: Option<&str>,
    raw: &[u8],
) -> CallbackEvent {
    let query_parameters = payload::parse_query(query);
    let kind = PayloadKind::from_content_type(content_type);
    let normalized = payload::normalize(kind, raw);
    match normalized.note {
        Some(Note::Converted { fields }) => events.log(
            Level::Info,
            format!("Converted form-urlencoded body to JSON ({} fields)", fields),
        ),
        Some(Note::Malformed { reason }) => events.log(
            Level::Warn,
            format!("Callback body ({}) not parsed: {}", kind.as_str(), reason),
        ),
        None => {}
    }
    CallbackEvent {
        query_parameters,
        body: normalized.body,
    }
}
