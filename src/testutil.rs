//! Loopback fixtures shared by the unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};

/// How the mock collection API answers every report.
#[derive(Debug, Clone, Copy)]
pub enum MockReply {
    Ok(bool),
    Status(u16),
    Body(&'static str),
}

/// One report received by the mock API.
#[derive(Debug, Clone)]
pub struct Hit {
    pub token: String,
    pub query: HashMap<String, String>,
}

#[derive(Clone)]
struct MockState {
    reply: MockReply,
    hits: Arc<Mutex<Vec<Hit>>>,
}

/// A running mock collection API.
pub struct MockApi {
    /// Base URL to hand to the reporter.
    pub base: String,
    hits: Arc<Mutex<Vec<Hit>>>,
}

impl MockApi {
    pub fn hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap().clone()
    }
}

async fn handle_push(
    State(state): State<MockState>,
    Path(token): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.hits.lock().unwrap().push(Hit { token, query });

    match state.reply {
        MockReply::Ok(ok) => Json(serde_json::json!({ "ok": ok })).into_response(),
        MockReply::Status(code) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
        MockReply::Body(body) => body.into_response(),
    }
}

/// Serve the mock API on an ephemeral loopback port.
pub async fn spawn_mock_api(reply: MockReply) -> MockApi {
    let hits = Arc::new(Mutex::new(Vec::new()));
    let state = MockState {
        reply,
        hits: hits.clone(),
    };
    let app = Router::new()
        .route("/push/{token}", get(handle_push))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockApi {
        base: format!("http://{}/push", addr),
        hits,
    }
}

/// An address nothing listens on.
pub async fn closed_tcp_addr() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
