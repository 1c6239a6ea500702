use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chat_core::{message_history, room_members, ChatContext};
use serde::{Deserialize, Serialize};
use shared::{
    domain::RoomId,
    error::{ApiError, ChatError, ErrorCode},
    protocol::{MemberSummary, MessageBroadcast},
};
use storage::Storage;
use tracing::{error, info};

mod config;
mod notify;
mod rooms;
mod ws;

use config::{load_settings, prepare_database_url};
use notify::Notifier;
use rooms::RoomChannels;

pub struct AppState {
    chat: ChatContext,
    rooms: RoomChannels,
    notifier: Option<Notifier>,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    username: String,
    nickname: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    page: Option<u32>,
    size: Option<u32>,
}

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState {
        chat: ChatContext::new(storage),
        rooms: RoomChannels::new(),
        notifier: settings.notify_url.map(Notifier::new),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "chat server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/rooms/:room_id/messages", get(http_message_history))
        .route("/rooms/:room_id/members", get(http_room_members))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.chat.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "database unavailable"),
    }
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ApiError>)> {
    if req.email.trim().is_empty() || req.username.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(
                ErrorCode::InvalidCommandPayload,
                "email and username are required",
            )),
        ));
    }

    let user_id = state
        .chat
        .storage
        .create_user(&req.email, &req.username, req.nickname.as_deref())
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, e.to_string())),
            )
        })?;

    Ok(Json(LoginResponse { user_id: user_id.0 }))
}

async fn http_message_history(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<MessageBroadcast>>, (StatusCode, Json<ApiError>)> {
    let page = q.page.unwrap_or(0);
    let size = q.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

    let messages = message_history(&state.chat, RoomId(room_id), page, size)
        .await
        .map_err(http_error)?;
    Ok(Json(messages))
}

async fn http_room_members(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
) -> Result<Json<Vec<MemberSummary>>, (StatusCode, Json<ApiError>)> {
    let members = room_members(&state.chat, RoomId(room_id))
        .await
        .map_err(http_error)?;
    Ok(Json(members))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::ws_connection(state, socket))
}

fn http_error(error: ChatError) -> (StatusCode, Json<ApiError>) {
    let status = match &error {
        ChatError::RoomNotFound(_) | ChatError::MessageNotFound(_) => StatusCode::NOT_FOUND,
        ChatError::SenderNotMember(..) => StatusCode::FORBIDDEN,
        ChatError::UnsupportedKind(_) | ChatError::InvalidCommandPayload(_) => {
            StatusCode::BAD_REQUEST
        }
        ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiError::from(error)))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use shared::domain::RoomRole;
    use tower::ServiceExt;

    use super::*;

    async fn test_app() -> (Router, Arc<AppState>, RoomId) {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let room = storage.create_room("bookclub").await.expect("room");
        let host = storage
            .create_user("a@x.io", "ana", Some("Ana"))
            .await
            .expect("user");
        storage
            .ensure_participant(room, host, RoomRole::Host)
            .await
            .expect("participant");

        let state = Arc::new(AppState {
            chat: ChatContext::new(storage),
            rooms: RoomChannels::new(),
            notifier: None,
        });
        (build_router(state.clone()), state, room)
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (app, ..) = test_app().await;
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn login_upserts_and_returns_user_id() {
        let (app, ..) = test_app().await;
        let request = Request::post("/login")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"email":"b@x.io","username":"ben","nickname":"Ben"}"#,
            ))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert!(parsed["userId"].as_i64().expect("id") > 0);
    }

    #[tokio::test]
    async fn history_for_unknown_room_is_404() {
        let (app, ..) = test_app().await;
        let response = app
            .oneshot(
                Request::get("/rooms/999/messages")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(parsed["code"], "room_not_found");
    }

    #[tokio::test]
    async fn history_pages_oldest_to_newest() {
        let (app, state, room) = test_app().await;
        let sender = state
            .chat
            .storage
            .user_by_email("a@x.io")
            .await
            .expect("load")
            .expect("present");
        for content in ["one", "two", "three"] {
            state
                .chat
                .storage
                .append_message(room, sender.user_id, Default::default(), content, None)
                .await
                .expect("append");
        }

        let response = app
            .oneshot(
                Request::get(format!("/rooms/{}/messages?page=0&size=2", room.0))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&body).expect("json");
        let contents: Vec<_> = parsed.iter().map(|m| m["content"].as_str()).collect();
        assert_eq!(contents, vec![Some("two"), Some("three")]);
        assert_eq!(parsed[0]["senderNickname"], "Ana");
        assert_eq!(parsed[0]["type"], "TEXT");
    }

    #[tokio::test]
    async fn members_include_presence_flag() {
        let (app, state, room) = test_app().await;
        let host = state
            .chat
            .storage
            .user_by_email("a@x.io")
            .await
            .expect("load")
            .expect("present");
        state.chat.presence.join(room, host.user_id);

        let response = app
            .oneshot(
                Request::get(format!("/rooms/{}/members", room.0))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&body).expect("json");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["online"], true);
        assert_eq!(parsed[0]["nickname"], "Ana");
    }
}
