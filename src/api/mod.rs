//! HTTP surface: queue REST endpoints and the queue WebSocket.

pub mod queue;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, RawQuery, State};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use crate::app::Services;
use crate::auth::resolve_user;
use crate::errors::AppError;
use crate::models::UserId;
use crate::realtime::CloseReason;

/// The authenticated caller. Rejects with 401 when credentials are missing or invalid.
pub struct AuthUser(pub UserId);

impl FromRequestParts<Services> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        services: &Services,
    ) -> Result<Self, Self::Rejection> {
        let user_id =
            resolve_user(services.auth.as_ref(), &parts.headers, parts.uri.query()).await?;
        Ok(AuthUser(user_id))
    }
}

pub fn router(services: Services) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/queue", queue::routes())
        .route("/ws/queue", get(queue_socket))
        .with_state(services)
}

async fn health() -> &'static str {
    "ok"
}

/// Upgrade first, then refuse with a close code, so clients can tell auth
/// failures apart from network errors.
async fn queue_socket(
    ws: WebSocketUpgrade,
    State(services): State<Services>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let auth = match resolve_user(services.auth.as_ref(), &headers, query.as_deref()).await {
        Ok(user_id) => Ok(user_id),
        Err(e) => {
            log::warn!("[Gateway] WebSocket credentials rejected: {}", e);
            Err(CloseReason::for_auth_error(&e))
        }
    };

    let gateway = services.gateway.clone();
    ws.on_upgrade(move |socket| async move { gateway.serve(socket, auth).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::test_support::{self, OTHER_TOKEN, USER_ID, VALID_TOKEN};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    async fn spawn_app() -> (SocketAddr, Services) {
        let db = test_support::seeded_database().await;
        let services = Services::build(db.pool.clone(), &AppConfig::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(services.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, services)
    }

    async fn spawn_server() -> String {
        let (addr, _) = spawn_app().await;
        format!("http://{}", addr)
    }

    type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn open_socket(addr: SocketAddr, query: &str) -> Socket {
        let (socket, _) = connect_async(format!("ws://{}/ws/queue{}", addr, query))
            .await
            .unwrap();
        socket
    }

    /// Next data or close frame, skipping keepalives.
    async fn next_frame(socket: &mut Socket) -> WsMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("frame within 5s")
                .expect("socket still open")
                .unwrap();
            match frame {
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => return other,
            }
        }
    }

    async fn next_json(socket: &mut Socket) -> Value {
        match next_frame(socket).await {
            WsMessage::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    async fn close_code(socket: &mut Socket) -> u16 {
        match next_frame(socket).await {
            WsMessage::Close(Some(frame)) => u16::from(frame.code),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    async fn wait_for_subscribers(services: &Services, user_id: UserId, expected: usize) {
        for _ in 0..100 {
            if services.broadcaster.subscriber_count(user_id) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "user {} has {} subscriber(s), expected {}",
            user_id,
            services.broadcaster.subscriber_count(user_id),
            expected
        );
    }

    async fn call(
        client: &reqwest::Client,
        method: reqwest::Method,
        url: String,
        token: &str,
    ) -> (u16, Value) {
        let response = client
            .request(method, url)
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_queue_endpoints() {
        let base = spawn_server().await;
        let api = format!("{}/api/queue", base);
        let client = reqwest::Client::new();
        use reqwest::Method;

        let (status, body) = call(&client, Method::GET, format!("{}/current-queue", api), VALID_TOKEN).await;
        assert_eq!(status, 200);
        assert_eq!(body["total_tracks"], 0);

        for track in [1, 2, 3] {
            let (status, body) = call(&client, Method::POST, format!("{}/add-track/{}", api, track), VALID_TOKEN).await;
            assert_eq!(status, 200);
            assert_eq!(body["status"], "track added to queue");
        }

        let (status, body) = call(&client, Method::POST, format!("{}/remove-track/2", api), VALID_TOKEN).await;
        assert_eq!(status, 200);
        assert_eq!(body["total_tracks"], 2);

        let (status, body) = call(&client, Method::POST, format!("{}/set-current/3", api), VALID_TOKEN).await;
        assert_eq!(status, 200);
        assert_eq!(body["current_index"], 1);
        assert_eq!(body["auto_play"], true);

        let (status, body) = call(&client, Method::GET, format!("{}/current-track", api), VALID_TOKEN).await;
        assert_eq!(status, 200);
        assert_eq!(body["track"]["id"], 3);
        assert_eq!(body["order"], 1);

        let (_, body) = call(&client, Method::GET, format!("{}/current-queue", api), VALID_TOKEN).await;
        assert_eq!(body["tracks"][0]["track"]["title"], "Track 1");
        assert_eq!(body["tracks"][1]["order"], 1);

        // Queues are per user.
        let (_, body) = call(&client, Method::GET, format!("{}/current-queue", api), OTHER_TOKEN).await;
        assert_eq!(body["total_tracks"], 0);

        let (status, _) = call(&client, Method::POST, format!("{}/add-playlist/20", api), VALID_TOKEN).await;
        assert_eq!(status, 200);
        let (status, _) = call(&client, Method::POST, format!("{}/add-album/10", api), VALID_TOKEN).await;
        assert_eq!(status, 200);

        let (status, body) = call(&client, Method::POST, format!("{}/clear", api), VALID_TOKEN).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "queue cleared");

        let (status, body) = call(&client, Method::GET, format!("{}/current-track", api), VALID_TOKEN).await;
        assert_eq!(status, 404);
        assert_eq!(body["type"], "NotFound");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let base = spawn_server().await;
        let api = format!("{}/api/queue", base);
        let client = reqwest::Client::new();
        use reqwest::Method;

        let (status, _) = call(&client, Method::POST, format!("{}/add-track/999", api), VALID_TOKEN).await;
        assert_eq!(status, 404);
        let (status, _) = call(&client, Method::POST, format!("{}/add-album/404", api), VALID_TOKEN).await;
        assert_eq!(status, 404);
        let (status, body) = call(&client, Method::POST, format!("{}/add-track/abc", api), VALID_TOKEN).await;
        assert_eq!(status, 400);
        assert_eq!(body["type"], "Validation");
        let (status, _) = call(&client, Method::POST, format!("{}/add-track/1", api), "bogus").await;
        assert_eq!(status, 401);

        let health = client.get(format!("{}/health", base)).send().await.unwrap();
        assert_eq!(health.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_socket_receives_queue_updates() {
        let (addr, services) = spawn_app().await;
        let mut socket = open_socket(addr, &format!("?token={}", VALID_TOKEN)).await;
        wait_for_subscribers(&services, USER_ID, 1).await;

        services.queue.add_track(USER_ID, 1).await.unwrap();
        let update = next_json(&mut socket).await;
        assert_eq!(update["type"], "queue_update");
        assert_eq!(update["queue"]["total_tracks"], 1);
        assert_eq!(update["queue"]["tracks"][0]["track"]["id"], 1);

        services.queue.set_current(USER_ID, 1).await.unwrap();
        let update = next_json(&mut socket).await;
        assert_eq!(update["auto_play"], true);

        socket
            .send(WsMessage::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut socket).await["type"], "pong");

        socket
            .send(WsMessage::Text(r#"{"type":"get_queue"}"#.into()))
            .await
            .unwrap();
        let reply = next_json(&mut socket).await;
        assert_eq!(reply["type"], "queue_update");
        assert_eq!(reply["queue"]["current_index"], 0);

        // Hanging up leaves the group right away.
        socket.close(None).await.unwrap();
        wait_for_subscribers(&services, USER_ID, 0).await;
    }

    #[tokio::test]
    async fn test_socket_without_credentials_is_closed_with_4001() {
        let (addr, services) = spawn_app().await;

        let mut socket = open_socket(addr, "").await;
        assert_eq!(close_code(&mut socket).await, 4001);

        let mut socket = open_socket(addr, "?token=bogus").await;
        assert_eq!(close_code(&mut socket).await, 4001);
        assert_eq!(services.broadcaster.subscriber_count(USER_ID), 0);
    }

    #[tokio::test]
    async fn test_socket_is_closed_with_4003_when_credentials_cannot_be_checked() {
        let (addr, services) = spawn_app().await;
        services.store.pool().close().await;

        let mut socket = open_socket(addr, &format!("?token={}", VALID_TOKEN)).await;
        assert_eq!(close_code(&mut socket).await, 4003);
        assert_eq!(services.broadcaster.subscriber_count(USER_ID), 0);
    }
}
