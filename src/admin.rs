use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::engine::NewTemplate;
use crate::error::Error;
use crate::router::{self, Envelope};
use crate::types::{Manager, NewTask, TaskView};

/// Admin failures surface as `500 { status, error }`; the error kind rides
/// along for programmatic callers.
#[derive(Debug)]
struct AdminError(Error);

type AdminResult<T> = std::result::Result<T, AdminError>;

impl From<Error> for AdminError {
    fn from(e: Error) -> Self {
        AdminError(e)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": self.0.kind(),
            "error": self.0.to_string(),
        });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

/// Serves the HTTP transport (`POST /message`) and, when configured, the
/// read-mostly admin surface on the same port.
pub async fn serve_http(manager: Arc<Manager>) {
    let port = manager.config.http_port;
    let mut app = Router::new().route("/message", post(message_handler));
    if manager.config.with_admin {
        app = app
            .route("/", get(status_handler))
            .route("/task", post(task_handler))
            .route("/template/register", post(template_handler))
            .route("/tasks/{template_id}", get(tasks_by_template_handler))
            .route("/access-code", post(access_code_handler));
    }
    let app = app.with_state(manager);

    let listener = match TcpListener::bind(format!("0.0.0.0:{port}")).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind HTTP transport to port {}: {}", port, e);
            return;
        }
    };
    info!("HTTP transport listening on port {}", port);

    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
        error!("HTTP transport failed: {}", e);
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    peer_id: String,
    version: String,
    is_started: bool,
    start_time: i64,
    cycle: u64,
    require_access_codes: bool,
    announced_addresses: Vec<String>,
    public_key: Option<String>,
    connected_peers: Vec<String>,
}

async fn status_handler(
    State(manager): State<Arc<Manager>>,
) -> AdminResult<Json<StatusResponse>> {
    let connected_peers = manager.registry.lock().await.connected_peers()?;
    Ok(Json(StatusResponse {
        peer_id: manager.peer_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        is_started: !manager.control.is_stopping(),
        start_time: manager.started_at,
        cycle: manager.control.get_cycle(),
        require_access_codes: manager.config.require_access_codes,
        announced_addresses: manager.config.announce.clone(),
        public_key: manager.public_key.clone(),
        connected_peers,
    }))
}

/// Provider task ingest. The admin surface acts as the provider peer.
async fn task_handler(
    State(manager): State<Arc<Manager>>,
    Json(task): Json<NewTask>,
) -> AdminResult<Json<serde_json::Value>> {
    manager
        .engine
        .lock()
        .await
        .create_task(task, &"admin".to_string())?;
    manager.control.nudge();
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterTemplateBody {
    template: NewTemplate,
    provider_peer_id_str: String,
}

async fn template_handler(
    State(manager): State<Arc<Manager>>,
    Json(body): Json<RegisterTemplateBody>,
) -> AdminResult<Json<serde_json::Value>> {
    let id = router::register_template(&manager, body.template, &body.provider_peer_id_str).await?;
    Ok(Json(serde_json::json!({ "id": id })))
}

async fn tasks_by_template_handler(
    State(manager): State<Arc<Manager>>,
    Path(template_id): Path<String>,
) -> AdminResult<Json<Vec<TaskView>>> {
    let views = manager.engine.lock().await.tasks_by_template(&template_id)?;
    Ok(Json(views))
}

/// Mints one single-use access code into the onboarding whitelist.
async fn access_code_handler(
    State(manager): State<Arc<Manager>>,
) -> AdminResult<Json<serde_json::Value>> {
    let code = hex::encode(rand::thread_rng().gen::<[u8; 16]>());
    manager.store.insert_access_code(&code)?;
    Ok(Json(serde_json::json!({ "code": code })))
}

/// The HTTP transport: one framed message in, the reply frame out. Errors
/// come back as typed error envelopes, exactly like on the WebSocket side.
async fn message_handler(
    State(manager): State<Arc<Manager>>,
    headers: HeaderMap,
    Json(envelope): Json<Envelope>,
) -> Json<Envelope> {
    let Some(peer_id) = headers
        .get("x-peer-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
    else {
        return Json(Envelope::from_error(&Error::Transport(
            "missing x-peer-id header".to_string(),
        )));
    };

    match router::handle_message(&manager, &peer_id, envelope).await {
        Ok(Some(reply)) => Json(reply),
        Ok(None) => Json(Envelope::Ack),
        Err(e) => Json(Envelope::from_error(&e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::test_support::test_manager;
    use crate::types::Recipient;

    async fn register_template(manager: &Arc<Manager>) {
        template_handler(
            State(manager.clone()),
            Json(RegisterTemplateBody {
                template: NewTemplate {
                    template_id: "tpl1".to_string(),
                    name: "labeling".to_string(),
                    schema: None,
                },
                provider_peer_id_str: "provider-1".to_string(),
            }),
        )
        .await
        .unwrap();
    }

    fn new_task(id: &str) -> NewTask {
        NewTask {
            id: id.to_string(),
            template_id: "tpl1".to_string(),
            title: format!("task {id}"),
            reward: 5,
            payload: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn status_reports_identity_and_cycle() {
        let manager = test_manager(true, 100).await;
        let Json(status) = status_handler(State(manager.clone())).await.unwrap();
        assert_eq!(status.peer_id, manager.peer_id);
        assert!(status.is_started);
        assert!(status.require_access_codes);
        assert_eq!(status.cycle, 0);
        assert!(status.connected_peers.is_empty());
    }

    #[tokio::test]
    async fn task_ingest_requires_known_template() {
        let manager = test_manager(false, 100).await;
        assert!(task_handler(State(manager.clone()), Json(new_task("t1")))
            .await
            .is_err());

        register_template(&manager).await;
        task_handler(State(manager.clone()), Json(new_task("t1")))
            .await
            .unwrap();

        let Json(views) =
            tasks_by_template_handler(State(manager.clone()), Path("tpl1".to_string()))
                .await
                .unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].task_id, "t1");
        assert_eq!(views[0].result, None);
    }

    #[tokio::test]
    async fn minted_access_code_admits_a_worker() {
        let manager = test_manager(true, 100).await;
        let Json(minted) = access_code_handler(State(manager.clone())).await.unwrap();
        let code = minted["code"].as_str().unwrap().to_string();

        manager
            .registry
            .lock()
            .await
            .onboard(&"w1".to_string(), Recipient([1; 32]), 0, Some(&code))
            .unwrap();
    }

    #[tokio::test]
    async fn message_endpoint_routes_with_peer_header() {
        let manager = test_manager(false, 100).await;

        let mut headers = HeaderMap::new();
        headers.insert("x-peer-id", "w1".parse().unwrap());
        let Json(reply) = message_handler(
            State(manager.clone()),
            headers,
            Json(Envelope::IdentifyRequest),
        )
        .await;
        assert!(matches!(reply, Envelope::IdentifyResponse { .. }));

        // Without the header the transport refuses the frame.
        let Json(reply) = message_handler(
            State(manager.clone()),
            HeaderMap::new(),
            Json(Envelope::IdentifyRequest),
        )
        .await;
        assert!(matches!(reply, Envelope::Error { .. }));
    }
}
