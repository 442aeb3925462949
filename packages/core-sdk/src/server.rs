use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, get_service, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Serialize;
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::{
    config::{ServerConfig, UpstreamUrls},
    error::RelayError,
    llm,
    models::RelayRequest,
    providers::{resolve_credential, CredentialSource, EnvCredentials, ProviderId},
    sse, telemetry,
};

/**
 * \brief 中继共享状态；请求之间不共享可变数据。
 */
#[derive(Clone)]
pub struct AppState {
    /** \brief 共享连接池，不设超时 */
    pub http: reqwest::Client,
    pub credentials: Arc<dyn CredentialSource>,
    pub upstreams: UpstreamUrls,
}

impl AppState {
    pub fn new(credentials: Arc<dyn CredentialSource>, upstreams: UpstreamUrls) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            upstreams,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(Arc::new(EnvCredentials), config.upstreams.clone())
    }
}

/**
 * \brief 启动本地 HTTP 服务，提供中继接口与静态前端。
 */
pub async fn run(config: ServerConfig) -> Result<()> {
    let state = AppState::from_config(&config);
    let app = router(state, &config.ui_dir);

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    tracing::info!(addr = %config.addr, ui_dir = %config.ui_dir, "relay listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief 构建路由；未匹配的路径回退到静态目录。
 */
pub fn router(state: AppState, ui_dir: &str) -> Router {
    let static_service = get_service(ServeDir::new(ui_dir).append_index_html_on_directories(true));

    Router::new()
        .route("/chat/{provider}", post(chat))
        .route("/api/chat/{provider}", post(chat))
        .route("/api/providers", get(list_providers))
        .route("/api/health", get(health_check))
        .fallback_service(static_service)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/**
 * \brief 聊天中继：POST /chat/{provider}，返回 SSE 片段流或结构化错误。
 */
async fn chat(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    body: Bytes,
) -> Response {
    match relay(&state, &provider, &body).await {
        Ok(resp) => resp,
        Err(err) => {
            if err.status().is_server_error() {
                telemetry::log_error("server.chat", &format!("provider={} {:?}", provider, err));
            } else {
                tracing::warn!(provider = %provider, status = %err.status(), error = %err, "relay rejected");
            }
            err.into_response()
        }
    }
}

/**
 * \brief 单次请求的状态机：解析 → 校验 → 取密钥 → 定模型 → 分发。
 */
pub async fn relay(state: &AppState, provider: &str, body: &[u8]) -> Result<Response, RelayError> {
    let request: RelayRequest = serde_json::from_slice(body)?;

    let messages = request
        .messages
        .filter(|m| !m.is_empty())
        .ok_or_else(|| RelayError::validation("Messages are required"))?;

    let provider: ProviderId = provider
        .parse()
        .map_err(|_| RelayError::validation("Invalid provider"))?;

    let (api_key, origin) =
        resolve_credential(provider, request.api_key.as_deref(), state.credentials.as_ref())
            .ok_or_else(|| RelayError::Credential {
                provider: provider.to_string(),
            })?;

    let model = request
        .model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| provider.config().default_model.to_string());
    let base_url = state.upstreams.base_url(provider);

    telemetry::log_event(
        "server.chat",
        &format!(
            "provider={} model={} msgs={} key_source={}",
            provider,
            model,
            messages.len(),
            origin.as_str()
        ),
    );

    let fragments =
        llm::stream_chat(&state.http, provider, &base_url, &messages, &model, &api_key).await?;
    let fragments = fragments.inspect(move |item| {
        if let Err(err) = item {
            telemetry::log_error(
                "server.chat",
                &format!("stream aborted provider={}: {}", provider, err),
            );
        }
    });

    Ok(sse::event_stream_response(fragments))
}

#[derive(Serialize, Debug)]
struct ProviderItem {
    id: ProviderId,
    default_model: &'static str,
    credential_env: &'static str,
    has_server_key: bool,
}

/**
 * \brief 列出注册表，仅暴露服务端密钥是否存在。
 */
async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderItem>> {
    let items = ProviderId::ALL
        .iter()
        .map(|id| {
            let config = id.config();
            ProviderItem {
                id: *id,
                default_model: config.default_model,
                credential_env: config.credential_env,
                has_server_key: state.credentials.lookup(config.credential_env).is_some(),
            }
        })
        .collect();
    Json(items)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}
