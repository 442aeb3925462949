use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/**
 * \brief 中继错误分类，边界处统一映射为 HTTP 响应。
 */
#[derive(Debug, Error)]
pub enum RelayError {
    /** \brief 输入缺失或非法（400）。 */
    #[error("{0}")]
    Validation(String),

    /** \brief 请求与环境均无可用密钥（401，提示用户填写）。 */
    #[error("API key not configured for {provider}")]
    Credential { provider: String },

    /** \brief Provider 拒绝请求（密钥错误、模型不存在等）。 */
    #[error("upstream request failed: {status} -> {body}")]
    Upstream { status: u16, body: String },

    /** \brief 网络或连接故障，可能发生在流中途。 */
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    /** \brief 请求体无法解析。 */
    #[error("invalid request body: {0}")]
    Body(#[from] serde_json::Error),
}

impl RelayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Credential { .. } => StatusCode::UNAUTHORIZED,
            Self::Upstream { .. } | Self::Transport(_) | Self::Body(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Validation(message) => json!({ "error": message }),
            Self::Credential { .. } => json!({ "error": self.to_string(), "needsKey": true }),
            _ => json!({ "error": self.to_string(), "details": format!("{:?}", self) }),
        };
        (status, Json(body)).into_response()
    }
}
