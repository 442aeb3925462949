use serde::{Deserialize, Serialize};

/**
 * \brief 消息角色，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/**
 * \brief 单条消息；发送后不可变，助手消息在流式过程中被整体替换。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/**
 * \brief 有序对话历史；顺序即传给 Provider 的上下文顺序。
 */
pub type Conversation = Vec<Message>;

/**
 * \brief 适配器产出的最小输出单元，顺序不可变、不去重。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFragment {
    pub text: String,
}

impl StreamFragment {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/**
 * \brief 中继请求体：`POST /chat/{provider}`。
 * \details `messages` 缺省时按空处理，由中继返回 400。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Conversation>,
    /** \brief 模型名，缺省取 Provider 默认模型 */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /** \brief 调用方提供的密钥，缺省回退到服务端环境变量 */
    #[serde(default, rename = "apiKey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/**
 * \brief SSE 事件负载 `{"content": "..."}`。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEvent {
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_request_uses_camel_case_api_key() {
        let req: RelayRequest = serde_json::from_str(
            r#"{"messages":[{"role":"user","content":"hi"}],"apiKey":"k"}"#,
        )
        .expect("parse request");
        assert_eq!(req.api_key.as_deref(), Some("k"));
        assert_eq!(req.messages.unwrap(), vec![Message::user("hi")]);
        assert!(req.model.is_none());
    }

    #[test]
    fn unknown_role_is_rejected() {
        let parsed = serde_json::from_str::<Message>(r#"{"role":"tool","content":"x"}"#);
        assert!(parsed.is_err());
    }
}
