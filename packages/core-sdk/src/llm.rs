use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Serialize;
use serde_json::{json, Value};
use std::pin::Pin;

use crate::error::RelayError;
use crate::models::{Message, Role, StreamFragment};
use crate::providers::{AdapterKind, ProviderId};

/** \brief Gemini SDK 默认地址。 */
pub const GEMINI_DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
/** \brief OpenAI SDK 默认地址，Provider 未配置基地址时使用。 */
pub const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";

/**
 * \brief 惰性片段流：消费方逐个拉取，丢弃即取消上游读取。
 */
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<StreamFragment, RelayError>> + Send>>;

/**
 * \brief 适配器内置的默认地址。
 */
pub fn adapter_default_base(kind: AdapterKind) -> &'static str {
    match kind {
        AdapterKind::TurnBased => GEMINI_DEFAULT_BASE,
        AdapterKind::DeltaStreaming => OPENAI_DEFAULT_BASE,
    }
}

/**
 * \brief 以统一接口返回上游片段流，按 Provider 选择适配器。
 * \details 上游拒绝（非 2xx）在返回流之前即报错；流中途的故障通过流项报告。
 */
pub async fn stream_chat(
    client: &reqwest::Client,
    provider: ProviderId,
    base_url: &str,
    messages: &[Message],
    model: &str,
    api_key: &str,
) -> Result<FragmentStream, RelayError> {
    match provider.adapter_kind() {
        AdapterKind::TurnBased => {
            let (history, current) = split_history(messages)
                .ok_or_else(|| RelayError::validation("Messages are required"))?;
            let mut session = ChatSession::start(client.clone(), base_url, model, api_key, history);
            session.send_message_stream(&current).await
        }
        AdapterKind::DeltaStreaming => {
            if messages.is_empty() {
                return Err(RelayError::validation("Messages are required"));
            }
            stream_openai_compatible(client, base_url, model, api_key, messages).await
        }
    }
}

/**
 * \brief OpenAI 兼容接口：整段历史一次发送，逐块转发非空 delta。
 */
pub async fn stream_openai_compatible(
    client: &reqwest::Client,
    base_url: &str,
    model: &str,
    api_key: &str,
    messages: &[Message],
) -> Result<FragmentStream, RelayError> {
    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
    let body = json!({
        "model": model,
        "messages": messages,
        "stream": true
    });

    let resp = client
        .post(url)
        .header(AUTHORIZATION, format!("Bearer {}", api_key))
        .header(ACCEPT, "text/event-stream")
        .json(&body)
        .send()
        .await?;
    let resp = ensure_success(resp).await?;

    let mut payloads = Box::pin(data_payloads(resp));
    let out = try_stream! {
        while let Some(payload) = payloads.next().await {
            let payload = payload?;
            let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                tracing::debug!(payload = %payload, "skip non-json upstream chunk");
                continue;
            };
            if let Some(err) = upstream_error(&value) {
                Err::<(), RelayError>(err)?;
            }
            if let Some(delta) = parse_openai_delta(&value) {
                if !delta.is_empty() {
                    yield StreamFragment::new(delta);
                }
            }
        }
    };

    Ok(Box::pin(out))
}

/**
 * \brief Gemini 会话条目。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeminiContent {
    pub role: &'static str,
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeminiPart {
    pub text: String,
}

impl GeminiContent {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user",
            parts: vec![GeminiPart { text: text.into() }],
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: "model",
            parts: vec![GeminiPart { text: text.into() }],
        }
    }
}

/**
 * \brief 拆分为历史（除最后一条）与本轮输入（最后一条）。
 * \details 仅 assistant 映射为 model，其余角色一律按 user 处理。
 */
pub fn split_history(messages: &[Message]) -> Option<(Vec<GeminiContent>, String)> {
    let (last, rest) = messages.split_last()?;
    let history = rest
        .iter()
        .map(|msg| match msg.role {
            Role::Assistant => GeminiContent::model(msg.content.clone()),
            Role::User | Role::System => GeminiContent::user(msg.content.clone()),
        })
        .collect();
    Some((history, last.content.clone()))
}

/**
 * \brief 有状态的 Gemini 多轮会话，以历史初始化。
 */
#[derive(Debug, Clone)]
pub struct ChatSession {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    history: Vec<GeminiContent>,
}

impl ChatSession {
    pub fn start(
        client: reqwest::Client,
        base_url: &str,
        model: &str,
        api_key: &str,
        history: Vec<GeminiContent>,
    ) -> Self {
        Self {
            client,
            base_url: normalize_gemini_base(base_url),
            model: model.to_string(),
            api_key: api_key.to_string(),
            history,
        }
    }

    pub fn history(&self) -> &[GeminiContent] {
        &self.history
    }

    /**
     * \brief 发送本轮输入，返回逐块文本流；上游接受后本轮计入会话历史。
     */
    pub async fn send_message_stream(&mut self, text: &str) -> Result<FragmentStream, RelayError> {
        let turn = GeminiContent::user(text);
        let mut contents = self.history.clone();
        contents.push(turn.clone());

        let url = format!("{}/models/{}:streamGenerateContent", self.base_url, self.model);
        let resp = self
            .client
            .post(url)
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&json!({ "contents": contents }))
            .send()
            .await?;
        let resp = ensure_success(resp).await?;
        self.history.push(turn);

        let mut payloads = Box::pin(data_payloads(resp));
        let out = try_stream! {
            while let Some(payload) = payloads.next().await {
                let payload = payload?;
                let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                    tracing::debug!(payload = %payload, "skip non-json gemini chunk");
                    continue;
                };
                if let Some(err) = upstream_error(&value) {
                    Err::<(), RelayError>(err)?;
                }
                yield StreamFragment::new(extract_gemini_text(&value));
            }
        };

        Ok(Box::pin(out))
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, RelayError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(RelayError::Upstream {
        status: status.as_u16(),
        body,
    })
}

/**
 * \brief 将上游 SSE 字节流切分为 `data:` 负载；遇到 `[DONE]` 即结束。
 */
fn data_payloads(
    resp: reqwest::Response,
) -> impl Stream<Item = Result<String, RelayError>> + Send + 'static {
    let mut body = resp.bytes_stream();
    try_stream! {
        let mut buf = Vec::<u8>::new();
        let mut scanned = 0;
        let mut finished = false;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            buf.extend_from_slice(&chunk);
            while let Some((pos, sep)) = find_block_end(&buf, scanned) {
                let block = buf.drain(..pos + sep).collect::<Vec<u8>>();
                scanned = 0;
                if let Some(data) = extract_data(&block) {
                    if data.trim() == "[DONE]" {
                        finished = true;
                        break;
                    }
                    yield data;
                }
            }
            if finished {
                break;
            }
            scanned = buf.len();
        }
        if !finished && !buf.is_empty() {
            if let Some(data) = extract_data(&buf) {
                if data.trim() != "[DONE]" {
                    yield data;
                }
            }
        }
    }
}

/**
 * \brief 查找首个空行分隔符，返回 (位置, 分隔符长度)。
 * \details `from` 之前的字节已确认不含完整分隔符，只回退 3 字节以覆盖跨块的分隔符。
 */
fn find_block_end(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let start = from.min(buf.len()).saturating_sub(3);
    let tail = &buf[start..];
    let lf = tail.windows(2).position(|w| w == b"\n\n").map(|p| (start + p, 2));
    let crlf = tail
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (start + p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn extract_data(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest).trim_end_matches('\r'))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn parse_openai_delta(v: &Value) -> Option<String> {
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

fn extract_gemini_text(v: &Value) -> String {
    v.get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn upstream_error(v: &Value) -> Option<RelayError> {
    let err = v.get("error")?;
    if err.is_null() {
        return None;
    }
    let status = err
        .get("code")
        .and_then(|c| c.as_u64())
        .and_then(|c| u16::try_from(c).ok())
        .unwrap_or(500);
    Some(RelayError::Upstream {
        status,
        body: err.to_string(),
    })
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn collect(stream: FragmentStream) -> (Vec<String>, Option<RelayError>) {
        let mut stream = stream;
        let mut texts = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(fragment) => texts.push(fragment.text),
                Err(e) => return (texts, Some(e)),
            }
        }
        (texts, None)
    }

    #[test]
    fn history_translates_roles_and_keeps_last_turn() {
        let messages = vec![
            Message::user("a"),
            Message::assistant("b"),
            Message::user("c"),
        ];
        let (history, current) = split_history(&messages).expect("non-empty");
        assert_eq!(history, vec![GeminiContent::user("a"), GeminiContent::model("b")]);
        assert_eq!(current, "c");
        assert!(split_history(&[]).is_none());
    }

    #[test]
    fn single_message_has_empty_history() {
        let (history, current) = split_history(&[Message::user("hello")]).expect("non-empty");
        assert!(history.is_empty());
        assert_eq!(current, "hello");
    }

    #[test]
    fn block_boundaries_accept_crlf() {
        assert_eq!(find_block_end(b"data: x\n\nrest", 0), Some((7, 2)));
        assert_eq!(find_block_end(b"data: x\r\n\r\n", 0), Some((7, 4)));
        assert_eq!(find_block_end(b"data: x\n", 0), None);
    }

    #[test]
    fn block_search_resumes_near_scanned_offset() {
        // 分隔符横跨已扫描区域的末尾
        assert_eq!(find_block_end(b"data: x\r\n\r\n", 9), Some((7, 4)));
        assert_eq!(find_block_end(b"data: x\n\n", 8), Some((7, 2)));
        // 已扫描区域之前的分隔符不再被查找
        assert_eq!(find_block_end(b"a\n\nbbbbbbbb", 12), None);
        assert_eq!(find_block_end(b"data", 10), None);
    }

    #[tokio::test]
    async fn event_split_across_many_chunks_is_reassembled() {
        let upstream = MockServer::start().await;
        let long = "x".repeat(4096);
        let sse = format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{}\"}}}}]}}\r\n\r\ndata: [DONE]\r\n\r\n",
            long
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&upstream)
            .await;

        let client = reqwest::Client::new();
        let stream = stream_openai_compatible(
            &client,
            &upstream.uri(),
            "m",
            "k",
            &[Message::user("hi")],
        )
        .await
        .expect("stream opens");
        let (texts, err) = collect(stream).await;
        assert!(err.is_none());
        assert_eq!(texts, vec![long]);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = reqwest::Client::new();
        let err = match stream_chat(
            &client,
            ProviderId::Groq,
            &format!("http://{}", addr),
            &[Message::user("hi")],
            "m",
            "k",
        )
        .await
        {
            Ok(_) => panic!("connection should be refused"),
            Err(err) => err,
        };
        assert!(matches!(err, RelayError::Transport(_)));
        assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn data_lines_are_joined() {
        assert_eq!(extract_data(b"event: m\ndata: a\ndata: b"), Some("a\nb".into()));
        assert_eq!(extract_data(b": keep-alive"), None);
    }

    #[test]
    fn gemini_text_concatenates_parts() {
        let v = json!({"candidates":[{"content":{"parts":[{"text":"Hel"},{"text":"lo"}]}}]});
        assert_eq!(extract_gemini_text(&v), "Hello");
        assert_eq!(extract_gemini_text(&json!({"usageMetadata":{}})), "");
    }

    #[test]
    fn gemini_base_gets_version_suffix() {
        assert_eq!(
            normalize_gemini_base("http://localhost:9000/"),
            "http://localhost:9000/v1beta"
        );
        assert_eq!(normalize_gemini_base(GEMINI_DEFAULT_BASE), GEMINI_DEFAULT_BASE);
    }

    #[tokio::test]
    async fn delta_stream_forwards_non_empty_deltas() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/openai/v1/chat/completions"))
            .and(header("authorization", "Bearer gsk-test"))
            .and(body_partial_json(json!({
                "model": "llama-3.3-70b-versatile",
                "stream": true,
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let base = format!("{}/openai/v1", server.uri());
        let stream = stream_chat(
            &client,
            ProviderId::Groq,
            &base,
            &[Message::user("hello")],
            "llama-3.3-70b-versatile",
            "gsk-test",
        )
        .await
        .expect("stream opens");
        let (texts, err) = collect(stream).await;
        assert!(err.is_none());
        assert_eq!(texts, vec!["Hi", " there"]);
    }

    #[tokio::test]
    async fn delta_stream_rejection_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"error": {"message": "Invalid API Key"}})),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = stream_openai_compatible(
            &client,
            &server.uri(),
            "deepseek-chat",
            "bad",
            &[Message::user("hi")],
        )
        .await;
        match result {
            Err(RelayError::Upstream { status, body }) => {
                assert_eq!(status, 401);
                assert!(body.contains("Invalid API Key"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn error_payload_mid_stream_ends_with_error() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n",
            "data: {\"error\":{\"message\":\"overloaded\",\"code\":503}}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let stream = stream_openai_compatible(
            &client,
            &server.uri(),
            "deepseek-chat",
            "k",
            &[Message::user("hi")],
        )
        .await
        .expect("stream opens");
        let (texts, err) = collect(stream).await;
        assert_eq!(texts, vec!["partial"]);
        assert!(matches!(err, Some(RelayError::Upstream { status: 503, .. })));
    }

    #[tokio::test]
    async fn turn_based_sends_history_and_current_turn() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hel\"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"lo\"}]}}]}\r\n\r\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-1.5-flash:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .and(query_param("key", "g-key"))
            .and(body_partial_json(json!({
                "contents": [
                    {"role": "user", "parts": [{"text": "a"}]},
                    {"role": "model", "parts": [{"text": "b"}]},
                    {"role": "user", "parts": [{"text": "c"}]}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let messages = vec![
            Message::user("a"),
            Message::assistant("b"),
            Message::user("c"),
        ];
        let stream = stream_chat(
            &client,
            ProviderId::Gemini,
            &server.uri(),
            &messages,
            "gemini-1.5-flash",
            "g-key",
        )
        .await
        .expect("stream opens");
        let (texts, err) = collect(stream).await;
        assert!(err.is_none());
        assert_eq!(texts, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn session_records_accepted_turn() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ok\"}]}}]}\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let mut session = ChatSession::start(
            reqwest::Client::new(),
            &server.uri(),
            "gemini-1.5-flash",
            "k",
            vec![GeminiContent::user("earlier")],
        );
        let stream = session.send_message_stream("now").await.expect("stream opens");
        assert_eq!(
            session.history(),
            &[GeminiContent::user("earlier"), GeminiContent::user("now")]
        );
        let (texts, _) = collect(stream).await;
        assert_eq!(texts, vec!["ok"]);
    }

    #[tokio::test]
    async fn empty_conversation_is_rejected_before_any_request() {
        let client = reqwest::Client::new();
        let result = stream_chat(
            &client,
            ProviderId::Gemini,
            "http://127.0.0.1:9",
            &[],
            "m",
            "k",
        )
        .await;
        assert!(matches!(result, Err(RelayError::Validation(_))));
    }
}
