use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;

use crate::models::{ContentEvent, Message, RelayRequest};
use crate::providers::ProviderId;
use crate::sse::DONE_SENTINEL;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/**
 * \brief 客户端错误；解析失败的片段被静默丢弃，不在此列。
 */
#[derive(Debug, Error)]
pub enum ClientError {
    /** \brief 中继在流开始前返回非成功状态。 */
    #[error("{message}")]
    Rejected {
        status: u16,
        message: String,
        needs_key: bool,
    },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /** \brief 流读取中途失败。 */
    #[error("stream interrupted: {0}")]
    Transport(#[source] BoxError),

    #[error("message is empty")]
    EmptyPrompt,
}

impl ClientError {
    /** \brief 是否需要用户补充密钥。 */
    pub fn needs_key(&self) -> bool {
        matches!(self, ClientError::Rejected { needs_key: true, .. })
    }
}

/**
 * \brief 增量 SSE 解码器：跨块保留未完成的多字节序列与未完成的行。
 */
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending_bytes: Vec<u8>,
    pending_line: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 输入一个字节块，返回其中已完整的行（不含换行符）。
     */
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending_bytes.extend_from_slice(chunk);
        let text = self.decode_available();
        self.pending_line.push_str(&text);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending_line.find('\n') {
            let line: String = self.pending_line.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /**
     * \brief 流结束时取出残余内容。
     */
    pub fn finish(&mut self) -> Vec<String> {
        if !self.pending_bytes.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending_bytes).into_owned();
            self.pending_line.push_str(&tail);
            self.pending_bytes.clear();
        }
        let rest = std::mem::take(&mut self.pending_line);
        rest.lines().map(|l| l.to_string()).collect()
    }

    fn decode_available(&mut self) -> String {
        let mut out = String::new();
        let mut consumed = 0;
        loop {
            let remaining = &self.pending_bytes[consumed..];
            match std::str::from_utf8(remaining) {
                Ok(valid) => {
                    out.push_str(valid);
                    consumed = self.pending_bytes.len();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    // valid_up_to 之前的字节已校验为合法 UTF-8。
                    out.push_str(&String::from_utf8_lossy(&remaining[..valid_up_to]));
                    consumed += valid_up_to;
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed += len;
                        }
                        None => break,
                    }
                }
            }
        }
        self.pending_bytes.drain(..consumed);
        out
    }
}

/**
 * \brief 单行解析结果。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Fragment(String),
    Done,
    /** \brief 非 data 行或无法解析的负载 */
    Ignored,
}

pub fn parse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data: ") else {
        return SseLine::Ignored;
    };
    if data == DONE_SENTINEL {
        return SseLine::Done;
    }
    match serde_json::from_str::<ContentEvent>(data) {
        Ok(event) => SseLine::Fragment(event.content),
        Err(err) => {
            tracing::debug!(line = %line, error = %err, "skip malformed fragment");
            SseLine::Ignored
        }
    }
}

/**
 * \brief 单轮流式状态：已有对话与累积中的助手文本，按值在读取循环中传递。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnState {
    conversation_so_far: Vec<Message>,
    in_progress_text: String,
    started: bool,
}

impl TurnState {
    pub fn new(conversation_so_far: Vec<Message>) -> Self {
        Self {
            conversation_so_far,
            in_progress_text: String::new(),
            started: false,
        }
    }

    /**
     * \brief 追加片段：首个片段新增助手消息，后续片段整体替换该消息。
     */
    pub fn apply_fragment(mut self, text: &str) -> Self {
        self.in_progress_text.push_str(text);
        let message = Message::assistant(self.in_progress_text.clone());
        if self.started {
            if let Some(last) = self.conversation_so_far.last_mut() {
                *last = message;
            }
        } else {
            self.conversation_so_far.push(message);
            self.started = true;
        }
        self
    }

    pub fn conversation(&self) -> &[Message] {
        &self.conversation_so_far
    }

    pub fn in_progress_text(&self) -> &str {
        &self.in_progress_text
    }

    pub fn into_conversation(self) -> Vec<Message> {
        self.conversation_so_far
    }

    /** \brief (消息数, 累积文本长度)，任一变化即视为有更新 */
    fn progress(&self) -> (usize, usize) {
        (self.conversation_so_far.len(), self.in_progress_text.len())
    }
}

/**
 * \brief 处理一个字节块；返回新状态以及是否已遇到哨兵。
 * \details 遇到哨兵后同一块中的剩余行被丢弃。
 */
pub fn apply_chunk(state: TurnState, decoder: &mut SseDecoder, chunk: &[u8]) -> (TurnState, bool) {
    apply_lines(state, decoder.push(chunk))
}

fn apply_lines(mut state: TurnState, lines: Vec<String>) -> (TurnState, bool) {
    for line in lines {
        match parse_line(&line) {
            SseLine::Done => return (state, true),
            SseLine::Fragment(text) => state = state.apply_fragment(&text),
            SseLine::Ignored => {}
        }
    }
    (state, false)
}

/**
 * \brief 读取响应体直至哨兵或流结束，每次状态变化回调一次。
 */
pub async fn consume<S, E>(
    mut state: TurnState,
    body: S,
    mut on_update: impl FnMut(&TurnState),
) -> Result<TurnState, ClientError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<BoxError>,
{
    let mut body = Box::pin(body);
    let mut decoder = SseDecoder::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| ClientError::Transport(e.into()))?;
        let before = state.progress();
        let (next, done) = apply_chunk(state, &mut decoder, &chunk);
        state = next;
        if state.progress() != before {
            on_update(&state);
        }
        if done {
            return Ok(state);
        }
    }
    let before = state.progress();
    let (next, _) = apply_lines(state, decoder.finish());
    state = next;
    if state.progress() != before {
        on_update(&state);
    }
    Ok(state)
}

/**
 * \brief 中继客户端。
 */
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /**
     * \brief 发起请求并返回响应字节流；非成功状态解析为 `Rejected`。
     */
    pub async fn open(
        &self,
        provider: ProviderId,
        request: &RelayRequest,
    ) -> Result<impl Stream<Item = reqwest::Result<Bytes>>, ClientError> {
        let url = format!("{}/chat/{}", self.base_url, provider);
        let resp = self.http.post(url).json(request).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            let message = body
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("Failed to get response")
                .to_string();
            let needs_key = body
                .get("needsKey")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            return Err(ClientError::Rejected {
                status,
                message,
                needs_key,
            });
        }
        Ok(resp.bytes_stream())
    }
}

/**
 * \brief 失败的一轮：携带本轮之前的对话，调用方据此回滚。
 */
#[derive(Debug, Error)]
#[error("{source}")]
pub struct TurnError {
    pub conversation: Vec<Message>,
    #[source]
    pub source: ClientError,
}

/**
 * \brief 一轮请求的参数。
 */
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    pub model: Option<String>,
    pub api_key: Option<String>,
}

/**
 * \brief 发送一轮：先乐观追加用户消息，再流式累积助手回复。
 * \details 成功返回完整对话；任何失败都返回本轮之前的对话，不保留半截轮次。
 */
pub async fn run_turn(
    client: &ChatClient,
    provider: ProviderId,
    conversation: Vec<Message>,
    prompt: &str,
    options: &TurnOptions,
    on_update: impl FnMut(&TurnState),
) -> Result<Vec<Message>, TurnError> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(TurnError {
            conversation,
            source: ClientError::EmptyPrompt,
        });
    }

    let mut with_user = conversation.clone();
    with_user.push(Message::user(prompt));
    let request = RelayRequest {
        messages: Some(with_user.clone()),
        model: options.model.clone(),
        api_key: options.api_key.clone(),
    };

    let outcome = async {
        let body = client.open(provider, &request).await?;
        consume(TurnState::new(with_user), body, on_update).await
    }
    .await;

    match outcome {
        Ok(state) => Ok(state.into_conversation()),
        Err(source) => {
            tracing::warn!(provider = %provider, error = %source, "turn aborted, rolling back");
            Err(TurnError {
                conversation,
                source,
            })
        }
    }
}
