use async_stream::try_stream;
use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::Response,
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::error::RelayError;
use crate::models::{ContentEvent, StreamFragment};

/** \brief 终止哨兵。 */
pub const DONE_SENTINEL: &str = "[DONE]";

/**
 * \brief 编码单个片段：`data: {"content": ...}\n\n`。
 */
pub fn encode_fragment(text: &str) -> Bytes {
    let payload = ContentEvent {
        content: text.to_string(),
    };
    // 仅含一个 String 字段，序列化不会失败。
    let json = serde_json::to_string(&payload).unwrap_or_else(|_| String::from("{}"));
    Bytes::from(format!("data: {}\n\n", json))
}

pub fn encode_done() -> Bytes {
    Bytes::from(format!("data: {}\n\n", DONE_SENTINEL))
}

/**
 * \brief 将片段流封装为 SSE 字节流。
 * \details 正常结束追加一次哨兵；上游出错时以错误结束，不再输出任何事件。
 */
pub fn frame<S>(fragments: S) -> impl Stream<Item = Result<Bytes, RelayError>> + Send + 'static
where
    S: Stream<Item = Result<StreamFragment, RelayError>> + Send + 'static,
{
    let mut fragments = Box::pin(fragments);
    try_stream! {
        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            yield encode_fragment(&fragment.text);
        }
        yield encode_done();
    }
}

/**
 * \brief 构造事件流响应；响应体按需拉取，不预读上游。
 */
pub fn event_stream_response<S>(fragments: S) -> Response
where
    S: Stream<Item = Result<StreamFragment, RelayError>> + Send + 'static,
{
    let mut resp = Response::new(Body::from_stream(frame(fragments)));
    *resp.status_mut() = StatusCode::OK;
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    async fn run(items: Vec<Result<StreamFragment, RelayError>>) -> (String, bool) {
        let mut out = Box::pin(frame(stream::iter(items)));
        let mut text = String::new();
        let mut failed = false;
        while let Some(chunk) = out.next().await {
            match chunk {
                Ok(bytes) => text.push_str(std::str::from_utf8(&bytes).expect("utf-8")),
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        (text, failed)
    }

    #[test]
    fn fragment_encoding_escapes_json() {
        assert_eq!(
            encode_fragment("say \"hi\"\n"),
            Bytes::from_static(b"data: {\"content\":\"say \\\"hi\\\"\\n\"}\n\n")
        );
        assert_eq!(encode_done(), Bytes::from_static(b"data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn normal_end_appends_one_sentinel() {
        let (text, failed) = run(vec![
            Ok(StreamFragment::new("Hi")),
            Ok(StreamFragment::new(" there")),
        ])
        .await;
        assert!(!failed);
        assert_eq!(
            text,
            "data: {\"content\":\"Hi\"}\n\ndata: {\"content\":\" there\"}\n\ndata: [DONE]\n\n"
        );
        assert_eq!(text.matches("[DONE]").count(), 1);
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn empty_sequence_still_terminates() {
        let (text, failed) = run(vec![]).await;
        assert!(!failed);
        assert_eq!(text, "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn failure_omits_sentinel() {
        let (text, failed) = run(vec![
            Ok(StreamFragment::new("a")),
            Err(RelayError::Upstream {
                status: 500,
                body: "boom".into(),
            }),
            Ok(StreamFragment::new("b")),
        ])
        .await;
        assert!(failed);
        assert_eq!(text, "data: {\"content\":\"a\"}\n\n");
    }

    #[test]
    fn response_declares_event_stream() {
        let resp = event_stream_response(stream::iter(Vec::<Result<StreamFragment, RelayError>>::new()));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(resp.headers()[header::CONNECTION], "keep-alive");
    }
}
