//! Model gateway client.
//!
//! The gateway owns the model catalog (ids and per-token prices) and runs
//! completions. [`HttpGateway`] talks to an OpenAI-compatible endpoint and
//! turns its server-sent events into [`StreamPart`]s.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::time::Duration;

use crate::models::{Message, ModelInfo, Pricing, StreamPart, Usage};

pub type PartStream = BoxStream<'static, Result<StreamPart, GatewayError>>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode gateway payload: {0}")]
    Decode(String),

    #[error("gateway reported an error: {0}")]
    Upstream(String),
}

#[async_trait]
pub trait ModelGateway: Send + Sync + 'static {
    async fn available_models(&self) -> Result<Vec<ModelInfo>, GatewayError>;

    async fn stream(
        &self,
        model_id: &str,
        system: &str,
        messages: &[Message],
    ) -> Result<PartStream, GatewayError>;
}

// Look a model id up in the gateway's catalog
pub async fn find_model(
    gateway: &dyn ModelGateway,
    model_id: &str,
) -> Result<Option<ModelInfo>, GatewayError> {
    let models = gateway.available_models().await?;
    Ok(models.into_iter().find(|m| m.id == model_id))
}

pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpGateway {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<WireModel>,
}

#[derive(Deserialize)]
struct WireModel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    pricing: Option<WirePricing>,
}

#[derive(Deserialize)]
struct WirePricing {
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    output: Option<Value>,
}

// Prices come as decimal strings ("0.0000025") or plain numbers
// Per-token rate, only finite and non-negative values are usable
fn price(value: Option<&Value>) -> Option<f64> {
    let rate = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    (rate.is_finite() && rate >= 0.0).then_some(rate)
}

impl From<WireModel> for ModelInfo {
    fn from(wire: WireModel) -> Self {
        let pricing = wire.pricing.and_then(|p| {
            Some(Pricing {
                input: price(p.input.as_ref())?,
                output: price(p.output.as_ref())?,
            })
        });
        ModelInfo {
            id: wire.id,
            name: wire.name,
            pricing,
        }
    }
}

#[async_trait]
impl ModelGateway for HttpGateway {
    async fn available_models(&self) -> Result<Vec<ModelInfo>, GatewayError> {
        let req = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .timeout(Duration::from_secs(10));
        let res = self.authorize(req).send().await?;

        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(GatewayError::Status { status, body });
        }

        let list: ModelList = res
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok(list.data.into_iter().map(ModelInfo::from).collect())
    }

    async fn stream(
        &self,
        model_id: &str,
        system: &str,
        messages: &[Message],
    ) -> Result<PartStream, GatewayError> {
        let mut wire_messages = vec![json!({"role": "system", "content": system})];
        wire_messages.extend(
            messages
                .iter()
                .map(|m| json!({"role": m.role.as_str(), "content": m.plain_text()})),
        );

        let body = json!({
            "model": model_id,
            "stream": true,
            "stream_options": {"include_usage": true},
            "messages": wire_messages,
        });

        let req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body);
        let res = self.authorize(req).send().await?;

        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(GatewayError::Status { status, body });
        }

        Ok(parts_from_sse(Box::pin(res.bytes_stream())))
    }
}

// Incremental SSE framing, yields the `data:` payload of each complete event
#[derive(Default)]
pub struct SseDecoder {
    buffer: BytesMut,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((pos, delimiter_len)) = find_event_end(&self.buffer) {
            let event = self.buffer.split_to(pos);
            let _ = self.buffer.split_to(delimiter_len);
            if let Some(data) = event_data(&event) {
                events.push(data);
            }
        }
        events
    }
}

fn find_event_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut idx = 0;
    while idx + 1 < buf.len() {
        if buf[idx] == b'\n' && buf[idx + 1] == b'\n' {
            return Some((idx, 2));
        }
        if idx + 3 < buf.len() && &buf[idx..idx + 4] == b"\r\n\r\n" {
            return Some((idx, 4));
        }
        idx += 1;
    }
    None
}

fn event_data(event: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(event);
    let lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

// What one `data:` payload means for the stream
#[derive(Debug, PartialEq)]
pub enum Decoded {
    Parts(Vec<StreamPart>, Option<Usage>),
    Done,
}

pub fn decode_chunk(data: &str) -> Result<Decoded, GatewayError> {
    if data == "[DONE]" {
        return Ok(Decoded::Done);
    }

    let chunk: Value =
        serde_json::from_str(data).map_err(|e| GatewayError::Decode(e.to_string()))?;

    if let Some(error) = chunk.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown upstream error");
        return Err(GatewayError::Upstream(message.to_string()));
    }

    let mut parts = Vec::new();
    let delta = chunk.pointer("/choices/0/delta");

    if let Some(delta) = delta {
        let reasoning = delta
            .get("reasoning")
            .or_else(|| delta.get("reasoning_content"))
            .and_then(Value::as_str);
        if let Some(text) = reasoning.filter(|t| !t.is_empty()) {
            parts.push(StreamPart::ReasoningDelta(text.to_string()));
        }

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                parts.push(StreamPart::TextDelta(text.to_string()));
            }
        }

        if let Some(annotations) = delta.get("annotations").and_then(Value::as_array) {
            for citation in annotations.iter().filter_map(|a| a.get("url_citation")) {
                if let Some(url) = citation.get("url").and_then(Value::as_str) {
                    parts.push(StreamPart::Source {
                        url: url.to_string(),
                        title: citation
                            .get("title")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    });
                }
            }
        }
    }

    let usage = chunk.get("usage").filter(|u| !u.is_null()).map(|u| Usage {
        input_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
    });

    Ok(Decoded::Parts(parts, usage))
}

struct Upstream<S> {
    bytes: S,
    decoder: SseDecoder,
    pending: VecDeque<Result<StreamPart, GatewayError>>,
    usage: Option<Usage>,
    finished: bool,
}

impl<S> Upstream<S> {
    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.pending
                .push_back(Ok(StreamPart::Finish(self.usage.unwrap_or_default())));
        }
    }

    fn fail(&mut self, err: GatewayError) {
        self.finished = true;
        self.pending.push_back(Err(err));
    }

    fn ingest(&mut self, chunk: &[u8]) {
        for data in self.decoder.push(chunk) {
            if self.finished {
                break;
            }
            match decode_chunk(&data) {
                Ok(Decoded::Parts(parts, usage)) => {
                    self.pending.extend(parts.into_iter().map(Ok));
                    if usage.is_some() {
                        self.usage = usage;
                    }
                }
                Ok(Decoded::Done) => self.finish(),
                Err(err) => self.fail(err),
            }
        }
    }
}

// Turn a raw SSE byte stream into parts, ending with Finish or one error
pub fn parts_from_sse<S, E>(bytes: S) -> PartStream
where
    S: futures_util::Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Into<GatewayError> + Send + 'static,
{
    let state = Upstream {
        bytes,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        usage: None,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.ingest(&chunk),
                Some(Err(err)) => state.fail(err.into()),
                None => state.finish(),
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_split_events_and_crlf() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        assert_eq!(decoder.push(b"1}\n\ndata: [DO"), vec!["{\"a\":1}"]);
        assert_eq!(decoder.push(b"NE]\r\n\r\n: comment\n\n"), vec!["[DONE]"]);
    }

    #[test]
    fn decodes_text_reasoning_sources_and_usage() {
        let chunk = r#"{"choices":[{"delta":{"reasoning":"hmm","content":"Hi","annotations":[
            {"type":"url_citation","url_citation":{"url":"https://example.com","title":"Ex"}}]}}],
            "usage":{"prompt_tokens":12,"completion_tokens":3}}"#;

        let Decoded::Parts(parts, usage) = decode_chunk(chunk).unwrap() else {
            panic!("expected parts");
        };
        assert_eq!(
            parts,
            vec![
                StreamPart::ReasoningDelta("hmm".into()),
                StreamPart::TextDelta("Hi".into()),
                StreamPart::Source {
                    url: "https://example.com".into(),
                    title: Some("Ex".into())
                },
            ]
        );
        assert_eq!(
            usage,
            Some(Usage {
                input_tokens: 12,
                output_tokens: 3
            })
        );
    }

    #[test]
    fn upstream_error_payload_is_an_error() {
        let err = decode_chunk(r#"{"error":{"message":"overloaded"}}"#).unwrap_err();
        assert!(matches!(err, GatewayError::Upstream(m) if m == "overloaded"));
    }

    #[test]
    fn catalog_prices_accept_strings_and_numbers() {
        let list: ModelList = serde_json::from_str(
            r#"{"data":[
                {"id":"a","pricing":{"input":"0.000001","output":"0.000002"}},
                {"id":"b","pricing":{"input":0.5,"output":1}},
                {"id":"c"}
            ]}"#,
        )
        .unwrap();
        let models: Vec<ModelInfo> = list.data.into_iter().map(ModelInfo::from).collect();
        assert_eq!(
            models[0].pricing,
            Some(Pricing {
                input: 0.000001,
                output: 0.000002
            })
        );
        assert_eq!(models[1].pricing, Some(Pricing { input: 0.5, output: 1.0 }));
        assert_eq!(models[2].pricing, None);
    }

    #[test]
    fn unusable_catalog_prices_leave_model_unpriced() {
        let list: ModelList = serde_json::from_str(
            r#"{"data":[
                {"id":"nan","pricing":{"input":"NaN","output":"0.1"}},
                {"id":"neg","pricing":{"input":"0.1","output":-1}},
                {"id":"inf","pricing":{"input":"inf","output":"0.1"}},
                {"id":"free","pricing":{"input":"0","output":0}}
            ]}"#,
        )
        .unwrap();
        let models: Vec<ModelInfo> = list.data.into_iter().map(ModelInfo::from).collect();
        assert_eq!(models[0].pricing, None);
        assert_eq!(models[1].pricing, None);
        assert_eq!(models[2].pricing, None);
        assert_eq!(models[3].pricing, Some(Pricing::default()));
    }

    #[tokio::test]
    async fn sse_stream_ends_with_finish_carrying_usage() {
        let chunks: Vec<Result<Bytes, GatewayError>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n")),
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\ndata: {\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2}}\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];

        let parts: Vec<_> = parts_from_sse(stream::iter(chunks))
            .map(|p| p.unwrap())
            .collect()
            .await;

        assert_eq!(
            parts,
            vec![
                StreamPart::TextDelta("He".into()),
                StreamPart::TextDelta("llo".into()),
                StreamPart::Finish(Usage {
                    input_tokens: 4,
                    output_tokens: 2
                }),
            ]
        );
    }

    #[tokio::test]
    async fn transport_error_ends_stream_without_finish() {
        let chunks: Vec<Result<Bytes, GatewayError>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n")),
            Err(GatewayError::Decode("connection reset".into())),
        ];

        let parts: Vec<_> = parts_from_sse(stream::iter(chunks)).collect().await;
        assert_eq!(parts.len(), 2);
        assert!(parts[0].is_ok());
        assert!(parts[1].is_err());
    }
}
