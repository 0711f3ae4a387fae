//! Shared pipeline behind the streaming AI routes.
//!
//! `authenticate -> rate limit -> validate -> resolve model -> stream`.
//! Everything up to the stream is answered with a plain status; once the
//! stream has started, failures travel as `error` events inside it.

use axum::body::Bytes;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::json;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::time::{Instant, timeout_at};

use crate::error::AppError;
use crate::gateway::{PartStream, find_model};
use crate::metering;
use crate::metrics::{REQUEST_REJECTED, REQUEST_TOTAL, STREAM_DURATION};
use crate::models::{Message, ModelInfo, StreamPart, Usage};
use crate::rate_limit::RateLimitConfig;
use crate::session::subscribed_user;
use crate::state::AppState;
use crate::validation::{Schema, validate};

pub const UI_STREAM_HEADER: &str = "x-vercel-ai-ui-message-stream";
const STREAM_ERROR_TEXT: &str = "An error occurred while generating the response.";

// A validated body one of the AI routes can send upstream
pub trait AiRequest: Schema + Send {
    fn model_id(&self) -> &str;
    fn system_prompt(&self) -> String;
    fn into_messages(self) -> Vec<Message>;
}

// Which route is being served, also the rate limit prefix and billing action
#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub name: &'static str,
    pub limit: RateLimitConfig,
}

pub async fn handle<T: AiRequest>(
    state: Arc<AppState>,
    route: Route,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    REQUEST_TOTAL.with_label_values(&[route.name]).inc();

    let mut user_id = None;
    match admit::<T>(state, route, &headers, &body, &mut user_id).await {
        Ok(response) => response,
        Err(err) => {
            REQUEST_REJECTED
                .with_label_values(&[route.name, err.kind()])
                .inc();
            let user = user_id.as_deref().unwrap_or("-");
            match &err {
                AppError::Stream(_) | AppError::Unknown(_) => {
                    tracing::error!(route = route.name, user_id = user, kind = err.kind(), error = %err, "request failed")
                }
                _ => {
                    tracing::warn!(route = route.name, user_id = user, kind = err.kind(), error = %err, "request rejected")
                }
            }
            err.into_response()
        }
    }
}

async fn admit<T: AiRequest>(
    state: Arc<AppState>,
    route: Route,
    headers: &HeaderMap,
    body: &[u8],
    user_id: &mut Option<String>,
) -> Result<Response, AppError> {
    let user = subscribed_user(state.sessions.as_ref(), state.credits.as_ref(), headers).await?;
    *user_id = Some(user.id.clone());

    let identifier = format!("{}:{}", route.name, user.id);
    let decision = state.rate_limiter.check(&identifier, route.limit).await;
    if !decision.success {
        return Err(AppError::RateLimited {
            limit: route.limit.limit,
            retry_after: decision.retry_after_secs(Utc::now()),
            reset: decision.reset,
        });
    }

    let request: T = validate(body)?;

    let model = find_model(state.gateway.as_ref(), request.model_id())
        .await?
        .ok_or_else(|| AppError::ModelNotFound(request.model_id().to_string()))?;

    let system = request.system_prompt();
    let messages = request.into_messages();
    let parts = state
        .gateway
        .stream(&model.id, &system, &messages)
        .await
        .map_err(|e| AppError::Stream(e.to_string()))?;

    tracing::info!(
        route = route.name,
        user_id = %user.id,
        model = %model.id,
        remaining = decision.remaining,
        "streaming completion"
    );

    let deadline = Instant::now() + state.max_duration;
    let ui = UiStream::new(state, route, user.id, model, parts, deadline);

    let sse = Sse::new(ui.into_events()).keep_alive(KeepAlive::default());
    Ok(([(UI_STREAM_HEADER, "v1")], sse).into_response())
}

// Translates model parts into UI message stream events and meters on finish
struct UiStream {
    state: Arc<AppState>,
    route: Route,
    user_id: String,
    model: ModelInfo,
    parts: PartStream,
    deadline: Instant,
    started: Instant,
    pending: VecDeque<String>,
    reasoning_open: bool,
    text_open: bool,
    sources: usize,
    done: bool,
}

impl UiStream {
    fn new(
        state: Arc<AppState>,
        route: Route,
        user_id: String,
        model: ModelInfo,
        parts: PartStream,
        deadline: Instant,
    ) -> Self {
        let mut pending = VecDeque::new();
        pending.push_back(json!({"type": "start"}).to_string());
        pending.push_back(json!({"type": "start-step"}).to_string());

        Self {
            state,
            route,
            user_id,
            model,
            parts,
            deadline,
            started: Instant::now(),
            pending,
            reasoning_open: false,
            text_open: false,
            sources: 0,
            done: false,
        }
    }

    fn into_events(self) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
        stream::unfold(self, |mut ui| async move {
            loop {
                if let Some(data) = ui.pending.pop_front() {
                    return Some((Ok(Event::default().data(data)), ui));
                }
                if ui.done {
                    return None;
                }
                ui.advance().await;
            }
        })
    }

    fn push(&mut self, event: serde_json::Value) {
        self.pending.push_back(event.to_string());
    }

    async fn advance(&mut self) {
        match timeout_at(self.deadline, self.parts.next()).await {
            Ok(Some(Ok(part))) => self.on_part(part).await,
            Ok(Some(Err(err))) => self.fail(&err.to_string()),
            Ok(None) => {
                tracing::warn!(route = self.route.name, model = %self.model.id, "stream ended without usage");
                self.complete(Usage::default()).await;
            }
            Err(_) => self.fail("stream exceeded the maximum duration"),
        }
    }

    async fn on_part(&mut self, part: StreamPart) {
        match part {
            StreamPart::ReasoningDelta(delta) => {
                if !self.reasoning_open {
                    self.reasoning_open = true;
                    self.push(json!({"type": "reasoning-start", "id": "reasoning-0"}));
                }
                self.push(json!({"type": "reasoning-delta", "id": "reasoning-0", "delta": delta}));
            }
            StreamPart::TextDelta(delta) => {
                self.close_reasoning();
                if !self.text_open {
                    self.text_open = true;
                    self.push(json!({"type": "text-start", "id": "text-0"}));
                }
                self.push(json!({"type": "text-delta", "id": "text-0", "delta": delta}));
            }
            StreamPart::Source { url, title } => {
                let source_id = format!("source-{}", self.sources);
                self.sources += 1;
                let mut event = json!({"type": "source-url", "sourceId": source_id, "url": url});
                if let Some(title) = title {
                    event["title"] = json!(title);
                }
                self.push(event);
            }
            StreamPart::Finish(usage) => self.complete(usage).await,
        }
    }

    fn close_reasoning(&mut self) {
        if self.reasoning_open {
            self.reasoning_open = false;
            self.push(json!({"type": "reasoning-end", "id": "reasoning-0"}));
        }
    }

    fn close_blocks(&mut self) {
        self.close_reasoning();
        if self.text_open {
            self.text_open = false;
            self.push(json!({"type": "text-end", "id": "text-0"}));
        }
    }

    async fn complete(&mut self, usage: Usage) {
        self.close_blocks();
        self.done = true;
        self.observe();

        match self.model.pricing {
            Some(pricing) => {
                // billing is best effort, a failure is logged inside meter()
                let _ = metering::meter(
                    self.state.credits.as_ref(),
                    &self.user_id,
                    self.route.name,
                    pricing,
                    usage,
                )
                .await;
            }
            None => tracing::warn!(
                route = self.route.name,
                user_id = %self.user_id,
                model = %self.model.id,
                "model has no pricing, usage not metered"
            ),
        }

        self.push(json!({"type": "finish-step"}));
        self.push(json!({"type": "finish"}));
        self.pending.push_back("[DONE]".to_string());
    }

    fn fail(&mut self, reason: &str) {
        let err = AppError::Stream(reason.to_string());
        tracing::error!(
            route = self.route.name,
            user_id = %self.user_id,
            model = %self.model.id,
            kind = err.kind(),
            error = %err,
            "stream failed"
        );
        self.close_blocks();
        self.done = true;
        self.observe();
        self.push(json!({"type": "error", "errorText": STREAM_ERROR_TEXT}));
    }

    fn observe(&self) {
        STREAM_DURATION
            .with_label_values(&[self.route.name])
            .observe(self.started.elapsed().as_secs_f64());
    }
}
