use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use std::sync::Arc;

use super::stream::{AiRequest, Route, handle};
use crate::models::{ChatRequest, Message};
use crate::state::AppState;

const SYSTEM_PROMPT: &str = "You are a helpful assistant that synthesizes an answer or content. \
Use the conversation so far as context and answer the latest message directly.";

impl AiRequest for ChatRequest {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn system_prompt(&self) -> String {
        SYSTEM_PROMPT.to_string()
    }

    fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

// POST /api/chat
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let route = Route {
        name: "chat",
        limit: state.chat_limit,
    };
    handle::<ChatRequest>(state, route, headers, body).await
}
