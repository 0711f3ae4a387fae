use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use std::sync::Arc;

use super::stream::{AiRequest, Route, handle};
use crate::models::{CodeRequest, Message};
use crate::state::AppState;

impl AiRequest for CodeRequest {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn system_prompt(&self) -> String {
        let language = match &self.language {
            Some(language) => format!("Write the code in {language}."),
            None => "Infer the programming language from the request.".to_string(),
        };
        format!(
            "You are an expert programmer. {language} \
             Output only the code itself, without Markdown fences, explanations or commentary."
        )
    }

    fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

// POST /api/code
pub async fn code_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let route = Route {
        name: "code",
        limit: state.code_limit,
    };
    handle::<CodeRequest>(state, route, headers, body).await
}
