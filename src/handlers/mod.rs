mod chat;
mod code;
mod health;
mod metrics;
mod stream;

pub use chat::chat_handler;
pub use code::code_handler;
pub use health::health_handler;
pub use metrics::metrics_handler;
pub use stream::{AiRequest, UI_STREAM_HEADER};
