use std::sync::Arc;
use std::time::Duration;

use crate::gateway::ModelGateway;
use crate::metering::CreditSink;
use crate::rate_limit::{RateLimitBackend, RateLimitConfig};
use crate::session::SessionStore;

// app's shared state
pub struct AppState {
    pub gateway: Arc<dyn ModelGateway>,
    pub sessions: Arc<dyn SessionStore>,
    pub credits: Arc<dyn CreditSink>,
    pub rate_limiter: Arc<dyn RateLimitBackend>,
    pub chat_limit: RateLimitConfig,
    pub code_limit: RateLimitConfig,
    pub max_duration: Duration, // cap on a single streamed response
}
