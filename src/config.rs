use clap::Parser;
use std::path::PathBuf;

use crate::rate_limit::{MAX_WINDOW_SECONDS, RateLimitConfig};

// CLI argument structure, every flag can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "tersa-gateway")]
#[command(about = "Rate limited, credit metered streaming front for an AI model gateway")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "TERSA_PORT", default_value_t = 8080)]
    pub port: u16,

    // OpenAI-compatible model gateway
    #[arg(short, long, env = "TERSA_GATEWAY_URL", default_value = "http://localhost:4000")]
    pub gateway_url: String,

    #[arg(long, env = "TERSA_GATEWAY_API_KEY", hide_env_values = true)]
    pub gateway_api_key: Option<String>,

    // JSON list of {token, id, subscribed?, credits?}
    #[arg(short, long, env = "TERSA_USERS_FILE", default_value = "users.json")]
    pub users_file: PathBuf,

    // Forward usage events here instead of the in-memory ledger
    #[arg(long, env = "TERSA_BILLING_URL")]
    pub billing_url: Option<String>,

    // Requests per window on /api/chat
    #[arg(long, env = "TERSA_CHAT_RATE_LIMIT", default_value_t = 60,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub chat_rate_limit: u32,

    // Requests per window on /api/code
    #[arg(long, env = "TERSA_CODE_RATE_LIMIT", default_value_t = 60,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub code_rate_limit: u32,

    // Rate limit window in seconds
    #[arg(long, env = "TERSA_RATE_WINDOW", default_value_t = 60,
          value_parser = clap::value_parser!(u64).range(1..=MAX_WINDOW_SECONDS))]
    pub rate_window: u64,

    // How often expired rate limit entries are dropped, in seconds
    #[arg(long, env = "TERSA_SWEEP_INTERVAL", default_value_t = 60,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub sweep_interval: u64,

    // Upper bound on one streamed response, in seconds
    #[arg(long, env = "TERSA_MAX_DURATION", default_value_t = 30,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub max_duration: u64,

    #[arg(long, env = "TERSA_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "TERSA_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Args {
    pub fn chat_limit(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.chat_rate_limit, self.rate_window)
    }

    pub fn code_limit(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.code_rate_limit, self.rate_window)
    }
}
