use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use tersa_gateway::config::Args;
use tersa_gateway::gateway::HttpGateway;
use tersa_gateway::metering::{CreditSink, HttpCreditSink};
use tersa_gateway::rate_limit::{RateLimiter, sweeper};
use tersa_gateway::session::StaticSessions;
use tersa_gateway::state::AppState;
use tersa_gateway::{app, logging};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    logging::init(&args.log_level, args.log_json)?;

    let client = reqwest::Client::new();

    let sessions = StaticSessions::from_file(&args.users_file)?;

    // usage goes to the billing service when configured, else to local balances
    let credits: Arc<dyn CreditSink> = match &args.billing_url {
        Some(url) => Arc::new(HttpCreditSink::new(client.clone(), url.as_str())),
        None => Arc::new(sessions.ledger()),
    };

    let rate_limiter = RateLimiter::new();

    let state = Arc::new(AppState {
        gateway: Arc::new(HttpGateway::new(
            client,
            &args.gateway_url,
            args.gateway_api_key.clone(),
        )),
        sessions: Arc::new(sessions),
        credits,
        rate_limiter: Arc::new(rate_limiter.clone()),
        chat_limit: args.chat_limit(),
        code_limit: args.code_limit(),
        max_duration: Duration::from_secs(args.max_duration),
    });

    tokio::spawn(sweeper(rate_limiter, Duration::from_secs(args.sweep_interval)));

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(%addr, gateway = %args.gateway_url, "gateway listening");
    tracing::info!(
        chat_limit = args.chat_rate_limit,
        code_limit = args.code_rate_limit,
        window_secs = args.rate_window,
        "rate limits configured"
    );

    axum::serve(listener, app(state)).await?;
    Ok(())
}
