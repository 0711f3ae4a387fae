//! Credit metering for completed streams.
//!
//! A completion's token usage is priced with the model's per-token rates and
//! the resulting [`UsageEvent`] is handed to a [`CreditSink`]. Billing is best
//! effort: a sink failure is logged and counted, the stream that produced the
//! usage is left alone.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::metrics::{BILLING_FAILURES, CREDITS_CHARGED};
use crate::models::{Pricing, Usage, UsageEvent};

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("billing request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("billing endpoint returned {0}")]
    Status(u16),

    #[error("unknown account: {0}")]
    UnknownAccount(String),
}

/// Receives priced usage for a user.
#[async_trait]
pub trait CreditSink: Send + Sync + 'static {
    async fn track(&self, user_id: &str, event: UsageEvent) -> Result<(), BillingError>;

    // Remaining balance if this sink keeps one
    fn balance(&self, _user_id: &str) -> Option<f64> {
        None
    }
}

pub fn compute_cost(pricing: Pricing, usage: Usage) -> f64 {
    pricing.input * usage.input_tokens as f64 + pricing.output * usage.output_tokens as f64
}

// Price the usage and forward it, returns the cost that was sent
pub async fn meter(
    sink: &dyn CreditSink,
    user_id: &str,
    action: &str,
    pricing: Pricing,
    usage: Usage,
) -> Result<f64, BillingError> {
    let cost = compute_cost(pricing, usage);
    let event = UsageEvent {
        action: action.to_string(),
        cost,
    };

    match sink.track(user_id, event).await {
        Ok(()) => {
            CREDITS_CHARGED.inc_by(cost.max(0.0));
            tracing::info!(
                user_id,
                action,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                cost,
                "credits tracked"
            );
            Ok(cost)
        }
        Err(err) => {
            BILLING_FAILURES.inc();
            tracing::error!(user_id, action, cost, error = %err, "failed to track credit usage");
            Err(err)
        }
    }
}

// In-memory balances, keyed by user id
#[derive(Debug, Clone, Default)]
pub struct CreditLedger {
    balances: Arc<DashMap<String, f64>>,
}

impl CreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, user_id: impl Into<String>, credits: f64) {
        self.balances.insert(user_id.into(), credits);
    }
}

#[async_trait]
impl CreditSink for CreditLedger {
    async fn track(&self, user_id: &str, event: UsageEvent) -> Result<(), BillingError> {
        let mut balance = self
            .balances
            .get_mut(user_id)
            .ok_or_else(|| BillingError::UnknownAccount(user_id.to_string()))?;
        // balance may go negative on the last request, the next one is refused
        *balance -= event.cost;
        Ok(())
    }

    // an account the ledger never opened has nothing to spend
    fn balance(&self, user_id: &str) -> Option<f64> {
        Some(self.balances.get(user_id).map_or(0.0, |b| *b))
    }
}

// Forwards usage events to an external billing service as JSON
pub struct HttpCreditSink {
    client: reqwest::Client,
    url: String,
}

#[derive(serde::Serialize)]
struct BillingPayload<'a> {
    user_id: &'a str,
    action: &'a str,
    cost: f64,
}

impl HttpCreditSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CreditSink for HttpCreditSink {
    async fn track(&self, user_id: &str, event: UsageEvent) -> Result<(), BillingError> {
        let res = self
            .client
            .post(&self.url)
            .json(&BillingPayload {
                user_id,
                action: &event.action,
                cost: event.cost,
            })
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(BillingError::Status(res.status().as_u16()));
        }
        Ok(())
    }
}
