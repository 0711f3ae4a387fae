use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::metering::{CreditLedger, CreditSink};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("account has no active subscription")]
    NotSubscribed,

    #[error("no credits remaining")]
    NoCredits,

    #[error("session store error: {0}")]
    Store(String),
}

// Authenticated caller
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: String,
    pub subscribed: bool,
}

/// Resolves the caller of a request.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn current_user(&self, headers: &HeaderMap) -> Result<User, SessionError>;
}

// One line of the users file
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub token: String,
    pub id: String,
    #[serde(default = "default_subscribed")]
    pub subscribed: bool,
    #[serde(default)]
    pub credits: Option<f64>,
}

fn default_subscribed() -> bool {
    true
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

// Token -> account table loaded once at startup
#[derive(Debug, Clone, Default)]
pub struct StaticSessions {
    accounts: HashMap<String, Account>,
}

impl StaticSessions {
    pub fn new(accounts: Vec<Account>) -> Self {
        let accounts = accounts
            .into_iter()
            .map(|account| (account.token.clone(), account))
            .collect();
        Self { accounts }
    }

    pub fn from_file(path: &Path) -> Result<Self, SessionError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Store(format!("reading {}: {e}", path.display())))?;
        let accounts: Vec<Account> = serde_json::from_str(&raw)
            .map_err(|e| SessionError::Store(format!("parsing {}: {e}", path.display())))?;
        Ok(Self::new(accounts))
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    // Local balances for every account, missing credits start at zero
    pub fn ledger(&self) -> CreditLedger {
        let ledger = CreditLedger::new();
        for account in self.accounts() {
            ledger.open(account.id.clone(), account.credits.unwrap_or(0.0));
        }
        ledger
    }
}

#[async_trait]
impl SessionStore for StaticSessions {
    async fn current_user(&self, headers: &HeaderMap) -> Result<User, SessionError> {
        let token = bearer_token(headers).ok_or(SessionError::MissingToken)?;
        let account = self.accounts.get(token).ok_or(SessionError::InvalidToken)?;
        Ok(User {
            id: account.id.clone(),
            subscribed: account.subscribed,
        })
    }
}

// The caller must be signed in, subscribed, and not out of credits
pub async fn subscribed_user(
    sessions: &dyn SessionStore,
    credits: &dyn CreditSink,
    headers: &HeaderMap,
) -> Result<User, SessionError> {
    let user = sessions.current_user(headers).await?;

    if !user.subscribed {
        return Err(SessionError::NotSubscribed);
    }

    if let Some(balance) = credits.balance(&user.id) {
        if balance <= 0.0 {
            return Err(SessionError::NoCredits);
        }
    }

    Ok(user)
}
