// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Auth authority seam.
//!
//! Credential issuance, login, and role mapping live outside the hub;
//! this module is the client surface the core consumes: agent secret
//! validation at handshake, operator token validation, and the
//! agent-record ownership check that gates terminal sessions.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use tokio::sync::RwLock;

/// Authority failures; the caller maps them to `auth` or `unavailable`.
#[derive(Debug)]
pub enum AuthorityError {
    Unavailable(String),
}

impl fmt::Display for AuthorityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "authority unavailable: {msg}"),
        }
    }
}

impl std::error::Error for AuthorityError {}

pub type AuthResult<T> = Result<T, AuthorityError>;

#[async_trait::async_trait]
pub trait Authority: Send + Sync {
    /// True when `(agent_id, secret)` matches a registered agent record.
    async fn validate_agent(&self, agent_id: &str, secret: &str) -> AuthResult<bool>;

    /// Resolve an operator token to an operator id, or `None` when the
    /// token is invalid or revoked.
    async fn authorize_operator(&self, token: &str) -> AuthResult<Option<String>>;

    /// Owning operator of an agent record, per the durable agent store.
    async fn owner_of(&self, agent_id: &str) -> AuthResult<Option<String>>;

    /// Update `last_connected_at` on the agent record.
    async fn record_connect(&self, agent_id: &str, now: i64) -> AuthResult<()>;
}

// -- HTTP client --------------------------------------------------------------

/// Authority client speaking the external service's REST contract.
pub struct HttpAuthority {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthority {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }
}

fn unavailable(e: impl fmt::Display) -> AuthorityError {
    AuthorityError::Unavailable(e.to_string())
}

#[async_trait::async_trait]
impl Authority for HttpAuthority {
    async fn validate_agent(&self, agent_id: &str, secret: &str) -> AuthResult<bool> {
        #[derive(Deserialize)]
        struct Reply {
            valid: bool,
        }
        let url = format!("{}/v1/agents/validate", self.base_url);
        let reply: Reply = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "agent_id": agent_id, "secret": secret }))
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?
            .json()
            .await
            .map_err(unavailable)?;
        Ok(reply.valid)
    }

    async fn authorize_operator(&self, token: &str) -> AuthResult<Option<String>> {
        #[derive(Deserialize)]
        struct Reply {
            operator_id: Option<String>,
        }
        let url = format!("{}/v1/tokens/validate", self.base_url);
        let reply: Reply = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?
            .json()
            .await
            .map_err(unavailable)?;
        Ok(reply.operator_id)
    }

    async fn owner_of(&self, agent_id: &str) -> AuthResult<Option<String>> {
        #[derive(Deserialize)]
        struct Reply {
            owner_id: String,
        }
        let url = format!("{}/v1/agents/{agent_id}", self.base_url);
        let response = self.client.get(&url).send().await.map_err(unavailable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let reply: Reply = response
            .error_for_status()
            .map_err(unavailable)?
            .json()
            .await
            .map_err(unavailable)?;
        Ok(Some(reply.owner_id))
    }

    async fn record_connect(&self, agent_id: &str, now: i64) -> AuthResult<()> {
        let url = format!("{}/v1/agents/{agent_id}/connected", self.base_url);
        self.client
            .post(&url)
            .json(&serde_json::json!({ "last_connected_at": now }))
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?;
        Ok(())
    }
}

// -- Static authority ---------------------------------------------------------

/// Seeded agent record for the static authority.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSeed {
    pub agent_id: String,
    pub secret: String,
    pub owner_id: String,
}

/// Seeded operator token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenSeed {
    pub token: String,
    pub operator_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthoritySeed {
    #[serde(default)]
    pub agents: Vec<AgentSeed>,
    #[serde(default)]
    pub tokens: Vec<TokenSeed>,
}

/// In-process authority seeded from a JSON file or built in tests.
#[derive(Default)]
pub struct StaticAuthority {
    agents: RwLock<HashMap<String, AgentSeed>>,
    tokens: HashMap<String, String>,
    last_connected: RwLock<HashMap<String, i64>>,
}

impl StaticAuthority {
    pub fn from_seed(seed: AuthoritySeed) -> Self {
        Self {
            agents: RwLock::new(
                seed.agents.into_iter().map(|a| (a.agent_id.clone(), a)).collect(),
            ),
            tokens: seed.tokens.into_iter().map(|t| (t.token, t.operator_id)).collect(),
            last_connected: RwLock::new(HashMap::new()),
        }
    }

    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let seed: AuthoritySeed = serde_json::from_str(&contents)?;
        Ok(Self::from_seed(seed))
    }

    /// Last `record_connect` timestamp for an agent, if any.
    pub async fn last_connected(&self, agent_id: &str) -> Option<i64> {
        self.last_connected.read().await.get(agent_id).copied()
    }
}

#[async_trait::async_trait]
impl Authority for StaticAuthority {
    async fn validate_agent(&self, agent_id: &str, secret: &str) -> AuthResult<bool> {
        Ok(self
            .agents
            .read()
            .await
            .get(agent_id)
            .is_some_and(|seed| seed.secret == secret))
    }

    async fn authorize_operator(&self, token: &str) -> AuthResult<Option<String>> {
        Ok(self.tokens.get(token).cloned())
    }

    async fn owner_of(&self, agent_id: &str) -> AuthResult<Option<String>> {
        Ok(self.agents.read().await.get(agent_id).map(|seed| seed.owner_id.clone()))
    }

    async fn record_connect(&self, agent_id: &str, now: i64) -> AuthResult<()> {
        self.last_connected.write().await.insert(agent_id.to_owned(), now);
        Ok(())
    }
}

#[cfg(test)]
#[path = "authority_tests.rs"]
mod tests;
