use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::fxtunnel::protocol::Plan;

/// Outcome of validating a presented bearer token.
#[derive(Debug, Clone)]
pub struct AuthDecision {
    pub user_id: String,
    pub plan: Plan,
    pub admin: bool,
}

/// Token validation is delegated; the tunnel core never inspects credentials
/// itself. Implementations must be cheap to call per session handshake.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> anyhow::Result<Option<AuthDecision>>;
}

/// Static token table from config. The deployment-grade verifier is
/// [`HttpVerifier`]; this one covers dev setups and tests.
pub struct StaticVerifier {
    tokens: HashMap<String, AuthDecision>,
}

impl StaticVerifier {
    pub fn new(tokens: HashMap<String, AuthDecision>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> anyhow::Result<Option<AuthDecision>> {
        Ok(self.tokens.get(token.trim()).cloned())
    }
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    ok: bool,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    plan: Option<Plan>,
    #[serde(default)]
    admin: bool,
}

/// Delegates validation to the external auth service over HTTPS.
pub struct HttpVerifier {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpVerifier {
    pub fn new(endpoint: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()?;
        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl TokenVerifier for HttpVerifier {
    async fn verify(&self, token: &str) -> anyhow::Result<Option<AuthDecision>> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token.trim())
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        let body: VerifyResponse = resp.json().await?;

        if !body.ok {
            return Ok(None);
        }
        let Some(user_id) = body.user_id else {
            anyhow::bail!("auth: service replied ok without user_id");
        };
        Ok(Some(AuthDecision {
            user_id,
            plan: body.plan.unwrap_or_default(),
            admin: body.admin,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_verifier_matches_trimmed_token() {
        let mut tokens = HashMap::new();
        tokens.insert(
            "sk_T".to_string(),
            AuthDecision {
                user_id: "user1".into(),
                plan: Plan::default(),
                admin: false,
            },
        );
        let v = StaticVerifier::new(tokens);
        let d = v.verify(" sk_T ").await.unwrap().unwrap();
        assert_eq!(d.user_id, "user1");
        assert!(v.verify("sk_other").await.unwrap().is_none());
    }
}
