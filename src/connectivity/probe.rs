use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CACHE_CONTROL};
use serde::{Deserialize, Serialize};

use crate::config::ReplicaConfig;
use crate::core::{Result, SyncError};

/// Response of the eligibility endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eligibility {
    pub can_sync: bool,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Eligibility {
    pub fn eligible(user_id: &str) -> Self {
        Self {
            can_sync: true,
            user_id: Some(user_id.to_string()),
        }
    }

    pub fn ineligible() -> Self {
        Self {
            can_sync: false,
            user_id: None,
        }
    }
}

/// Lightweight remote capability check. Any error means "offline", never
/// "not eligible".
#[async_trait]
pub trait EligibilityProbe: Send + Sync {
    async fn check(&self) -> Result<Eligibility>;
}

#[derive(Debug, Clone)]
pub struct HttpEligibilityProbe {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

impl HttpEligibilityProbe {
    pub fn new(url: &str, auth_token: Option<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            url: url.to_string(),
            auth_token,
        }
    }

    pub fn from_config(config: &ReplicaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self::new(&config.status_url(), config.auth_token.clone(), client))
    }
}

#[async_trait]
impl EligibilityProbe for HttpEligibilityProbe {
    async fn check(&self) -> Result<Eligibility> {
        let mut request = self.client.get(&self.url).header(CACHE_CONTROL, "no-cache");
        if let Some(token) = &self.auth_token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Transport(format!("status endpoint returned {}", status)));
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|err| SyncError::Transport(format!("malformed status response: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eligibility_wire_format() {
        let parsed: Eligibility = serde_json::from_str(r#"{"canSync":true,"userId":"u1","plan":"pro"}"#).unwrap();
        assert_eq!(parsed, Eligibility::eligible("u1"));

        let parsed: Eligibility = serde_json::from_str(r#"{"canSync":false}"#).unwrap();
        assert_eq!(parsed, Eligibility::ineligible());
    }
}
