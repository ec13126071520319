//!
//! Push notification dispatcher
//! ----------------------------
//! Fire-and-forget fan-out to the FCM topic subscribed by mobile clients,
//! invoked once after a publish commits. The flow is: sign a service-account
//! JWT (RS256), exchange it for a short-lived OAuth access token, then post a
//! topic message through the FCM v1 API.
//!
//! Nothing in here may affect the upload path: every failure (missing
//! credentials, signing error, token exchange, provider outage) is logged
//! with the version and topic for diagnosis, and swallowed. The HTTP client
//! carries a short timeout so a slow provider cannot stall the caller either.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::{Config, FcmCredentials};

const OAUTH_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

#[derive(Clone)]
pub struct NotificationDispatcher {
    client: reqwest::Client,
    fcm: Option<FcmCredentials>,
    topic: String,
}

#[derive(Debug, serde::Serialize)]
struct TokenClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Human-readable notification texts shown by the mobile client.
fn notification_texts(version: &str, release_notes: Option<&str>) -> (String, String) {
    let title = format!("Firmware v{} Available", version);
    let body = release_notes
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            "A new firmware update is available. Connect to your device and update now.".to_string()
        });
    (title, body)
}

/// FCM v1 message payload for a published version.
fn fcm_message(topic: &str, version: &str, release_notes: Option<&str>) -> serde_json::Value {
    let (title, body) = notification_texts(version, release_notes);
    json!({
        "message": {
            "topic": topic,
            "notification": { "title": title, "body": body },
            "data": {
                "type": "firmware_update",
                "version": version,
                "action": "update_available"
            }
        }
    })
}

impl NotificationDispatcher {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.notify_timeout)
            .build()
            .unwrap_or_default();
        if config.fcm.is_none() {
            warn!(target: "otahub::notify", "FCM credentials not configured; push notifications disabled");
        }
        Self {
            client,
            fcm: config.fcm.clone(),
            topic: config.fcm_topic.clone(),
        }
    }

    /// Announce a freshly published version to the topic. Best-effort: always
    /// returns, never errors. Intended to be spawned after the registry
    /// commit, outside the upload transaction.
    pub async fn notify_new_version(&self, version: &str, release_notes: Option<&str>) {
        let Some(creds) = self.fcm.clone() else {
            info!(target: "otahub::notify", "notify skipped (disabled): version={}", version);
            return;
        };
        match self.send(&creds, version, release_notes).await {
            Ok(()) => {
                info!(target: "otahub::notify", "firmware notification sent: version={} topic={}", version, self.topic);
            }
            Err(e) => {
                warn!(
                    target: "otahub::notify",
                    "firmware notification failed (publish unaffected): version={} topic={} error={:#}",
                    version, self.topic, e
                );
            }
        }
    }

    async fn send(&self, creds: &FcmCredentials, version: &str, release_notes: Option<&str>) -> Result<()> {
        let token = self.access_token(creds).await?;
        let url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            creds.project_id
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&fcm_message(&self.topic, version, release_notes))
            .send()
            .await
            .context("FCM send request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("FCM send returned {}: {}", status, body);
        }
        Ok(())
    }

    /// Exchange a signed service-account JWT for a short-lived access token.
    async fn access_token(&self, creds: &FcmCredentials) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = TokenClaims {
            iss: creds.client_email.clone(),
            scope: FCM_SCOPE.to_string(),
            aud: OAUTH_TOKEN_URI.to_string(),
            iat: now,
            exp: now + 3600,
        };
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(creds.private_key_pem.as_bytes())
            .context("Invalid FCM service-account private key")?;
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &key,
        )
        .context("Failed to sign service-account JWT")?;

        let resp = self
            .client
            .post(OAUTH_TOKEN_URI)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .context("OAuth token exchange request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("OAuth token exchange returned {}: {}", status, body);
        }
        let token: TokenResponse = resp.json().await.context("Malformed OAuth token response")?;
        Ok(token.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_payload_shape() {
        let msg = fcm_message("all_users", "1.0.4", Some("Fixes BLE pairing"));
        assert_eq!(msg["message"]["topic"], "all_users");
        assert_eq!(msg["message"]["data"]["type"], "firmware_update");
        assert_eq!(msg["message"]["data"]["version"], "1.0.4");
        assert_eq!(msg["message"]["data"]["action"], "update_available");
        assert_eq!(msg["message"]["notification"]["title"], "Firmware v1.0.4 Available");
        assert_eq!(msg["message"]["notification"]["body"], "Fixes BLE pairing");
    }

    #[test]
    fn body_falls_back_when_notes_missing_or_blank() {
        let (_, body) = notification_texts("1.0.4", None);
        assert!(body.contains("update now"));
        let (_, body) = notification_texts("1.0.4", Some("   "));
        assert!(body.contains("update now"));
    }

    #[tokio::test]
    async fn disabled_dispatcher_is_a_no_op() {
        let config = crate::config::Config {
            http_port: 0,
            data_root: std::path::PathBuf::from("/tmp"),
            base_url: "http://localhost".to_string(),
            max_firmware_bytes: 1,
            admin_user: "admin".to_string(),
            admin_pass: "admin".to_string(),
            fcm: None,
            fcm_topic: "all_users".to_string(),
            notify_timeout: std::time::Duration::from_secs(1),
        };
        let dispatcher = NotificationDispatcher::new(&config);
        // Must neither panic nor attempt any network call.
        dispatcher.notify_new_version("1.0.4", None).await;
    }
}
