//! Catapult Voice API client
//!
//! Thin reqwest wrapper over the call/bridge/endpoint control plane. The
//! [`TelephonyGateway`] trait is the seam the call router depends on, so
//! tests can substitute a recording fake.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Worth retrying: transport failures, rate limits, provider 5xx.
    #[error("transient gateway error: {0}")]
    Transient(String),
    /// Not worth retrying: invalid request, resource gone, bad call state.
    #[error("permanent gateway error: {0}")]
    Permanent(String),
}

/// One leg of a bridged call as reported by the provider.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeLeg {
    pub id: String,
    pub state: String,
}

impl BridgeLeg {
    pub fn is_active(&self) -> bool {
        self.state == "active"
    }
}

/// Call-control operations the router needs from the provider.
#[async_trait]
pub trait TelephonyGateway: Send + Sync {
    /// Resolve an endpoint resource to its dialable SIP address.
    async fn resolve_endpoint_address(&self, endpoint_id: &str) -> Result<String, GatewayError>;

    /// Answer a ringing leg.
    async fn set_call_active(&self, call_id: &str) -> Result<(), GatewayError>;

    /// Start looped audio playback on a leg. The provider plays it in the
    /// background; the request returns immediately.
    async fn play_audio_loop(&self, call_id: &str, media_url: &str) -> Result<(), GatewayError>;

    /// Create a bridge containing `leg_ids`, returning the bridge id.
    async fn create_bridge(&self, leg_ids: &[&str], mix_audio: bool)
        -> Result<String, GatewayError>;

    /// Originate a new leg attached to `bridge_id`, stamped with `tag`.
    /// Events for the new leg are delivered to `callback_url`.
    async fn originate_call(
        &self,
        from: &str,
        to: &str,
        bridge_id: &str,
        tag: &str,
        callback_url: &str,
    ) -> Result<String, GatewayError>;

    async fn get_bridge_legs(&self, bridge_id: &str) -> Result<Vec<BridgeLeg>, GatewayError>;

    async fn hangup(&self, call_id: &str) -> Result<(), GatewayError>;
}

#[derive(Clone)]
pub struct CatapultClient {
    client: Client,
    api_token: String,
    api_secret: String,
    domain_id: String,
    base_url: String,
}

impl CatapultClient {
    pub fn new(
        user_id: String,
        api_token: String,
        api_secret: String,
        domain_id: String,
    ) -> Self {
        Self {
            client: Client::new(),
            api_token,
            api_secret,
            domain_id,
            base_url: format!("https://api.catapult.inetwork.com/v1/users/{}", user_id),
        }
    }

    /// Issue one request with bounded retry on transient failures. Once the
    /// attempts are exhausted the error escalates to `Permanent` so callers
    /// stop retrying too.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Response, GatewayError> {
        let mut attempt = 0;
        let mut delay = RETRY_BASE_DELAY;
        loop {
            attempt += 1;
            let mut request = self
                .client
                .request(method.clone(), format!("{}{}", self.base_url, path))
                .basic_auth(&self.api_token, Some(&self.api_secret))
                .timeout(REQUEST_TIMEOUT);
            if let Some(body) = body {
                request = request.json(body);
            }

            let err = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let text = response.text().await.unwrap_or_default();
                    if is_transient(status) {
                        GatewayError::Transient(format!("{}: {}", status, text))
                    } else {
                        return Err(GatewayError::Permanent(format!("{}: {}", status, text)));
                    }
                }
                Err(e) => GatewayError::Transient(e.to_string()),
            };

            if attempt >= RETRY_ATTEMPTS {
                return Err(match err {
                    GatewayError::Transient(message) => GatewayError::Permanent(message),
                    other => other,
                });
            }

            tracing::warn!(
                "catapult request {} failed (attempt {}): {}",
                path,
                attempt,
                err
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Created resources come back as a `Location` header whose last path
/// segment is the new resource id.
fn id_from_location(location: Option<&str>) -> Result<String, GatewayError> {
    location
        .and_then(|loc| loc.rsplit('/').next())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            GatewayError::Permanent("create response missing Location header".to_string())
        })
}

fn created_id(response: &Response) -> Result<String, GatewayError> {
    id_from_location(
        response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok()),
    )
}

#[async_trait]
impl TelephonyGateway for CatapultClient {
    async fn resolve_endpoint_address(&self, endpoint_id: &str) -> Result<String, GatewayError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct EndpointData {
            sip_uri: String,
        }

        let response = self
            .request(
                Method::GET,
                &format!("/domains/{}/endpoints/{}", self.domain_id, endpoint_id),
                None,
            )
            .await?;
        let data: EndpointData = response
            .json()
            .await
            .map_err(|e| GatewayError::Permanent(e.to_string()))?;
        Ok(data.sip_uri)
    }

    async fn set_call_active(&self, call_id: &str) -> Result<(), GatewayError> {
        self.request(
            Method::POST,
            &format!("/calls/{}", call_id),
            Some(&json!({ "state": "active" })),
        )
        .await?;
        Ok(())
    }

    async fn play_audio_loop(&self, call_id: &str, media_url: &str) -> Result<(), GatewayError> {
        self.request(
            Method::POST,
            &format!("/calls/{}/audio", call_id),
            Some(&json!({ "fileUrl": media_url, "loopEnabled": true })),
        )
        .await?;
        Ok(())
    }

    async fn create_bridge(
        &self,
        leg_ids: &[&str],
        mix_audio: bool,
    ) -> Result<String, GatewayError> {
        let response = self
            .request(
                Method::POST,
                "/bridges",
                Some(&json!({ "bridgeAudio": mix_audio, "callIds": leg_ids })),
            )
            .await?;
        created_id(&response)
    }

    async fn originate_call(
        &self,
        from: &str,
        to: &str,
        bridge_id: &str,
        tag: &str,
        callback_url: &str,
    ) -> Result<String, GatewayError> {
        let response = self
            .request(
                Method::POST,
                "/calls",
                Some(&json!({
                    "from": from,
                    "to": to,
                    "bridgeId": bridge_id,
                    "tag": tag,
                    "callbackUrl": callback_url,
                })),
            )
            .await?;
        created_id(&response)
    }

    async fn get_bridge_legs(&self, bridge_id: &str) -> Result<Vec<BridgeLeg>, GatewayError> {
        let response = self
            .request(Method::GET, &format!("/bridges/{}/calls", bridge_id), None)
            .await?;
        response
            .json()
            .await
            .map_err(|e| GatewayError::Permanent(e.to_string()))
    }

    async fn hangup(&self, call_id: &str) -> Result<(), GatewayError> {
        self.request(
            Method::POST,
            &format!("/calls/{}", call_id),
            Some(&json!({ "state": "completed" })),
        )
        .await?;
        Ok(())
    }
}
