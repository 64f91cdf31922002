use serde::{Deserialize, Serialize};

/// One browser user's provisioned telephony resources.
///
/// Created once at onboarding and read-only afterwards; call routing never
/// mutates a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub username: String,
    /// Telephone number allocated to this user's application.
    pub phone_number: String,
    /// SIP/WebRTC endpoint resource id under the configured domain.
    pub endpoint_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterSessionRequest {
    pub phone_number: String,
    pub endpoint_id: String,
}
