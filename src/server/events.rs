//! Webhook event classification
//!
//! Catapult delivers loosely shaped JSON bodies. This module turns a raw
//! body into a closed [`CallEvent`] variant once, so the call router can
//! switch exhaustively instead of sniffing payload shapes.

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("malformed event payload: {0}")]
    Malformed(String),
}

/// Normalized webhook notification.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEvent {
    pub kind: CallEventKind,
    /// Provider-assigned id of the leg that generated the event.
    pub call_id: String,
    pub from: Option<String>,
    pub to: Option<String>,
    /// Opaque marker stamped onto legs the router originates and echoed
    /// back by the provider. Presence means the leg is already bridged.
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEventKind {
    IncomingCall,
    Hangup,
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    event_type: String,
    call_id: Option<String>,
    from: Option<String>,
    to: Option<String>,
    tag: Option<String>,
}

/// Classify a raw webhook body into a [`CallEvent`].
///
/// Bodies that cannot be parsed, or that lack the fields their kind
/// requires, fail with [`EventError::Malformed`]; the webhook handler logs
/// and drops those while still acknowledging the provider.
pub fn classify(body: &[u8]) -> Result<CallEvent, EventError> {
    let raw: RawEvent =
        serde_json::from_slice(body).map_err(|e| EventError::Malformed(e.to_string()))?;

    let kind = match raw.event_type.as_str() {
        "incomingcall" => CallEventKind::IncomingCall,
        "hangup" => CallEventKind::Hangup,
        _ => CallEventKind::Other,
    };

    let call_id = raw.call_id.ok_or_else(|| {
        EventError::Malformed(format!("{} event without callId", raw.event_type))
    })?;

    if kind == CallEventKind::IncomingCall && (raw.from.is_none() || raw.to.is_none()) {
        return Err(EventError::Malformed(
            "incomingcall event without from/to".to_string(),
        ));
    }

    Ok(CallEvent {
        kind,
        call_id,
        from: raw.from,
        to: raw.to,
        tag: raw.tag,
    })
}
