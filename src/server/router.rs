//! Call-event routing and bridge correlation
//!
//! The state machine at the heart of the demo. Each leg moves through
//! ringing, bridged, and terminated states, but the router never tracks a
//! state object: it infers where a leg is from the event kind and whether
//! a correlation entry exists for the leg's call id.
//!
//! On a fresh incoming call the router answers the leg, plays looped ring
//! audio, wraps the leg in a mixing bridge, and originates the second leg
//! toward the other side of the conversation. On hangup it tears down
//! whatever legs of that bridge are still up.

use std::sync::Arc;

use thiserror::Error;

use super::catapult::{GatewayError, TelephonyGateway};
use super::events::{CallEvent, CallEventKind};
use super::store::{SessionStore, StoreError, LONG_CORRELATION_TTL, SHORT_CORRELATION_TTL};
use crate::config::AppConfig;
use crate::models::Session;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Routes classified call events against the provider control plane.
pub struct CallRouter {
    gateway: Arc<dyn TelephonyGateway>,
    store: Arc<dyn SessionStore>,
    config: Arc<AppConfig>,
}

impl CallRouter {
    pub fn new(
        gateway: Arc<dyn TelephonyGateway>,
        store: Arc<dyn SessionStore>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            gateway,
            store,
            config,
        }
    }

    /// Dispatch one classified event for `session`.
    pub async fn route(&self, event: &CallEvent, session: &Session) -> Result<(), RouterError> {
        match event.kind {
            CallEventKind::IncomingCall => self.handle_incoming_call(event, session).await,
            CallEventKind::Hangup => self.handle_hangup(event).await,
            CallEventKind::Other => {
                tracing::debug!("unhandled event for call {}", event.call_id);
                Ok(())
            }
        }
    }

    async fn handle_incoming_call(
        &self,
        event: &CallEvent,
        session: &Session,
    ) -> Result<(), RouterError> {
        // A tagged incoming-call event is the answer confirmation for a leg
        // we originated ourselves; that leg is already on its bridge.
        if event.tag.is_some() {
            tracing::debug!("ignoring tagged event for call {}", event.call_id);
            return Ok(());
        }

        let mut from = event.from.clone().unwrap_or_default();
        let mut to = event.to.clone().unwrap_or_default();

        if to == session.phone_number {
            // Inbound from the network: route to the user's endpoint.
            to = self
                .gateway
                .resolve_endpoint_address(&session.endpoint_id)
                .await?;
        } else {
            // Originated from the endpoint, or an unrecognized destination:
            // dial out with the user's number as caller id.
            from = session.phone_number.clone();
        }

        self.gateway.set_call_active(&event.call_id).await?;

        // Keep the caller engaged while the second leg is established.
        // Playback failure is not fatal to the bridge.
        if let Err(e) = self
            .gateway
            .play_audio_loop(&event.call_id, &self.config.ring_media_url())
            .await
        {
            tracing::warn!("failed to start ring audio on call {}: {}", event.call_id, e);
        }

        let bridge_id = self
            .gateway
            .create_bridge(&[event.call_id.as_str()], true)
            .await?;
        self.store
            .put_bridge(&event.call_id, &bridge_id, SHORT_CORRELATION_TTL)
            .await?;

        // Tag the outbound leg with the inbound leg's call id so its answer
        // confirmation is recognized above, and point its callbacks back at
        // this session.
        let callback_url = self.config.callback_url(&session.username);
        let new_call_id = self
            .gateway
            .originate_call(&from, &to, &bridge_id, &event.call_id, &callback_url)
            .await?;

        self.store
            .put_bridge(&new_call_id, &bridge_id, LONG_CORRELATION_TTL)
            .await?;

        tracing::info!(
            "bridged call {} with new leg {} on bridge {}",
            event.call_id,
            new_call_id,
            bridge_id
        );
        Ok(())
    }

    async fn handle_hangup(&self, event: &CallEvent) -> Result<(), RouterError> {
        // The atomic remove doubles as the duplicate-delivery guard: a
        // redelivered hangup finds no entry and falls through.
        let Some(bridge_id) = self.store.take_bridge(&event.call_id).await? else {
            tracing::debug!("no bridge correlated with call {}", event.call_id);
            return Ok(());
        };

        // Terminate whichever legs of the bridge are still up so nobody is
        // left connected to dead air.
        let legs = self.gateway.get_bridge_legs(&bridge_id).await?;
        for leg in legs.iter().filter(|leg| leg.is_active()) {
            tracing::info!("hanging up surviving leg {} of bridge {}", leg.id, bridge_id);
            self.gateway.hangup(&leg.id).await?;
            self.store.take_bridge(&leg.id).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::catapult::BridgeLeg;
    use crate::server::store::FileBackedStore;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Gateway fake that records every command it is asked to issue.
    struct MockGateway {
        commands: Mutex<Vec<String>>,
        bridge_legs: Mutex<Vec<BridgeLeg>>,
    }

    impl MockGateway {
        fn new() -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                bridge_legs: Mutex::new(Vec::new()),
            }
        }

        fn with_legs(legs: Vec<BridgeLeg>) -> Self {
            let gateway = Self::new();
            *gateway.bridge_legs.lock().unwrap() = legs;
            gateway
        }

        fn record(&self, command: String) {
            self.commands.lock().unwrap().push(command);
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        fn hangup_count(&self) -> usize {
            self.commands()
                .iter()
                .filter(|c| c.starts_with("hangup:"))
                .count()
        }
    }

    #[async_trait]
    impl TelephonyGateway for MockGateway {
        async fn resolve_endpoint_address(
            &self,
            endpoint_id: &str,
        ) -> Result<String, GatewayError> {
            self.record(format!("resolve:{}", endpoint_id));
            Ok(format!("sip:{}@test.example.net", endpoint_id))
        }

        async fn set_call_active(&self, call_id: &str) -> Result<(), GatewayError> {
            self.record(format!("active:{}", call_id));
            Ok(())
        }

        async fn play_audio_loop(
            &self,
            call_id: &str,
            _media_url: &str,
        ) -> Result<(), GatewayError> {
            self.record(format!("audio:{}", call_id));
            Ok(())
        }

        async fn create_bridge(
            &self,
            leg_ids: &[&str],
            _mix_audio: bool,
        ) -> Result<String, GatewayError> {
            self.record(format!("bridge:{}", leg_ids.join(",")));
            Ok("b1".to_string())
        }

        async fn originate_call(
            &self,
            from: &str,
            to: &str,
            bridge_id: &str,
            tag: &str,
            _callback_url: &str,
        ) -> Result<String, GatewayError> {
            self.record(format!(
                "originate:{}>{}:bridge={}:tag={}",
                from, to, bridge_id, tag
            ));
            Ok("c2".to_string())
        }

        async fn get_bridge_legs(&self, bridge_id: &str) -> Result<Vec<BridgeLeg>, GatewayError> {
            self.record(format!("legs:{}", bridge_id));
            Ok(self.bridge_legs.lock().unwrap().clone())
        }

        async fn hangup(&self, call_id: &str) -> Result<(), GatewayError> {
            self.record(format!("hangup:{}", call_id));
            Ok(())
        }
    }

    fn test_config() -> Arc<AppConfig> {
        Arc::new(AppConfig {
            catapult_user_id: "u-test".to_string(),
            catapult_api_token: "t-test".to_string(),
            catapult_api_secret: "s-test".to_string(),
            catapult_domain_id: "d-test".to_string(),
            base_url: "http://localhost:3000".to_string(),
            port: 3000,
            store_path: "unused".to_string(),
        })
    }

    fn alice() -> Session {
        Session {
            username: "alice".to_string(),
            phone_number: "+19195551234".to_string(),
            endpoint_id: "ep-1".to_string(),
        }
    }

    fn incoming_call(call_id: &str, from: &str, to: &str, tag: Option<&str>) -> CallEvent {
        CallEvent {
            kind: CallEventKind::IncomingCall,
            call_id: call_id.to_string(),
            from: Some(from.to_string()),
            to: Some(to.to_string()),
            tag: tag.map(str::to_string),
        }
    }

    fn hangup(call_id: &str) -> CallEvent {
        CallEvent {
            kind: CallEventKind::Hangup,
            call_id: call_id.to_string(),
            from: None,
            to: None,
            tag: None,
        }
    }

    async fn test_store(name: &str) -> Arc<FileBackedStore> {
        let path: PathBuf =
            std::env::temp_dir().join(format!("webrtc_bridge_router_test_{}.json", name));
        let _ = std::fs::remove_file(&path);
        Arc::new(FileBackedStore::load(&path).await.unwrap())
    }

    fn make_router(gateway: Arc<MockGateway>, store: Arc<FileBackedStore>) -> CallRouter {
        CallRouter::new(gateway, store, test_config())
    }

    #[tokio::test]
    async fn test_inbound_call_routes_to_endpoint() {
        let gateway = Arc::new(MockGateway::new());
        let store = test_store("inbound").await;
        let router = make_router(gateway.clone(), store.clone());

        // Called from the network on alice's own number.
        let event = incoming_call("c1", "+19195550000", "+19195551234", None);
        router.route(&event, &alice()).await.unwrap();

        let commands = gateway.commands();
        assert_eq!(
            commands,
            vec![
                "resolve:ep-1",
                "active:c1",
                "audio:c1",
                "bridge:c1",
                "originate:+19195550000>sip:ep-1@test.example.net:bridge=b1:tag=c1",
            ]
        );

        // Both legs correlated with the bridge.
        assert_eq!(store.get_bridge("c1").await.unwrap(), Some("b1".to_string()));
        assert_eq!(store.get_bridge("c2").await.unwrap(), Some("b1".to_string()));
    }

    #[tokio::test]
    async fn test_outbound_call_uses_session_number_as_caller_id() {
        let gateway = Arc::new(MockGateway::new());
        let store = test_store("outbound").await;
        let router = make_router(gateway.clone(), store.clone());

        // Dialed out from alice's endpoint toward a PSTN number.
        let event = incoming_call("c1", "sip-alice@webrtc.example.net", "+19995550000", None);
        router.route(&event, &alice()).await.unwrap();

        let commands = gateway.commands();
        // No endpoint resolution on this path; the caller id is replaced.
        assert!(commands
            .contains(&"originate:+19195551234>+19995550000:bridge=b1:tag=c1".to_string()));
        assert!(!commands.iter().any(|c| c.starts_with("resolve:")));
    }

    #[tokio::test]
    async fn test_unmatched_destination_defaults_to_outbound() {
        let gateway = Arc::new(MockGateway::new());
        let store = test_store("unmatched").await;
        let router = make_router(gateway.clone(), store.clone());

        // `to` is neither alice's number nor anything we recognize.
        let event = incoming_call("c1", "+15550001111", "+15550002222", None);
        router.route(&event, &alice()).await.unwrap();

        assert!(gateway
            .commands()
            .contains(&"originate:+19195551234>+15550002222:bridge=b1:tag=c1".to_string()));
    }

    #[tokio::test]
    async fn test_tagged_event_creates_nothing() {
        let gateway = Arc::new(MockGateway::new());
        let store = test_store("tagged").await;
        let router = make_router(gateway.clone(), store.clone());

        // Answer confirmation for the leg we originated ourselves.
        let event = incoming_call("c2", "+19195550000", "sip:ep-1@test.example.net", Some("c1"));
        router.route(&event, &alice()).await.unwrap();

        assert!(gateway.commands().is_empty());
        assert_eq!(store.get_bridge("c2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_hangup_without_correlation_is_noop() {
        let gateway = Arc::new(MockGateway::new());
        let store = test_store("noop_hangup").await;
        let router = make_router(gateway.clone(), store.clone());

        router.route(&hangup("c-stale"), &alice()).await.unwrap();

        assert!(gateway.commands().is_empty());
    }

    #[tokio::test]
    async fn test_hangup_terminates_only_surviving_legs() {
        let gateway = Arc::new(MockGateway::with_legs(vec![
            BridgeLeg {
                id: "c1".to_string(),
                state: "completed".to_string(),
            },
            BridgeLeg {
                id: "c2".to_string(),
                state: "active".to_string(),
            },
        ]));
        let store = test_store("surviving_legs").await;
        let router = make_router(gateway.clone(), store.clone());

        store
            .put_bridge("c1", "b1", SHORT_CORRELATION_TTL)
            .await
            .unwrap();
        store
            .put_bridge("c2", "b1", LONG_CORRELATION_TTL)
            .await
            .unwrap();

        router.route(&hangup("c1"), &alice()).await.unwrap();

        assert_eq!(gateway.commands(), vec!["legs:b1", "hangup:c2"]);
        assert_eq!(store.get_bridge("c1").await.unwrap(), None);
        assert_eq!(store.get_bridge("c2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_hangups_issue_at_most_one_hangup() {
        let gateway = Arc::new(MockGateway::with_legs(vec![BridgeLeg {
            id: "c2".to_string(),
            state: "active".to_string(),
        }]));
        let store = test_store("duplicate_hangup").await;
        let router = Arc::new(make_router(gateway.clone(), store.clone()));

        store
            .put_bridge("c1", "b1", SHORT_CORRELATION_TTL)
            .await
            .unwrap();

        // The provider redelivers the same hangup; both invocations race.
        let first = {
            let router = router.clone();
            tokio::spawn(async move { router.route(&hangup("c1"), &alice()).await })
        };
        let second = {
            let router = router.clone();
            tokio::spawn(async move { router.route(&hangup("c1"), &alice()).await })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(gateway.hangup_count(), 1);
    }

    #[tokio::test]
    async fn test_incoming_then_hangup_scenario() {
        // Full lifecycle: inbound call bridged, then the inbound leg hangs
        // up and the outbound leg is torn down.
        let gateway = Arc::new(MockGateway::new());
        let store = test_store("scenario").await;
        let router = make_router(gateway.clone(), store.clone());

        let event = incoming_call("c1", "+19195550000", "+19195551234", None);
        router.route(&event, &alice()).await.unwrap();

        *gateway.bridge_legs.lock().unwrap() = vec![
            BridgeLeg {
                id: "c1".to_string(),
                state: "completed".to_string(),
            },
            BridgeLeg {
                id: "c2".to_string(),
                state: "active".to_string(),
            },
        ];

        router.route(&hangup("c1"), &alice()).await.unwrap();

        assert_eq!(gateway.hangup_count(), 1);
        assert!(gateway.commands().contains(&"hangup:c2".to_string()));
        assert_eq!(store.get_bridge("c1").await.unwrap(), None);
        assert_eq!(store.get_bridge("c2").await.unwrap(), None);
    }
}
