use std::sync::Arc;

use axum::extract::ws::Message;
use clap::ValueEnum;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::registry::ConnectionRegistry;
use crate::session::{CloseReason, Session};
use crate::signaling::{Identity, Role, SignalKind, SignalingEnvelope};

/// Chooses the recipient of an offer.
pub trait OfferMatcher: Send + Sync {
    fn select(
        &self,
        registry: &ConnectionRegistry,
        sender: &Session,
        envelope: &SignalingEnvelope,
    ) -> Option<Identity>;
}

/// Routes every offer to the first registered producer other than the sender.
#[derive(Debug, Default)]
pub struct FirstProducer;

impl OfferMatcher for FirstProducer {
    fn select(
        &self,
        registry: &ConnectionRegistry,
        sender: &Session,
        _envelope: &SignalingEnvelope,
    ) -> Option<Identity> {
        registry
            .first_by_role(Role::Producer, Some(sender.identity()))
            .map(|session| session.identity().clone())
    }
}

/// Honours an explicit producer target when the client names one, otherwise
/// behaves like [`FirstProducer`].
#[derive(Debug, Default)]
pub struct ExplicitTarget;

impl OfferMatcher for ExplicitTarget {
    fn select(
        &self,
        registry: &ConnectionRegistry,
        sender: &Session,
        envelope: &SignalingEnvelope,
    ) -> Option<Identity> {
        if let Some(target) = envelope.requested_target() {
            let is_producer = registry
                .lookup(target.as_str())
                .map(|session| session.role() == Role::Producer)
                .unwrap_or(false);
            if is_producer {
                return Some(target.clone());
            }
            debug!(
                sender = %sender.identity(),
                target = %target,
                "offer target is not a registered producer; falling back"
            );
        }
        FirstProducer.select(registry, sender, envelope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OfferPolicy {
    #[default]
    FirstProducer,
    ExplicitTarget,
}

impl OfferPolicy {
    pub fn matcher(self) -> Arc<dyn OfferMatcher> {
        match self {
            OfferPolicy::FirstProducer => Arc::new(FirstProducer),
            OfferPolicy::ExplicitTarget => Arc::new(ExplicitTarget),
        }
    }
}

/// Result of dispatching one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Forwarded { recipient: Identity },
    /// Binary and control frames.
    Ignored,
    Malformed,
    MissingTarget,
    NoProducer,
    SelfTarget,
    RecipientMissing { recipient: Identity },
    DeliveryFailed { recipient: Identity },
}

impl DispatchOutcome {
    fn drop_label(&self) -> Option<&'static str> {
        match self {
            DispatchOutcome::Forwarded { .. } | DispatchOutcome::Ignored => None,
            DispatchOutcome::Malformed => Some("malformed"),
            DispatchOutcome::MissingTarget => Some("missing_target"),
            DispatchOutcome::NoProducer => Some("no_producer"),
            DispatchOutcome::SelfTarget => Some("self_target"),
            DispatchOutcome::RecipientMissing { .. } => Some("recipient_missing"),
            DispatchOutcome::DeliveryFailed { .. } => Some("delivery_failed"),
        }
    }
}

pub struct SignalRouter {
    registry: ConnectionRegistry,
    matcher: Arc<dyn OfferMatcher>,
    evict_unreachable: bool,
}

impl SignalRouter {
    pub fn new(
        registry: ConnectionRegistry,
        matcher: Arc<dyn OfferMatcher>,
        evict_unreachable: bool,
    ) -> Self {
        Self {
            registry,
            matcher,
            evict_unreachable,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Handles one frame read from `sender`'s socket. Frames from one sender
    /// are dispatched in read order; forwarding waits for the recipient's
    /// queue, bounded by the recipient's write timeout.
    pub async fn dispatch(&self, sender: &Session, frame: Message) -> DispatchOutcome {
        let outcome = self.route(sender, frame).await;
        match outcome.drop_label() {
            Some(reason) => {
                counter!("beach_signal_frames_dropped_total", 1, "reason" => reason);
            }
            None if matches!(outcome, DispatchOutcome::Forwarded { .. }) => {
                counter!("beach_signal_frames_forwarded_total", 1);
            }
            None => {}
        }
        outcome
    }

    async fn route(&self, sender: &Session, frame: Message) -> DispatchOutcome {
        let text = match frame {
            Message::Text(text) => text,
            other => {
                debug!(
                    identity = %sender.identity(),
                    frame = frame_label(&other),
                    "ignoring non-text frame"
                );
                return DispatchOutcome::Ignored;
            }
        };

        sender.signal_liveness();

        let mut envelope = match serde_json::from_str::<SignalingEnvelope>(&text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    identity = %sender.identity(),
                    connection_id = %sender.connection_id(),
                    line = err.line(),
                    column = err.column(),
                    error = %err,
                    "dropping malformed signaling frame"
                );
                return DispatchOutcome::Malformed;
            }
        };

        let recipient = match envelope.kind {
            SignalKind::Answer | SignalKind::Candidate => match envelope.requested_target() {
                Some(target) => target.clone(),
                None => {
                    info!(
                        identity = %sender.identity(),
                        kind = envelope.kind.as_str(),
                        "signal without target dropped"
                    );
                    return DispatchOutcome::MissingTarget;
                }
            },
            SignalKind::Offer => match self.matcher.select(&self.registry, sender, &envelope) {
                Some(target) => target,
                None => {
                    info!(identity = %sender.identity(), "no producer available for offer");
                    return DispatchOutcome::NoProducer;
                }
            },
        };

        if &recipient == sender.identity() {
            debug!(identity = %sender.identity(), "refusing to echo signal to sender");
            return DispatchOutcome::SelfTarget;
        }

        envelope.stamp(sender.identity().clone(), recipient.clone());
        self.forward(sender, recipient, &envelope).await
    }

    async fn forward(
        &self,
        sender: &Session,
        recipient: Identity,
        envelope: &SignalingEnvelope,
    ) -> DispatchOutcome {
        let Some(target) = self.registry.lookup(recipient.as_str()) else {
            info!(
                sender = %sender.identity(),
                recipient = %recipient,
                kind = envelope.kind.as_str(),
                "recipient not connected; dropping signal"
            );
            return DispatchOutcome::RecipientMissing { recipient };
        };

        let payload = match serde_json::to_string(envelope) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode signaling envelope");
                return DispatchOutcome::Malformed;
            }
        };

        match target.send(Message::Text(payload)).await {
            Ok(()) => {
                debug!(
                    sender = %sender.identity(),
                    recipient = %recipient,
                    kind = envelope.kind.as_str(),
                    "forwarded signal"
                );
                DispatchOutcome::Forwarded { recipient }
            }
            Err(err) => {
                warn!(
                    sender = %sender.identity(),
                    recipient = %recipient,
                    recipient_connection = %target.connection_id(),
                    error = %err,
                    "failed to deliver signal"
                );
                if self.evict_unreachable {
                    self.registry.remove(recipient.as_str(), &target);
                    target.close(CloseReason::WriteFailed);
                }
                DispatchOutcome::DeliveryFailed { recipient }
            }
        }
    }
}

fn frame_label(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{session, session_with};
    use crate::session::{SessionChannels, SessionConfig};
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Peer {
        session: Arc<Session>,
        channels: SessionChannels,
    }

    impl Peer {
        fn join(registry: &ConnectionRegistry, identity: &str, role: Role) -> Self {
            let (session, channels) = session(identity, role);
            registry.register(Arc::clone(&session));
            Self { session, channels }
        }

        fn take(&mut self) -> Option<Value> {
            match self.channels.outbound.try_recv() {
                Ok(Message::Text(text)) => Some(serde_json::from_str(&text).expect("json")),
                Ok(other) => panic!("unexpected frame {other:?}"),
                Err(_) => None,
            }
        }
    }

    fn router(registry: &ConnectionRegistry) -> SignalRouter {
        SignalRouter::new(registry.clone(), OfferPolicy::FirstProducer.matcher(), true)
    }

    fn text(value: Value) -> Message {
        Message::Text(value.to_string())
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_answer_candidate_exchange() {
        let registry = ConnectionRegistry::new();
        let router = router(&registry);
        let mut producer = Peer::join(&registry, "A", Role::Producer);
        let mut consumer = Peer::join(&registry, "B", Role::Consumer);
        let mut bystander = Peer::join(&registry, "C", Role::Consumer);

        let outcome = router
            .dispatch(
                &consumer.session,
                text(json!({"type": "offer", "offer": {"sdp": "v=0 offer"}, "token": "t"})),
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::Forwarded { recipient: "A".into() });
        let offer = producer.take().expect("offer delivered");
        assert_eq!(offer["type"], "offer");
        assert_eq!(offer["offer"]["type"], "offer");
        assert_eq!(offer["userMessage"]["sender"], "B");
        assert_eq!(offer["userMessage"]["target"], "A");
        assert!(offer.get("token").is_none());

        let outcome = router
            .dispatch(
                &producer.session,
                text(json!({
                    "type": "answer",
                    "offer": {"sdp": "v=0 answer"},
                    "userMessage": {"target": "B", "sender": "spoofed"}
                })),
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::Forwarded { recipient: "B".into() });
        let answer = consumer.take().expect("answer delivered");
        assert_eq!(answer["userMessage"]["sender"], "A");
        assert_eq!(answer["offer"]["type"], "answer");

        let outcome = router
            .dispatch(
                &consumer.session,
                text(json!({
                    "type": "candidate",
                    "candidate": {"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0},
                    "userMessage": {"target": "A"}
                })),
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::Forwarded { recipient: "A".into() });
        let candidate = producer.take().expect("candidate delivered");
        assert_eq!(candidate["candidate"]["candidate"], "candidate:1");
        assert_eq!(candidate["userMessage"]["sender"], "B");

        assert!(producer.take().is_none());
        assert!(consumer.take().is_none());
        assert!(bystander.take().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_without_producer_is_dropped() {
        let registry = ConnectionRegistry::new();
        let router = router(&registry);
        let consumer = Peer::join(&registry, "B", Role::Consumer);
        let mut other = Peer::join(&registry, "C", Role::Consumer);

        let outcome = router
            .dispatch(&consumer.session, text(json!({"type": "offer", "offer": {"sdp": "x"}})))
            .await;
        assert_eq!(outcome, DispatchOutcome::NoProducer);
        assert!(other.take().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_goes_to_exactly_one_producer() {
        let registry = ConnectionRegistry::new();
        let router = router(&registry);
        let mut first = Peer::join(&registry, "P1", Role::Producer);
        let mut second = Peer::join(&registry, "P2", Role::Producer);
        let consumer = Peer::join(&registry, "B", Role::Consumer);

        let outcome = router
            .dispatch(&consumer.session, text(json!({"type": "offer", "offer": {"sdp": "x"}})))
            .await;
        assert!(matches!(outcome, DispatchOutcome::Forwarded { .. }));

        let delivered = [first.take(), second.take()]
            .into_iter()
            .flatten()
            .count();
        assert_eq!(delivered, 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn producer_offer_never_routes_to_itself() {
        let registry = ConnectionRegistry::new();
        let router = router(&registry);
        let mut producer = Peer::join(&registry, "A", Role::Producer);

        let outcome = router
            .dispatch(&producer.session, text(json!({"type": "offer", "offer": {"sdp": "x"}})))
            .await;
        assert_eq!(outcome, DispatchOutcome::NoProducer);
        assert!(producer.take().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn self_targeted_answer_is_refused() {
        let registry = ConnectionRegistry::new();
        let router = router(&registry);
        let mut consumer = Peer::join(&registry, "B", Role::Consumer);

        let outcome = router
            .dispatch(
                &consumer.session,
                text(json!({
                    "type": "answer",
                    "offer": {"sdp": "x"},
                    "userMessage": {"target": "B"}
                })),
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::SelfTarget);
        assert!(consumer.take().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_and_unknown_targets_are_dropped() {
        let registry = ConnectionRegistry::new();
        let router = router(&registry);
        let consumer = Peer::join(&registry, "B", Role::Consumer);

        let outcome = router
            .dispatch(
                &consumer.session,
                text(json!({"type": "candidate", "candidate": {"candidate": "c"}})),
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::MissingTarget);

        let outcome = router
            .dispatch(
                &consumer.session,
                text(json!({
                    "type": "candidate",
                    "candidate": {"candidate": "c"},
                    "userMessage": {"target": "ghost"}
                })),
            )
            .await;
        assert_eq!(
            outcome,
            DispatchOutcome::RecipientMissing { recipient: "ghost".into() }
        );
        assert!(!consumer.session.is_closed());
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_frame_is_dropped_and_next_frame_routes() {
        let registry = ConnectionRegistry::new();
        let router = router(&registry);
        let mut producer = Peer::join(&registry, "A", Role::Producer);
        let mut consumer = Peer::join(&registry, "B", Role::Consumer);

        let outcome = router
            .dispatch(&consumer.session, Message::Text("{not json".to_string()))
            .await;
        assert_eq!(outcome, DispatchOutcome::Malformed);
        assert!(!consumer.session.is_closed());
        // Unparsable text still counts as traffic from a live peer.
        assert!(consumer.channels.liveness.try_recv().is_ok());

        let outcome = router
            .dispatch(&consumer.session, text(json!({"type": "offer", "offer": {"sdp": "x"}})))
            .await;
        assert_eq!(outcome, DispatchOutcome::Forwarded { recipient: "A".into() });
        assert!(producer.take().is_some());
    }

    #[test_timeout::tokio_timeout_test]
    async fn non_text_frames_are_ignored_without_liveness() {
        let registry = ConnectionRegistry::new();
        let router = router(&registry);
        let mut consumer = Peer::join(&registry, "B", Role::Consumer);

        for frame in [
            Message::Binary(vec![1, 2, 3]),
            Message::Ping(Vec::new()),
            Message::Pong(Vec::new()),
        ] {
            assert_eq!(router.dispatch(&consumer.session, frame).await, DispatchOutcome::Ignored);
        }
        assert!(consumer.channels.liveness.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn unreachable_recipient_is_evicted() {
        let registry = ConnectionRegistry::new();
        let router = router(&registry);
        let consumer = Peer::join(&registry, "B", Role::Consumer);
        let Peer { session: producer, channels } = Peer::join(&registry, "A", Role::Producer);
        drop(channels);

        let outcome = router
            .dispatch(&consumer.session, text(json!({"type": "offer", "offer": {"sdp": "x"}})))
            .await;
        assert_eq!(outcome, DispatchOutcome::DeliveryFailed { recipient: "A".into() });
        assert_eq!(producer.close_reason(), Some(CloseReason::WriteFailed));
        assert!(registry.lookup("A").is_none());
        assert!(!consumer.session.is_closed());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn stalled_recipient_kept_when_eviction_disabled() {
        let registry = ConnectionRegistry::new();
        let router =
            SignalRouter::new(registry.clone(), OfferPolicy::FirstProducer.matcher(), false);
        let consumer = Peer::join(&registry, "B", Role::Consumer);
        let config = SessionConfig {
            outbound_buffer: 1,
            liveness_buffer: 1,
            write_timeout: Duration::from_millis(100),
        };
        let (producer, _producer_channels) = session_with("A", Role::Producer, &config);
        registry.register(Arc::clone(&producer));

        let offer = json!({"type": "offer", "offer": {"sdp": "x"}});
        assert!(matches!(
            router.dispatch(&consumer.session, text(offer.clone())).await,
            DispatchOutcome::Forwarded { .. }
        ));
        assert_eq!(
            router.dispatch(&consumer.session, text(offer)).await,
            DispatchOutcome::DeliveryFailed { recipient: "A".into() }
        );
        assert!(!producer.is_closed());
        assert!(registry.lookup("A").is_some());
    }

    #[test_timeout::tokio_timeout_test]
    async fn explicit_target_policy_prefers_named_producer() {
        let registry = ConnectionRegistry::new();
        let router =
            SignalRouter::new(registry.clone(), OfferPolicy::ExplicitTarget.matcher(), true);
        let mut first = Peer::join(&registry, "P1", Role::Producer);
        let mut second = Peer::join(&registry, "P2", Role::Producer);
        let consumer = Peer::join(&registry, "B", Role::Consumer);

        for _ in 0..3 {
            let outcome = router
                .dispatch(
                    &consumer.session,
                    text(json!({
                        "type": "offer",
                        "offer": {"sdp": "x"},
                        "userMessage": {"target": "P2"}
                    })),
                )
                .await;
            assert_eq!(outcome, DispatchOutcome::Forwarded { recipient: "P2".into() });
        }
        assert!(first.take().is_none());
        assert!(second.take().is_some());

        // Naming a consumer falls back to the first producer.
        let outcome = router
            .dispatch(
                &consumer.session,
                text(json!({
                    "type": "offer",
                    "offer": {"sdp": "x"},
                    "userMessage": {"target": "B"}
                })),
            )
            .await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Forwarded { recipient } if recipient.as_str().starts_with('P')
        ));
    }
}
