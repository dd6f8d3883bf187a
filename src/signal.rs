//! Протокол событий и координатор сигналинга WebRTC (SDP, ICE кандидаты).
//!
//! Координатор ничего не проверяет в содержимом offer/answer/ICE: он
//! пересылает их как есть участникам той же комнаты и ведёт состояние
//! согласования для каждой упорядоченной пары сессий.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::IcePolicy;
use crate::error::RelayError;
use crate::playback::AudioFormat;
use crate::room::{short, Room, RoomRegistry};

pub type SessionId = String;

// ---- Клиент -> сервер ----

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom(String),
    LeaveRoom,
    Offer(OfferPayload),
    Answer(AnswerPayload),
    IceCandidate(IcePayload),
    AudioChunk(AudioChunkPayload),
    SetTranslation(TranslationSettings),
    MediaError(MediaErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub offer: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<SessionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub answer: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<SessionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IcePayload {
    pub candidate: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<SessionId>,
}

/// Чанк аудио на входе: либо голая base64-строка, либо объект.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AudioChunkPayload {
    Raw(String),
    Structured(StructuredAudio),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredAudio {
    pub audio: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<AudioFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationSettings {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaErrorPayload {
    pub message: String,
}

// ---- Сервер -> клиент ----

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Joined(JoinedPayload),
    UserJoined(PeerPayload),
    PeerLeft(PeerPayload),
    Offer(RelayedOffer),
    Answer(RelayedAnswer),
    IceCandidate(RelayedIce),
    IncomingAudio(IncomingAudio),
    TranslatedAudioChunk(TranslatedAudio),
    NewTranscription(TranscriptEvent),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedPayload {
    pub room_id: String,
    pub session_id: SessionId,
    pub members: Vec<SessionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerPayload {
    pub peer: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedOffer {
    pub offer: Value,
    pub from: SessionId,
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayedAnswer {
    pub answer: Value,
    pub from: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayedIce {
    pub candidate: Value,
    pub from: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingAudio {
    pub audio: String,
    pub sender: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatedAudio {
    pub audio: String,
    pub format: AudioFormat,
    pub sender: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    pub sender: SessionId,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

impl From<&RelayError> for ServerEvent {
    fn from(e: &RelayError) -> Self {
        ServerEvent::Error(ErrorPayload {
            kind: e.kind().to_string(),
            message: e.to_string(),
        })
    }
}

// ---- Состояние согласования ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    #[default]
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    Connected,
    Closed,
}

/// Состояние одной упорядоченной пары (от кого, к кому)
#[derive(Debug, Clone, Default)]
pub struct PeerDescriptor {
    pub state: PeerState,
    /// ICE-кандидаты, пришедшие до offer (только при `IcePolicy::Buffer`)
    pending_ice: Vec<Value>,
}

impl PeerDescriptor {
    /// Было ли уже отправлено или получено предложение
    fn negotiating(&self) -> bool {
        !matches!(self.state, PeerState::Idle | PeerState::Closed)
    }

    pub fn close(&mut self) {
        self.state = PeerState::Closed;
        self.pending_ice.clear();
    }

    pub fn pending_ice(&self) -> usize {
        self.pending_ice.len()
    }
}

fn descriptor<'a>(room: &'a mut Room, from: &str, to: &str) -> &'a mut PeerDescriptor {
    room.peers
        .entry((from.to_string(), to.to_string()))
        .or_default()
}

/// Чистая пересылка сигналов с рассылкой в пределах комнаты
pub struct SignalingCoordinator {
    registry: RoomRegistry,
    ice_policy: IcePolicy,
}

impl SignalingCoordinator {
    pub fn new(registry: RoomRegistry, ice_policy: IcePolicy) -> Self {
        Self {
            registry,
            ice_policy,
        }
    }

    /// Пересылает offer всем остальным участникам (или одному `to`).
    /// Возвращает число получателей.
    pub async fn offer(
        &self,
        from: &str,
        room_id: &str,
        offer: Value,
        to: Option<&str>,
    ) -> Result<usize, RelayError> {
        self.registry
            .with_room(room_id, |room| -> Result<usize, RelayError> {
                let targets = targets(room, from, to)?;
                let mut delivered = 0;
                for target in &targets {
                    let event = ServerEvent::Offer(RelayedOffer {
                        offer: offer.clone(),
                        from: from.to_string(),
                        room_id: room_id.to_string(),
                    });
                    if !room.send_to(target, event) {
                        continue;
                    }
                    delivered += 1;

                    // новое согласование: буфер кандидатов относится к нему
                    let buffered = {
                        let outgoing = descriptor(room, from, target);
                        outgoing.state = PeerState::OfferSent;
                        std::mem::take(&mut outgoing.pending_ice)
                    };
                    descriptor(room, target, from).state = PeerState::OfferReceived;

                    for candidate in buffered {
                        room.send_to(
                            target,
                            ServerEvent::IceCandidate(RelayedIce {
                                candidate,
                                from: from.to_string(),
                            }),
                        );
                    }
                }
                debug!("offer от {} доставлен {} пирам", short(from), delivered);
                Ok(delivered)
            })
            .await
            .unwrap_or_else(|| Err(RelayError::NegotiationStale(room_id.to_string())))
    }

    /// Пересылает answer автору исходного offer
    pub async fn answer(
        &self,
        from: &str,
        room_id: &str,
        answer: Value,
        to: Option<&str>,
    ) -> Result<SessionId, RelayError> {
        self.registry
            .with_room(room_id, |room| -> Result<SessionId, RelayError> {
                if !room.contains(from) {
                    return Err(RelayError::NegotiationStale(from.to_string()));
                }
                let offerer = match to {
                    Some(to) => to.to_string(),
                    None => room
                        .members()
                        .iter()
                        .map(|m| m.id.clone())
                        .find(|id| {
                            room.peer_state(id, from).map(|d| d.state)
                                == Some(PeerState::OfferSent)
                        })
                        .ok_or_else(|| RelayError::NegotiationStale(from.to_string()))?,
                };

                let event = ServerEvent::Answer(RelayedAnswer {
                    answer,
                    from: from.to_string(),
                });
                if !room.send_to(&offerer, event) {
                    return Err(RelayError::NegotiationStale(offerer));
                }

                descriptor(room, from, &offerer).state = PeerState::AnswerSent;
                descriptor(room, &offerer, from).state = PeerState::Connected;
                debug!("answer от {} доставлен {}", short(from), short(&offerer));
                Ok(offerer)
            })
            .await
            .unwrap_or_else(|| Err(RelayError::NegotiationStale(room_id.to_string())))
    }

    /// Пересылает ICE-кандидата. До обмена offer/answer кандидат
    /// отбрасывается или буферизуется, в зависимости от политики.
    pub async fn ice_candidate(
        &self,
        from: &str,
        room_id: &str,
        candidate: Value,
        to: Option<&str>,
    ) -> Result<usize, RelayError> {
        let policy = self.ice_policy;
        self.registry
            .with_room(room_id, |room| -> Result<usize, RelayError> {
                let targets = targets(room, from, to)?;
                let mut delivered = 0;
                for target in &targets {
                    let outgoing = descriptor(room, from, target);
                    if !outgoing.negotiating() {
                        match policy {
                            IcePolicy::Discard => {
                                debug!("ICE от {} до offer: отброшен", short(from));
                            }
                            IcePolicy::Buffer => outgoing.pending_ice.push(candidate.clone()),
                        }
                        continue;
                    }

                    let event = ServerEvent::IceCandidate(RelayedIce {
                        candidate: candidate.clone(),
                        from: from.to_string(),
                    });
                    if room.send_to(target, event) {
                        delivered += 1;
                        // кандидат от инициатора завершает согласование у отвечающего
                        let incoming = descriptor(room, target, from);
                        if incoming.state == PeerState::AnswerSent {
                            incoming.state = PeerState::Connected;
                        }
                    }
                }
                Ok(delivered)
            })
            .await
            .unwrap_or_else(|| Err(RelayError::NegotiationStale(room_id.to_string())))
    }
}

/// Получатели сигнала: указанный `to` или все остальные участники
fn targets(room: &Room, from: &str, to: Option<&str>) -> Result<Vec<SessionId>, RelayError> {
    if !room.contains(from) {
        return Err(RelayError::NegotiationStale(from.to_string()));
    }
    match to {
        Some(to) if to == from => Ok(Vec::new()),
        Some(to) if room.contains(to) => Ok(vec![to.to_string()]),
        Some(to) => Err(RelayError::NegotiationStale(to.to_string())),
        None => Ok(room
            .members()
            .iter()
            .filter(|m| m.id != from)
            .map(|m| m.id.clone())
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    async fn room_with(
        registry: &RoomRegistry,
        ids: &[&str],
    ) -> Vec<UnboundedReceiver<ServerEvent>> {
        let mut receivers = Vec::new();
        for id in ids {
            let (tx, rx) = mpsc::unbounded_channel();
            registry.register(id.to_string(), tx).await;
            registry.join(id, "123").await.unwrap();
            receivers.push(rx);
        }
        for rx in receivers.iter_mut() {
            while rx.try_recv().is_ok() {}
        }
        receivers
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    async fn state(registry: &RoomRegistry, from: &str, to: &str) -> Option<PeerState> {
        registry
            .with_room("123", |room| room.peer_state(from, to).map(|d| d.state))
            .await
            .flatten()
    }

    async fn pending(registry: &RoomRegistry, from: &str, to: &str) -> Option<usize> {
        registry
            .with_room("123", |room| room.peer_state(from, to).map(|d| d.pending_ice()))
            .await
            .flatten()
    }

    #[test]
    fn test_client_event_wire_format() {
        let join: ClientEvent =
            serde_json::from_str(r#"{"event":"join-room","data":"123"}"#).unwrap();
        assert!(matches!(join, ClientEvent::JoinRoom(ref r) if r == "123"));

        let offer: ClientEvent = serde_json::from_str(
            r#"{"event":"offer","data":{"offer":{"type":"offer","sdp":"v=0"},"roomId":"123"}}"#,
        )
        .unwrap();
        match offer {
            ClientEvent::Offer(p) => {
                assert_eq!(p.room_id.as_deref(), Some("123"));
                assert_eq!(p.offer["sdp"], "v=0");
            }
            other => panic!("неожиданное событие {:?}", other),
        }

        let leave: ClientEvent = serde_json::from_str(r#"{"event":"leave-room"}"#).unwrap();
        assert!(matches!(leave, ClientEvent::LeaveRoom));
    }

    #[test]
    fn test_audio_payload_shapes() {
        let raw: ClientEvent =
            serde_json::from_str(r#"{"event":"audio-chunk","data":"AAE="}"#).unwrap();
        assert!(matches!(raw, ClientEvent::AudioChunk(AudioChunkPayload::Raw(_))));

        let structured: ClientEvent = serde_json::from_str(
            r#"{"event":"audio-chunk","data":{"audio":"AAE=","roomId":"123","targetLanguage":"en","seq":4}}"#,
        )
        .unwrap();
        match structured {
            ClientEvent::AudioChunk(AudioChunkPayload::Structured(s)) => {
                assert_eq!(s.target_language.as_deref(), Some("en"));
                assert_eq!(s.seq, Some(4));
            }
            other => panic!("неожиданное событие {:?}", other),
        }
    }

    #[test]
    fn test_server_event_wire_format() {
        let event = ServerEvent::NewTranscription(TranscriptEvent {
            text: "hello".to_string(),
            sender: "a".to_string(),
            sequence: 0,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "new-transcription");
        assert_eq!(json["data"]["sender"], "a");

        let json = serde_json::to_value(ServerEvent::UserJoined(PeerPayload {
            peer: "b".to_string(),
        }))
        .unwrap();
        assert_eq!(json["event"], "user-joined");
    }

    #[tokio::test]
    async fn test_offer_relayed_only_to_other_peer() {
        let registry = RoomRegistry::new();
        let mut rx = room_with(&registry, &["a", "b"]).await;
        let coordinator = SignalingCoordinator::new(registry.clone(), IcePolicy::Discard);

        let sdp = json!({"type": "offer", "sdp": "v=0 original"});
        let delivered = coordinator.offer("a", "123", sdp.clone(), None).await.unwrap();
        assert_eq!(delivered, 1);

        assert!(drain(&mut rx[0]).is_empty());
        let to_b = drain(&mut rx[1]);
        assert_eq!(to_b.len(), 1);
        match &to_b[0] {
            ServerEvent::Offer(o) => {
                assert_eq!(o.offer, sdp);
                assert_eq!(o.from, "a");
            }
            other => panic!("ожидали offer, получили {:?}", other),
        }

        assert_eq!(state(&registry, "a", "b").await, Some(PeerState::OfferSent));
        assert_eq!(state(&registry, "b", "a").await, Some(PeerState::OfferReceived));
    }

    #[tokio::test]
    async fn test_full_negotiation() {
        let registry = RoomRegistry::new();
        let mut rx = room_with(&registry, &["a", "b"]).await;
        let coordinator = SignalingCoordinator::new(registry.clone(), IcePolicy::Discard);

        coordinator.offer("a", "123", json!("offer"), None).await.unwrap();
        let offerer = coordinator
            .answer("b", "123", json!("answer"), None)
            .await
            .unwrap();
        assert_eq!(offerer, "a");
        assert!(matches!(drain(&mut rx[0]).as_slice(), [ServerEvent::Answer(a)] if a.from == "b"));
        assert_eq!(state(&registry, "a", "b").await, Some(PeerState::Connected));
        assert_eq!(state(&registry, "b", "a").await, Some(PeerState::AnswerSent));

        coordinator
            .ice_candidate("a", "123", json!({"candidate": "c1"}), None)
            .await
            .unwrap();
        assert_eq!(drain(&mut rx[1]).len(), 2);
        assert_eq!(state(&registry, "b", "a").await, Some(PeerState::Connected));
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_stale() {
        let registry = RoomRegistry::new();
        let _rx = room_with(&registry, &["a", "b"]).await;
        let coordinator = SignalingCoordinator::new(registry, IcePolicy::Discard);

        let err = coordinator
            .answer("b", "123", json!("answer"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NegotiationStale(_)));
    }

    #[tokio::test]
    async fn test_early_ice_discarded() {
        let registry = RoomRegistry::new();
        let mut rx = room_with(&registry, &["a", "b"]).await;
        let coordinator = SignalingCoordinator::new(registry.clone(), IcePolicy::Discard);

        let delivered = coordinator
            .ice_candidate("a", "123", json!("early"), None)
            .await
            .unwrap();
        assert_eq!(delivered, 0);

        coordinator.offer("a", "123", json!("offer"), None).await.unwrap();
        let events = drain(&mut rx[1]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::Offer(_)));
    }

    #[tokio::test]
    async fn test_early_ice_buffered_until_offer() {
        let registry = RoomRegistry::new();
        let mut rx = room_with(&registry, &["a", "b"]).await;
        let coordinator = SignalingCoordinator::new(registry.clone(), IcePolicy::Buffer);

        coordinator
            .ice_candidate("a", "123", json!("early"), None)
            .await
            .unwrap();
        assert!(drain(&mut rx[1]).is_empty());
        assert_eq!(pending(&registry, "a", "b").await, Some(1));

        coordinator.offer("a", "123", json!("offer"), None).await.unwrap();
        assert_eq!(pending(&registry, "a", "b").await, Some(0));
        let events = drain(&mut rx[1]);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ServerEvent::Offer(_)));
        assert!(matches!(&events[1], ServerEvent::IceCandidate(c) if c.candidate == json!("early")));
    }

    #[tokio::test]
    async fn test_relay_to_departed_peer_is_dropped() {
        let registry = RoomRegistry::new();
        let _rx = room_with(&registry, &["a", "b"]).await;
        let coordinator = SignalingCoordinator::new(registry.clone(), IcePolicy::Discard);

        coordinator.offer("a", "123", json!("offer"), None).await.unwrap();
        registry.unregister("b").await;

        assert_eq!(state(&registry, "a", "b").await, None);
        let err = coordinator
            .offer("a", "123", json!("offer"), Some("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NegotiationStale(_)));
        assert_eq!(coordinator.offer("a", "123", json!("offer"), None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_member_cannot_signal() {
        let registry = RoomRegistry::new();
        let _rx = room_with(&registry, &["a"]).await;
        let coordinator = SignalingCoordinator::new(registry, IcePolicy::Discard);

        let err = coordinator
            .offer("stranger", "123", json!("offer"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NegotiationStale(_)));
        assert!(coordinator.offer("a", "nope", json!("offer"), None).await.is_err());
    }
}
