//! Одна подключённая сессия: разбор входящих событий и их диспетчеризация.
//!
//! Соединение регистрируется в реестре при открытии и детерминированно
//! снимается в `close`: незавершённые переводы отменяются, пары
//! согласования закрываются, сессия покидает комнату.

use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::RelayError;
use crate::relay::InboundChunk;
use crate::room::{short, Outbox};
use crate::signal::{ClientEvent, ServerEvent, SessionId};

pub struct Connection {
    id: SessionId,
    state: AppState,
    tx: Outbox,
    /// Круговые запросы к сервису перевода этой сессии
    translations: JoinSet<()>,
}

impl Connection {
    /// Токен уже проверен на апгрейде, здесь он только отмечается в логе
    pub async fn open(state: AppState, tx: Outbox, token: Option<&str>) -> Self {
        let id = Uuid::new_v4().to_string();
        state.registry.register(id.clone(), tx.clone()).await;
        debug!(
            "Сессия {} открыта (токен: {})",
            short(&id),
            if token.is_some() { "есть" } else { "нет" }
        );
        Self {
            id,
            state,
            tx,
            translations: JoinSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Текстовый кадр: разбирается один раз на входе
    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => self.dispatch(event).await,
            Err(e) => warn!("Неверный формат события от {}: {}", short(&self.id), e),
        }
    }

    /// Бинарный кадр: сырой PCM16 для текущей комнаты
    pub async fn handle_binary(&mut self, bytes: Vec<u8>) {
        match InboundChunk::from_binary(bytes) {
            Ok(chunk) => self.ingest(chunk).await,
            Err(e) => debug!("Бинарный чанк от {} отброшен: {}", short(&self.id), e),
        }
    }

    pub async fn dispatch(&mut self, event: ClientEvent) {
        let result = match event {
            ClientEvent::JoinRoom(room_id) => self
                .state
                .registry
                .join(&self.id, &room_id)
                .await
                .map(|_| ()),
            ClientEvent::LeaveRoom => {
                self.state.registry.leave(&self.id).await;
                Ok(())
            }
            ClientEvent::Offer(p) => match self.room(p.room_id).await {
                Ok(room_id) => self
                    .state
                    .signaling
                    .offer(&self.id, &room_id, p.offer, p.to.as_deref())
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            },
            ClientEvent::Answer(p) => match self.room(p.room_id).await {
                Ok(room_id) => self
                    .state
                    .signaling
                    .answer(&self.id, &room_id, p.answer, p.to.as_deref())
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            },
            ClientEvent::IceCandidate(p) => match self.room(p.room_id).await {
                Ok(room_id) => self
                    .state
                    .signaling
                    .ice_candidate(&self.id, &room_id, p.candidate, p.to.as_deref())
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            },
            ClientEvent::AudioChunk(payload) => {
                match InboundChunk::try_from(payload) {
                    Ok(chunk) => self.ingest(chunk).await,
                    Err(e) => debug!("Чанк от {} отброшен: {}", short(&self.id), e),
                }
                Ok(())
            }
            ClientEvent::SetTranslation(settings) => {
                self.state
                    .registry
                    .set_translation(&self.id, settings.enabled, settings.target_language)
                    .await
            }
            ClientEvent::MediaError(p) => {
                // звонок продолжается без звука
                let e = RelayError::MediaAccessDenied(p.message);
                warn!("Сессия {}: {}", short(&self.id), e);
                Ok(())
            }
        };

        if let Err(e) = result {
            self.report(e);
        }
    }

    async fn ingest(&mut self, chunk: InboundChunk) {
        match self.state.relay.accept(&self.id, chunk).await {
            Ok(Some(job)) => {
                let relay = self.state.relay.clone();
                self.translations.spawn(relay.run(job));
            }
            Ok(None) => {}
            Err(e) => self.report(e),
        }
        // убираем завершённые задачи
        while self.translations.try_join_next().is_some() {}
    }

    /// Комната из сообщения или текущая комната сессии
    async fn room(&self, room_id: Option<String>) -> Result<String, RelayError> {
        match room_id {
            Some(room_id) => Ok(room_id),
            None => self
                .state
                .registry
                .session(&self.id)
                .await
                .and_then(|s| s.room_id)
                .ok_or(RelayError::NotInRoom),
        }
    }

    fn report(&self, e: RelayError) {
        match e {
            // отставший сигнал молча отбрасывается
            RelayError::NegotiationStale(_) => {
                debug!("Сигнал от {} отброшен: {}", short(&self.id), e)
            }
            RelayError::DecodeFailure(_) | RelayError::RelayTargetUnreachable(_) => {
                debug!("Чанк от {} отброшен: {}", short(&self.id), e)
            }
            _ => {
                warn!("Сессия {}: {}", short(&self.id), e);
                let _ = self.tx.send(ServerEvent::from(&e));
            }
        }
    }

    /// Снятие сессии: отмена переводов, выход из комнаты
    pub async fn close(mut self) {
        self.translations.abort_all();
        while self.translations.join_next().await.is_some() {}
        self.state.relay.forget(&self.id);
        let room = self.state.registry.unregister(&self.id).await;
        info!(
            "Сессия {} закрыта{}",
            short(&self.id),
            room.map(|r| format!(", покинула комнату {}", r))
                .unwrap_or_default()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::relay::EchoTranslator;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn state(config: Config) -> AppState {
        AppState::with_translator(config, Arc::new(EchoTranslator))
    }

    async fn open(state: &AppState) -> (Connection, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::open(state.clone(), tx, None).await, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    async fn wait_for(rx: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("событие не пришло")
            .expect("канал закрыт")
    }

    #[tokio::test]
    async fn test_two_sessions_offer_reaches_only_peer() {
        let state = state(Config::default());
        let (mut a, mut rx_a) = open(&state).await;
        let (mut b, mut rx_b) = open(&state).await;

        a.handle_text(r#"{"event":"join-room","data":"123"}"#).await;
        b.handle_text(r#"{"event":"join-room","data":"123"}"#).await;
        assert!(drain(&mut rx_a)
            .iter()
            .any(|e| matches!(e, ServerEvent::UserJoined(p) if p.peer == b.id())));
        drain(&mut rx_b);

        a.handle_text(r#"{"event":"offer","data":{"offer":{"type":"offer","sdp":"v=0 A"},"roomId":"123"}}"#)
            .await;
        assert!(drain(&mut rx_a).is_empty());
        let to_b = drain(&mut rx_b);
        assert_eq!(to_b.len(), 1);
        match &to_b[0] {
            ServerEvent::Offer(o) => assert_eq!(o.offer, json!({"type":"offer","sdp":"v=0 A"})),
            other => panic!("ожидали offer, получили {:?}", other),
        }

        // answer без roomId идёт в текущую комнату и к автору offer
        b.handle_text(r#"{"event":"answer","data":{"answer":{"type":"answer"}}}"#)
            .await;
        assert!(matches!(drain(&mut rx_a).as_slice(), [ServerEvent::Answer(_)]));
    }

    #[tokio::test]
    async fn test_already_joined_reported_to_sender() {
        let state = state(Config::default());
        let (mut a, mut rx_a) = open(&state).await;
        a.dispatch(ClientEvent::JoinRoom("one".to_string())).await;
        drain(&mut rx_a);

        a.dispatch(ClientEvent::JoinRoom("two".to_string())).await;
        match drain(&mut rx_a).as_slice() {
            [ServerEvent::Error(e)] => assert_eq!(e.kind, "AlreadyJoined"),
            other => panic!("ожидали error, получили {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_audio_chunk_translated_to_peer() {
        let mut config = Config::default();
        config.default_target_language = Some("en".to_string());
        let state = state(config);
        let (mut a, _rx_a) = open(&state).await;
        let (mut b, mut rx_b) = open(&state).await;
        a.dispatch(ClientEvent::JoinRoom("123".to_string())).await;
        b.dispatch(ClientEvent::JoinRoom("123".to_string())).await;
        drain(&mut rx_b);

        a.handle_text(r#"{"event":"audio-chunk","data":{"audio":"AAEAAQ==","roomId":"123","seq":0}}"#)
            .await;
        match wait_for(&mut rx_b).await {
            ServerEvent::TranslatedAudioChunk(t) => {
                assert_eq!(t.sender, a.id());
                assert_eq!(t.audio, "AAEAAQ==");
            }
            other => panic!("ожидали translated-audio-chunk, получили {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_binary_frame_relayed_raw() {
        let state = state(Config::default());
        let (mut a, _rx_a) = open(&state).await;
        let (mut b, mut rx_b) = open(&state).await;
        a.dispatch(ClientEvent::JoinRoom("123".to_string())).await;
        b.dispatch(ClientEvent::JoinRoom("123".to_string())).await;
        drain(&mut rx_b);

        a.handle_binary(vec![0, 0, 1, 0]).await;
        assert!(matches!(drain(&mut rx_b).as_slice(), [ServerEvent::IncomingAudio(_)]));

        // нечётная длина отбрасывается
        a.handle_binary(vec![0, 0, 1]).await;
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_disabled_translation_sends_nothing() {
        let state = state(Config::default());
        let (mut a, _rx_a) = open(&state).await;
        let (mut b, mut rx_b) = open(&state).await;
        a.dispatch(ClientEvent::JoinRoom("123".to_string())).await;
        b.dispatch(ClientEvent::JoinRoom("123".to_string())).await;
        drain(&mut rx_b);

        a.handle_text(r#"{"event":"set-translation","data":{"enabled":false}}"#)
            .await;
        a.handle_text(r#"{"event":"audio-chunk","data":"AAEAAQ=="}"#).await;
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_garbage_is_ignored() {
        let state = state(Config::default());
        let (mut a, mut rx_a) = open(&state).await;
        a.handle_text("not json").await;
        a.handle_text(r#"{"event":"unknown","data":1}"#).await;
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_close_tears_down() {
        let state = state(Config::default());
        let (mut a, _rx_a) = open(&state).await;
        let (mut b, mut rx_b) = open(&state).await;
        a.dispatch(ClientEvent::JoinRoom("123".to_string())).await;
        b.dispatch(ClientEvent::JoinRoom("123".to_string())).await;
        drain(&mut rx_b);

        let a_id = a.id().to_string();
        a.close().await;
        assert!(state.registry.session(&a_id).await.is_none());
        assert!(matches!(drain(&mut rx_b).as_slice(), [ServerEvent::PeerLeft(p)] if p.peer == a_id));

        b.close().await;
        assert_eq!(state.registry.room_count().await, 0);
    }
}
