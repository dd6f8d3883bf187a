//! Реестр комнат: единственное место, где меняется состав комнат.
//!
//! Всё состояние (сессии, комнаты, состояния согласования пар, лог
//! транскрипта) лежит за одним `RwLock`. Сигналинг и релей получают к нему
//! доступ только через методы реестра.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::error::RelayError;
use crate::signal::{
    JoinedPayload, PeerDescriptor, PeerPayload, ServerEvent, SessionId, TranscriptEvent,
};

/// Отправитель событий конкретной сессии
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

/// Снимок участника комнаты, пригодный для рассылки вне блокировки
#[derive(Debug, Clone)]
pub struct Member {
    pub id: SessionId,
    pub tx: Outbox,
}

impl Member {
    /// `false`, если сессия уже закрыла канал
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Настройки сессии, видимые снаружи реестра
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub room_id: Option<String>,
    pub translation_enabled: bool,
    pub target_language: Option<String>,
}

struct SessionEntry {
    tx: Outbox,
    room_id: Option<String>,
    translation_enabled: bool,
    target_language: Option<String>,
}

/// Комната. Создаётся при первом входе, удаляется, когда пустеет.
pub struct Room {
    /// Порядок вставки = порядок входа
    members: Vec<Member>,
    /// Состояние согласования на упорядоченную пару (от кого, к кому)
    pub(crate) peers: HashMap<(SessionId, SessionId), PeerDescriptor>,
    transcript: Vec<TranscriptEvent>,
}

impl Room {
    fn new() -> Self {
        Room {
            members: Vec::new(),
            peers: HashMap::new(),
            transcript: Vec::new(),
        }
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member_ids(&self) -> Vec<SessionId> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    /// Доставка одному участнику; `false`, если его нет или канал закрыт
    pub fn send_to(&self, id: &str, event: ServerEvent) -> bool {
        self.members
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.send(event))
            .unwrap_or(false)
    }

    /// Рассылка всем, кроме `except`. Возвращает число доставленных.
    pub fn broadcast_except(&self, except: Option<&str>, event: &ServerEvent) -> usize {
        self.members
            .iter()
            .filter(|m| Some(m.id.as_str()) != except)
            .filter(|m| m.send(event.clone()))
            .count()
    }

    /// Дописывает событие в лог. Номер присваивается здесь, под блокировкой.
    pub fn append_transcript(&mut self, text: String, sender: SessionId) -> TranscriptEvent {
        let event = TranscriptEvent {
            text,
            sender,
            sequence: self.transcript.len() as u64,
        };
        self.transcript.push(event.clone());
        event
    }

    pub fn transcript(&self) -> &[TranscriptEvent] {
        &self.transcript
    }

    pub fn peer_state(&self, from: &str, to: &str) -> Option<&PeerDescriptor> {
        self.peers.get(&(from.to_string(), to.to_string()))
    }

    /// Закрывает и убирает все пары с участием `id`
    fn close_peers_of(&mut self, id: &str) -> usize {
        let keys: Vec<_> = self
            .peers
            .keys()
            .filter(|(a, b)| a == id || b == id)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(mut descriptor) = self.peers.remove(key) {
                descriptor.close();
            }
        }
        keys.len()
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, SessionEntry>,
    rooms: HashMap<String, Room>,
}

impl Registry {
    fn leave(&mut self, id: &str) -> Option<String> {
        let room_id = self.sessions.get_mut(id)?.room_id.take()?;

        let emptied = match self.rooms.get_mut(&room_id) {
            Some(room) => {
                room.members.retain(|m| m.id != id);
                let closed = room.close_peers_of(id);
                debug!(
                    "Закрыто {} пар согласования сессии {} в комнате {}",
                    closed,
                    short(id),
                    room_id
                );
                let notice = ServerEvent::PeerLeft(PeerPayload {
                    peer: id.to_string(),
                });
                room.broadcast_except(None, &notice);
                room.members.is_empty()
            }
            None => false,
        };

        if emptied {
            self.rooms.remove(&room_id);
            debug!("Комната {} опустела и удалена", room_id);
        }
        Some(room_id)
    }
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Регистрирует подключение. Сессия пока ни в какой комнате.
    pub async fn register(&self, id: SessionId, tx: Outbox) {
        let mut inner = self.inner.write().await;
        inner.sessions.insert(
            id,
            SessionEntry {
                tx,
                room_id: None,
                translation_enabled: true,
                target_language: None,
            },
        );
    }

    /// Полностью удаляет сессию: выход из комнаты и забывание настроек
    pub async fn unregister(&self, id: &str) -> Option<String> {
        let mut inner = self.inner.write().await;
        let left = inner.leave(id);
        inner.sessions.remove(id);
        left
    }

    /// Вход в комнату. Уже сидящие участники получают `user-joined`.
    /// Повторный вход в ту же комнату ничего не делает.
    pub async fn join(&self, id: &str, room_id: &str) -> Result<Vec<SessionId>, RelayError> {
        let mut inner = self.inner.write().await;
        let Registry { sessions, rooms } = &mut *inner;

        let session = sessions.get_mut(id).ok_or(RelayError::TransportDisconnect)?;
        match session.room_id.as_deref() {
            Some(current) if current == room_id => {
                return Ok(rooms
                    .get(room_id)
                    .map(|r| r.member_ids())
                    .unwrap_or_default());
            }
            Some(current) => return Err(RelayError::AlreadyJoined(current.to_string())),
            None => {}
        }

        let room = rooms.entry(room_id.to_string()).or_insert_with(Room::new);
        let notice = ServerEvent::UserJoined(PeerPayload {
            peer: id.to_string(),
        });
        let notified = room.broadcast_except(None, &notice);

        room.members.push(Member {
            id: id.to_string(),
            tx: session.tx.clone(),
        });
        session.room_id = Some(room_id.to_string());

        let members = room.member_ids();
        let _ = session.tx.send(ServerEvent::Joined(JoinedPayload {
            room_id: room_id.to_string(),
            session_id: id.to_string(),
            members: members.clone(),
        }));

        info!(
            "Клиент {} зашёл в комнату {} (оповещено {})",
            short(id),
            room_id,
            notified
        );
        Ok(members)
    }

    /// Выход из комнаты. Для сессии вне комнаты ничего не делает.
    pub async fn leave(&self, id: &str) -> Option<String> {
        let left = self.inner.write().await.leave(id);
        if let Some(room_id) = &left {
            info!("Клиент {} покинул комнату {}", short(id), room_id);
        }
        left
    }

    /// Согласованный снимок участников в порядке входа
    pub async fn members_of(&self, room_id: &str) -> Vec<Member> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(room_id)
            .map(|r| r.members.clone())
            .unwrap_or_default()
    }

    pub async fn session(&self, id: &str) -> Option<SessionInfo> {
        let inner = self.inner.read().await;
        inner.sessions.get(id).map(|s| SessionInfo {
            id: id.to_string(),
            room_id: s.room_id.clone(),
            translation_enabled: s.translation_enabled,
            target_language: s.target_language.clone(),
        })
    }

    pub async fn set_translation(
        &self,
        id: &str,
        enabled: bool,
        target_language: Option<String>,
    ) -> Result<(), RelayError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or(RelayError::TransportDisconnect)?;
        session.translation_enabled = enabled;
        if target_language.is_some() {
            session.target_language = target_language;
        }
        Ok(())
    }

    pub async fn transcript_of(&self, room_id: &str) -> Vec<TranscriptEvent> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(room_id)
            .map(|r| r.transcript.clone())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    /// Выполняет `f` над комнатой под блокировкой записи. Рассылки внутри `f`
    /// видны всем участникам в одном и том же порядке.
    pub(crate) async fn with_room<R>(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut Room) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.write().await;
        inner.rooms.get_mut(room_id).map(f)
    }
}

/// Первые 8 символов идентификатора для логов
pub fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(registry: &RoomRegistry, id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(id.to_string(), tx).await;
        rx
    }

    fn ids(members: &[Member]) -> Vec<String> {
        members.iter().map(|m| m.id.clone()).collect()
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let registry = RoomRegistry::new();
        let _a = connect(&registry, "session-a").await;

        registry.join("session-a", "123").await.unwrap();
        assert_eq!(ids(&registry.members_of("123").await), vec!["session-a"]);

        assert_eq!(registry.leave("session-a").await.as_deref(), Some("123"));
        assert!(registry.members_of("123").await.is_empty());
        assert_eq!(registry.room_count().await, 0);

        // повторный выход ничего не ломает
        assert!(registry.leave("session-a").await.is_none());
    }

    #[tokio::test]
    async fn test_join_order_is_preserved() {
        let registry = RoomRegistry::new();
        for id in ["c", "a", "b"] {
            let _ = connect(&registry, id).await;
            registry.join(id, "room").await.unwrap();
        }
        assert_eq!(ids(&registry.members_of("room").await), vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_second_room_fails() {
        let registry = RoomRegistry::new();
        let _a = connect(&registry, "a").await;
        registry.join("a", "one").await.unwrap();

        let err = registry.join("a", "two").await.unwrap_err();
        assert!(matches!(err, RelayError::AlreadyJoined(ref r) if r == "one"));
        assert!(registry.members_of("two").await.is_empty());

        // та же комната: без ошибки и без дубликата
        registry.join("a", "one").await.unwrap();
        assert_eq!(registry.members_of("one").await.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_members_are_notified() {
        let registry = RoomRegistry::new();
        let mut a = connect(&registry, "a").await;
        let mut b = connect(&registry, "b").await;

        registry.join("a", "123").await.unwrap();
        assert!(matches!(a.try_recv(), Ok(ServerEvent::Joined(_))));

        registry.join("b", "123").await.unwrap();
        match a.try_recv() {
            Ok(ServerEvent::UserJoined(p)) => assert_eq!(p.peer, "b"),
            other => panic!("ожидали user-joined, получили {:?}", other),
        }
        match b.try_recv() {
            Ok(ServerEvent::Joined(p)) => assert_eq!(p.members, vec!["a", "b"]),
            other => panic!("ожидали joined, получили {:?}", other),
        }
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister_notifies_remaining() {
        let registry = RoomRegistry::new();
        let mut a = connect(&registry, "a").await;
        let _b = connect(&registry, "b").await;
        registry.join("a", "123").await.unwrap();
        registry.join("b", "123").await.unwrap();
        while a.try_recv().is_ok() {}

        registry.unregister("b").await;
        assert!(matches!(a.try_recv(), Ok(ServerEvent::PeerLeft(p)) if p.peer == "b"));
        assert!(registry.session("b").await.is_none());
        assert_eq!(ids(&registry.members_of("123").await), vec!["a"]);
    }

    #[tokio::test]
    async fn test_translation_settings() {
        let registry = RoomRegistry::new();
        let _a = connect(&registry, "a").await;
        registry
            .set_translation("a", false, Some("de".to_string()))
            .await
            .unwrap();
        let info = registry.session("a").await.unwrap();
        assert!(!info.translation_enabled);
        assert_eq!(info.target_language.as_deref(), Some("de"));
    }

    #[tokio::test]
    async fn test_snapshots_consistent_under_concurrent_churn() {
        let registry = RoomRegistry::new();
        let _host = connect(&registry, "host").await;
        registry.join("host", "123").await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let registry = registry.clone();
            tasks.spawn(async move {
                let id = format!("guest-{}", i);
                let _rx = connect(&registry, &id).await;
                for _ in 0..10 {
                    registry.join(&id, "123").await.unwrap();
                    tokio::task::yield_now().await;
                    registry.leave(&id).await;
                }
            });
        }

        while !tasks.is_empty() {
            let snapshot = ids(&registry.members_of("123").await);
            assert_eq!(snapshot.first().map(String::as_str), Some("host"));
            let mut unique = snapshot.clone();
            unique.sort();
            unique.dedup();
            assert_eq!(unique.len(), snapshot.len(), "дубликат в {:?}", snapshot);
            assert!(snapshot[1..].iter().all(|id| id.starts_with("guest-")));
            while let Some(done) = tasks.try_join_next() {
                done.unwrap();
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(ids(&registry.members_of("123").await), vec!["host"]);
        assert_eq!(registry.room_count().await, 1);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short("0123456789"), "01234567");
        assert_eq!(short("abc"), "abc");
    }
}
