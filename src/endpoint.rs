//! Конечная точка участника без привязки к транспорту.
//!
//! Превращает чанки ingest-пайплайна в события `audio-chunk`, а события
//! сервера раскладывает по воспроизведению, логу транскрипта и действиям
//! для WebRTC-стека участника.

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::ingest::AudioChunk;
use crate::playback::{AudioFormat, AudioSink, PlaybackPipeline, TranscriptEntry, TranscriptLog};
use crate::signal::{
    AnswerPayload, AudioChunkPayload, ClientEvent, IcePayload, MediaErrorPayload, OfferPayload,
    ServerEvent, SessionId, StructuredAudio,
};

/// Что должен сделать WebRTC-стек участника в ответ на событие сервера
#[derive(Debug, Clone, PartialEq)]
pub enum PeerAction {
    /// Новый участник: создать offer для него
    CreateOffer { peer: SessionId },
    /// Применить чужой offer и ответить
    AcceptOffer { from: SessionId, offer: Value },
    ApplyAnswer { from: SessionId, answer: Value },
    AddIceCandidate { from: SessionId, candidate: Value },
    /// Закрыть соединение с ушедшим участником
    ClosePeer { peer: SessionId },
}

pub struct Endpoint<S: AudioSink> {
    session_id: Option<SessionId>,
    room_id: Option<String>,
    target_language: Option<String>,
    playback: PlaybackPipeline<S>,
    transcript: TranscriptLog,
    last_error: Option<(String, String)>,
}

impl<S: AudioSink> Endpoint<S> {
    pub fn new(sink: S, target_language: Option<String>) -> Self {
        Self {
            session_id: None,
            room_id: None,
            target_language,
            playback: PlaybackPipeline::new(sink),
            transcript: TranscriptLog::new(),
            last_error: None,
        }
    }

    pub fn join(&mut self, room_id: impl Into<String>) -> ClientEvent {
        let room_id = room_id.into();
        self.room_id = Some(room_id.clone());
        ClientEvent::JoinRoom(room_id)
    }

    /// Чанк захвата -> событие для текстового транспорта
    pub fn audio_event(&self, chunk: &AudioChunk) -> ClientEvent {
        ClientEvent::AudioChunk(AudioChunkPayload::Structured(StructuredAudio {
            audio: chunk.to_base64(),
            room_id: self.room_id.clone(),
            target_language: self.target_language.clone(),
            seq: Some(chunk.sequence),
            format: Some(AudioFormat::Pcm16),
        }))
    }

    pub fn offer_event(&self, offer: Value, to: Option<SessionId>) -> ClientEvent {
        ClientEvent::Offer(OfferPayload {
            offer,
            room_id: self.room_id.clone(),
            to,
        })
    }

    pub fn answer_event(&self, answer: Value, to: Option<SessionId>) -> ClientEvent {
        ClientEvent::Answer(AnswerPayload {
            answer,
            room_id: self.room_id.clone(),
            to,
        })
    }

    pub fn ice_event(&self, candidate: Value) -> ClientEvent {
        ClientEvent::IceCandidate(IcePayload {
            candidate,
            room_id: self.room_id.clone(),
            to: None,
        })
    }

    /// Нет доступа к микрофону: звонок продолжается без звука
    pub fn media_error(&self, error: &RelayError) -> ClientEvent {
        warn!("Захват недоступен, продолжаем без звука: {}", error);
        ClientEvent::MediaError(MediaErrorPayload {
            message: error.to_string(),
        })
    }

    /// Обрабатывает событие сервера. Битое аудио пропускается.
    pub fn handle(&mut self, event: ServerEvent) -> Option<PeerAction> {
        match event {
            ServerEvent::Joined(joined) => {
                self.transcript.set_own_id(joined.session_id.clone());
                self.session_id = Some(joined.session_id);
                self.room_id = Some(joined.room_id);
                None
            }
            ServerEvent::UserJoined(p) => Some(PeerAction::CreateOffer { peer: p.peer }),
            ServerEvent::PeerLeft(p) => {
                // поток собеседника закончился: доигрываем остаток
                self.playback.flush();
                Some(PeerAction::ClosePeer { peer: p.peer })
            }
            ServerEvent::Offer(o) => Some(PeerAction::AcceptOffer {
                from: o.from,
                offer: o.offer,
            }),
            ServerEvent::Answer(a) => Some(PeerAction::ApplyAnswer {
                from: a.from,
                answer: a.answer,
            }),
            ServerEvent::IceCandidate(c) => Some(PeerAction::AddIceCandidate {
                from: c.from,
                candidate: c.candidate,
            }),
            ServerEvent::IncomingAudio(audio) => {
                // пересланный сервером сырой звук всегда PCM16
                self.play(&audio.audio, Some(AudioFormat::Pcm16));
                None
            }
            ServerEvent::TranslatedAudioChunk(audio) => {
                self.play(&audio.audio, Some(audio.format));
                None
            }
            ServerEvent::NewTranscription(event) => {
                self.transcript.append(event);
                None
            }
            ServerEvent::Error(e) => {
                warn!("Сервер вернул ошибку {}: {}", e.kind, e.message);
                self.last_error = Some((e.kind, e.message));
                None
            }
        }
    }

    fn play(&mut self, audio: &str, format: Option<AudioFormat>) {
        if let Err(e) = self.playback.push_base64(audio, format) {
            debug!("Чанк воспроизведения пропущен: {}", e);
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        self.transcript.entries()
    }

    pub fn playback(&mut self) -> &mut PlaybackPipeline<S> {
        &mut self.playback
    }

    pub fn last_error(&self) -> Option<(&str, &str)> {
        self.last_error
            .as_ref()
            .map(|(kind, message)| (kind.as_str(), message.as_str()))
    }
}
