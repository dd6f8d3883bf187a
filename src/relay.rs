//! Релей аудио и транскрипта
//!
//! Принимает чанки от отправителей, отдаёт их сервису перевода и
//! разносит результаты участникам комнаты с пометкой автора.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SAMPLE_RATE;
use crate::error::RelayError;
use crate::playback::{decode_base64, AudioFormat};
use crate::room::{short, RoomRegistry};
use crate::signal::{
    AudioChunkPayload, IncomingAudio, ServerEvent, SessionId, TranslatedAudio,
};

/// Чанк, провалидированный на входе
#[derive(Debug, Clone)]
pub struct InboundChunk {
    pub audio: Vec<u8>,
    pub format: AudioFormat,
    pub room_id: Option<String>,
    pub target_language: Option<String>,
    pub seq: Option<u64>,
}

impl InboundChunk {
    /// Бинарный кадр WebSocket: сырой PCM16 без base64
    pub fn from_binary(audio: Vec<u8>) -> Result<Self, RelayError> {
        let chunk = Self {
            audio,
            format: AudioFormat::Pcm16,
            room_id: None,
            target_language: None,
            seq: None,
        };
        chunk.validate()?;
        Ok(chunk)
    }

    fn validate(&self) -> Result<(), RelayError> {
        if self.audio.is_empty() {
            return Err(RelayError::DecodeFailure("пустой чанк".to_string()));
        }
        if self.format == AudioFormat::Pcm16 && self.audio.len() % 2 != 0 {
            return Err(RelayError::DecodeFailure(format!(
                "нечётная длина PCM16: {} байт",
                self.audio.len()
            )));
        }
        Ok(())
    }
}

impl TryFrom<AudioChunkPayload> for InboundChunk {
    type Error = RelayError;

    fn try_from(payload: AudioChunkPayload) -> Result<Self, Self::Error> {
        let chunk = match payload {
            AudioChunkPayload::Raw(audio) => Self {
                audio: decode_base64(&audio)?,
                format: AudioFormat::Pcm16,
                room_id: None,
                target_language: None,
                seq: None,
            },
            AudioChunkPayload::Structured(s) => Self {
                audio: decode_base64(&s.audio)?,
                format: s.format.unwrap_or_default(),
                room_id: s.room_id,
                target_language: s.target_language,
                seq: s.seq,
            },
        };
        chunk.validate()?;
        Ok(chunk)
    }
}

/// Запрос к сервису перевода
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub sender: SessionId,
    pub room_id: String,
    pub target_language: String,
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub audio: Vec<u8>,
    pub seq: Option<u64>,
}

/// Один результат сервиса перевода
#[derive(Debug, Clone, PartialEq)]
pub enum TranslationOutput {
    Audio {
        data: Vec<u8>,
        format: AudioFormat,
        text: Option<String>,
    },
    Transcript(String),
}

/// Сервис перевода: на один чанк ноль, один или много результатов
#[async_trait]
pub trait TranslationService: Send + Sync {
    async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> Result<Vec<TranslationOutput>, RelayError>;
}

/// Возвращает исходное аудио без транскрипта. Для локальной разработки.
pub struct EchoTranslator;

#[async_trait]
impl TranslationService for EchoTranslator {
    async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> Result<Vec<TranslationOutput>, RelayError> {
        Ok(vec![TranslationOutput::Audio {
            data: request.audio.clone(),
            format: request.format,
            text: None,
        }])
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpTranslateRequest<'a> {
    sender: &'a str,
    room_id: &'a str,
    target_language: &'a str,
    sample_rate: u32,
    format: AudioFormat,
    audio: String,
}

#[derive(Debug, Deserialize)]
struct HttpTranslateResponse {
    #[serde(default)]
    results: Vec<HttpTranslateResult>,
}

#[derive(Debug, Deserialize)]
struct HttpTranslateResult {
    audio: Option<String>,
    format: Option<AudioFormat>,
    text: Option<String>,
}

/// Клиент внешнего HTTP-сервиса перевода
pub struct HttpTranslator {
    client: Client,
    url: String,
}

impl HttpTranslator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RelayError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TranslationService for HttpTranslator {
    async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> Result<Vec<TranslationOutput>, RelayError> {
        let body = HttpTranslateRequest {
            sender: &request.sender,
            room_id: &request.room_id,
            target_language: &request.target_language,
            sample_rate: request.sample_rate,
            format: request.format,
            audio: general_purpose::STANDARD.encode(&request.audio),
        };

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    warn!("Не удалось прочитать тело ошибки сервиса перевода: {}", e);
                    String::new()
                }
            };
            return Err(RelayError::Translation(format!("{}: {}", status, text)));
        }

        let parsed: HttpTranslateResponse = response.json().await?;
        parse_results(parsed)
    }
}

/// Битый результат пропускается, остальные доставляются
fn parse_results(response: HttpTranslateResponse) -> Result<Vec<TranslationOutput>, RelayError> {
    let mut outputs = Vec::new();
    for (i, result) in response.results.into_iter().enumerate() {
        if let Some(audio) = result.audio {
            let data = match decode_base64(&audio) {
                Ok(data) => data,
                Err(e) => {
                    debug!("Результат перевода #{} пропущен: {}", i, e);
                    continue;
                }
            };
            let format = result
                .format
                .unwrap_or_else(|| AudioFormat::sniff(&data));
            outputs.push(TranslationOutput::Audio {
                data,
                format,
                text: result.text.clone(),
            });
        }
        if let Some(text) = result.text.filter(|t| !t.trim().is_empty()) {
            outputs.push(TranslationOutput::Transcript(text));
        }
    }
    Ok(outputs)
}

/// Задача одного кругового запроса к сервису перевода
#[derive(Debug)]
pub struct TranslationJob {
    request: TranslationRequest,
}

impl TranslationJob {
    pub fn request(&self) -> &TranslationRequest {
        &self.request
    }
}

pub struct Relay {
    registry: RoomRegistry,
    translator: Arc<dyn TranslationService>,
    /// Не возвращать отправителю его же перевод
    self_mute: bool,
    default_target_language: Option<String>,
    /// Последний номер чанка от каждого отправителя
    last_seq: Mutex<HashMap<SessionId, u64>>,
}

impl Relay {
    pub fn new(
        registry: RoomRegistry,
        translator: Arc<dyn TranslationService>,
        self_mute: bool,
        default_target_language: Option<String>,
    ) -> Self {
        Self {
            registry,
            translator,
            self_mute,
            default_target_language,
            last_seq: Mutex::new(HashMap::new()),
        }
    }

    /// Принимает чанк. Без языка перевода чанк сразу пересылается как есть,
    /// иначе возвращается задача для сервиса перевода.
    pub async fn accept(
        &self,
        sender: &str,
        chunk: InboundChunk,
    ) -> Result<Option<TranslationJob>, RelayError> {
        let session = self
            .registry
            .session(sender)
            .await
            .ok_or(RelayError::TransportDisconnect)?;
        let room_id = session.room_id.ok_or(RelayError::NotInRoom)?;
        if chunk.room_id.as_deref().is_some_and(|r| r != room_id) {
            return Err(RelayError::NotInRoom);
        }
        if !session.translation_enabled {
            debug!("Перевод у {} выключен, чанк отброшен", short(sender));
            return Ok(None);
        }
        if let Some(seq) = chunk.seq {
            self.track_sequence(sender, seq);
        }

        let target_language = chunk
            .target_language
            .or(session.target_language)
            .or_else(|| self.default_target_language.clone());

        let Some(target_language) = target_language else {
            let event = ServerEvent::IncomingAudio(IncomingAudio {
                audio: general_purpose::STANDARD.encode(&chunk.audio),
                sender: sender.to_string(),
                seq: chunk.seq,
            });
            self.registry
                .with_room(&room_id, |room| room.broadcast_except(Some(sender), &event))
                .await
                .ok_or_else(|| RelayError::RelayTargetUnreachable(room_id.clone()))?;
            return Ok(None);
        };

        Ok(Some(TranslationJob {
            request: TranslationRequest {
                sender: sender.to_string(),
                room_id,
                target_language,
                sample_rate: SAMPLE_RATE,
                format: chunk.format,
                audio: chunk.audio,
                seq: chunk.seq,
            },
        }))
    }

    /// Круговой запрос к сервису перевода и раздача результатов
    pub async fn run(self: Arc<Self>, job: TranslationJob) {
        let request = job.request;
        let outputs = match self.translator.translate(&request).await {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!("Перевод чанка от {} не удался: {}", short(&request.sender), e);
                return;
            }
        };

        for output in outputs {
            if let Err(e) = self.deliver(&request.sender, &request.room_id, output).await {
                warn!("{}", e);
            }
        }
    }

    /// Раздаёт один результат. Транскрипт дописывается в лог комнаты и
    /// рассылается под той же блокировкой.
    pub async fn deliver(
        &self,
        sender: &str,
        room_id: &str,
        output: TranslationOutput,
    ) -> Result<usize, RelayError> {
        let self_mute = self.self_mute;
        let delivered = self
            .registry
            .with_room(room_id, |room| match output {
                TranslationOutput::Audio { data, format, text } => {
                    let event = ServerEvent::TranslatedAudioChunk(TranslatedAudio {
                        audio: general_purpose::STANDARD.encode(&data),
                        format,
                        sender: sender.to_string(),
                        text,
                    });
                    let except = if self_mute { Some(sender) } else { None };
                    room.broadcast_except(except, &event)
                }
                TranslationOutput::Transcript(text) => {
                    let event = room.append_transcript(text, sender.to_string());
                    room.broadcast_except(None, &ServerEvent::NewTranscription(event))
                }
            })
            .await
            .ok_or_else(|| RelayError::RelayTargetUnreachable(room_id.to_string()))?;

        debug!(
            "Результат перевода от {} доставлен {} участникам",
            short(sender),
            delivered
        );
        Ok(delivered)
    }

    /// Забывает счётчик отправителя при отключении
    pub fn forget(&self, sender: &str) {
        if let Ok(mut last) = self.last_seq.lock() {
            last.remove(sender);
        }
    }

    /// Замечает пропуски и перестановки, но не исправляет их
    fn track_sequence(&self, sender: &str, seq: u64) {
        let Ok(mut last) = self.last_seq.lock() else {
            return;
        };
        match last.insert(sender.to_string(), seq) {
            Some(prev) if seq <= prev => {
                info!("Чанк {} от {} пришёл не по порядку (после {})", seq, short(sender), prev);
            }
            Some(prev) if seq > prev + 1 => {
                info!("Пропущено {} чанков от {}", seq - prev - 1, short(sender));
            }
            _ => {}
        }
    }
}
