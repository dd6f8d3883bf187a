//! Воспроизведение на принимающей стороне
//!
//! Собирает непрерывный сигнал из пришедших чанков (синтезированных или
//! пересланных сервером) и ведёт лог транскрипта.

use std::collections::VecDeque;
use std::io::Cursor;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{PLAYBACK_PREBUFFER, SAMPLE_RATE};
use crate::error::RelayError;
use crate::signal::{SessionId, TranscriptEvent};

/// Формат аудио в чанке
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Сырой PCM16 LE mono на канонической частоте
    #[default]
    Pcm16,
    Wav,
    Mp3,
    Ogg,
    Flac,
}

impl AudioFormat {
    /// Определяет контейнер по сигнатуре; всё остальное считаем сырым PCM.
    ///
    /// Голое слово синхронизации MPEG (`FF Ex`) не распознаётся: тишина в
    /// PCM16 LE (сэмпл -1 и соседние) начинается с тех же байтов. MP3 без
    /// тега ID3 должен приходить с явной меткой формата.
    pub fn sniff(bytes: &[u8]) -> Self {
        match bytes {
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => AudioFormat::Wav,
            [b'O', b'g', b'g', b'S', ..] => AudioFormat::Ogg,
            [b'f', b'L', b'a', b'C', ..] => AudioFormat::Flac,
            [b'I', b'D', b'3', ..] => AudioFormat::Mp3,
            _ => AudioFormat::Pcm16,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            AudioFormat::Pcm16 => "audio/pcm",
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Ogg => "audio/ogg",
            AudioFormat::Flac => "audio/flac",
        }
    }
}

/// PCM16 LE -> f32 делением на 32768
pub fn pcm16_to_f32(bytes: &[u8]) -> Result<Vec<f32>, RelayError> {
    if bytes.len() % 2 != 0 {
        return Err(RelayError::DecodeFailure(format!(
            "нечётная длина PCM16: {} байт",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

pub fn decode_base64(audio: &str) -> Result<Vec<u8>, RelayError> {
    Ok(general_purpose::STANDARD.decode(audio.trim())?)
}

/// Декодирует WAV в mono f32; многоканальный звук сводится в среднее
fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32), RelayError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| RelayError::DecodeFailure(e.to_string()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| RelayError::DecodeFailure(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1) as u32)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| RelayError::DecodeFailure(e.to_string()))?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Выход на устройство воспроизведения (внешняя возможность)
pub trait AudioSink {
    /// Непрерывный mono-сигнал
    fn render_pcm(&mut self, samples: &[f32], sample_rate: u32);
    /// Обобщённый путь «декодировать и проиграть» для сжатых контейнеров
    fn play_encoded(&mut self, format: AudioFormat, data: &[u8]);
    /// Устройство доиграло всё отданное и простаивало с прошлого вызова
    fn underrun(&mut self) -> bool {
        false
    }
}

/// Очередь воспроизведения с небольшим предбуфером против джиттера
pub struct PlaybackPipeline<S: AudioSink> {
    sink: S,
    queue: VecDeque<(Vec<f32>, u32)>,
    prebuffer: usize,
    started: bool,
}

impl<S: AudioSink> PlaybackPipeline<S> {
    pub fn new(sink: S) -> Self {
        Self::with_prebuffer(sink, PLAYBACK_PREBUFFER)
    }

    pub fn with_prebuffer(sink: S, prebuffer: usize) -> Self {
        Self {
            sink,
            queue: VecDeque::new(),
            prebuffer: prebuffer.max(1),
            started: false,
        }
    }

    /// Чанк из транспорта (base64). Битый чанк пропускается, поток идёт дальше.
    pub fn push_base64(&mut self, audio: &str, format: Option<AudioFormat>) -> Result<(), RelayError> {
        let bytes = decode_base64(audio)?;
        self.push_bytes(&bytes, format)
    }

    pub fn push_bytes(&mut self, bytes: &[u8], format: Option<AudioFormat>) -> Result<(), RelayError> {
        // явная метка важнее сигнатуры
        let format = format.unwrap_or_else(|| AudioFormat::sniff(bytes));

        match format {
            AudioFormat::Pcm16 => {
                let samples = pcm16_to_f32(bytes)?;
                self.enqueue(samples, SAMPLE_RATE);
            }
            AudioFormat::Wav => {
                let (samples, rate) = decode_wav(bytes)?;
                self.enqueue(samples, rate);
            }
            other => {
                // сначала доигрываем то, что уже в очереди
                self.drain();
                debug!("Контейнер {} уходит в общий декодер", other.mime_type());
                self.sink.play_encoded(other, bytes);
            }
        }
        Ok(())
    }

    fn enqueue(&mut self, samples: Vec<f32>, sample_rate: u32) {
        if samples.is_empty() {
            return;
        }
        if self.started && self.sink.underrun() {
            self.rearm();
        }
        self.queue.push_back((samples, sample_rate));
        if !self.started && self.queue.len() >= self.prebuffer {
            self.started = true;
        }
        if self.started {
            self.drain();
        }
    }

    fn drain(&mut self) {
        while let Some((samples, rate)) = self.queue.pop_front() {
            self.sink.render_pcm(&samples, rate);
        }
    }

    /// Конец потока: проигрываем остаток и снова ждём предбуфер
    pub fn flush(&mut self) {
        self.drain();
        self.started = false;
    }

    /// Устройство сообщило о недогрузе: заново копим предбуфер
    pub fn rearm(&mut self) {
        if self.started {
            warn!("Недогруз воспроизведения, заново копим предбуфер");
        }
        self.started = false;
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub event: TranscriptEvent,
    /// «Вы сказали» против «собеседник сказал»
    pub own: bool,
}

/// Лог транскрипта: только дописывается
#[derive(Debug, Default)]
pub struct TranscriptLog {
    own_id: Option<SessionId>,
    entries: Vec<TranscriptEntry>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_own_id(&mut self, id: SessionId) {
        self.own_id = Some(id);
    }

    pub fn append(&mut self, event: TranscriptEvent) -> &TranscriptEntry {
        let own = self.own_id.as_deref() == Some(event.sender.as_str());
        self.entries.push(TranscriptEntry { event, own });
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
