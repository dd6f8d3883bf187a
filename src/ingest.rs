//! Захват и подготовка аудио на отправляющей стороне
//!
//! Кадры f32 квантуются в PCM16 mono и уходят в ограниченную очередь.
//! Колбэк захвата никогда не блокируется: при переполнении отбрасывается
//! самый новый чанк.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{CAPTURE_FRAME_SAMPLES, INGEST_QUEUE_CAPACITY};
use crate::error::RelayError;

/// f32 [-1, 1] -> i16. Отрицательные масштабируются на 32768,
/// неотрицательные на 32767 (диапазон дополнительного кода).
pub fn quantize(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Кадр -> байты PCM16 LE
pub fn encode_frame(frame: &[f32]) -> Vec<u8> {
    frame
        .iter()
        .flat_map(|&s| quantize(s).to_le_bytes())
        .collect()
}

/// Готовый к отправке чанк
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Присваивается в момент отправки, растёт монотонно
    pub sequence: u64,
    pub pcm: Vec<u8>,
}

impl AudioChunk {
    /// Для текстовых транспортов
    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.pcm)
    }
}

/// Источник захвата (внешняя возможность). `Ok(None)` — поток закончился.
pub trait AudioSource {
    fn capture_frame(&mut self) -> Result<Option<Vec<f32>>, RelayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Стриминг выключен, ничего не отправлено
    Disabled,
    Sent(u64),
    /// Очередь полна или закрыта, чанк с этим номером потерян
    Dropped(u64),
}

/// Выключатель стриминга, общий для UI и колбэка захвата
#[derive(Debug, Clone, Default)]
pub struct StreamingToggle(Arc<AtomicBool>);

impl StreamingToggle {
    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct IngestPipeline {
    toggle: StreamingToggle,
    next_seq: AtomicU64,
    dropped: AtomicU64,
    tx: mpsc::Sender<AudioChunk>,
}

impl IngestPipeline {
    pub fn new(toggle: StreamingToggle) -> (Self, mpsc::Receiver<AudioChunk>) {
        Self::with_capacity(toggle, INGEST_QUEUE_CAPACITY)
    }

    pub fn with_capacity(
        toggle: StreamingToggle,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<AudioChunk>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pipeline = Self {
            toggle,
            next_seq: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            tx,
        };
        (pipeline, rx)
    }

    /// Вызывается из колбэка захвата. Кадр режется на чанки не длиннее
    /// `CAPTURE_FRAME_SAMPLES`, у каждого свой номер. Флаг проверяется
    /// перед каждым чанком.
    pub fn push_frame(&self, frame: &[f32]) -> Vec<PushOutcome> {
        frame
            .chunks(CAPTURE_FRAME_SAMPLES)
            .map(|samples| self.push_chunk(samples))
            .collect()
    }

    fn push_chunk(&self, samples: &[f32]) -> PushOutcome {
        if !self.toggle.is_enabled() {
            return PushOutcome::Disabled;
        }

        let sequence = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let chunk = AudioChunk {
            sequence,
            pcm: encode_frame(samples),
        };
        match self.tx.try_send(chunk) {
            Ok(()) => PushOutcome::Sent(sequence),
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Dropped(sequence)
            }
        }
    }

    /// Гоняет источник до конца потока. Возвращает число отправленных чанков.
    pub fn pump<S: AudioSource>(&self, source: &mut S) -> Result<u64, RelayError> {
        let mut sent = 0;
        while let Some(frame) = source.capture_frame()? {
            for outcome in self.push_frame(&frame) {
                match outcome {
                    PushOutcome::Sent(_) => sent += 1,
                    PushOutcome::Dropped(seq) => debug!("Чанк {} отброшен: очередь полна", seq),
                    PushOutcome::Disabled => {}
                }
            }
        }
        let dropped = self.dropped();
        if dropped > 0 {
            warn!("Захват завершён, потеряно чанков: {}", dropped);
        }
        Ok(sent)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
