use thiserror::Error;

/// Ошибки ядра. Ни одна из них не роняет процесс: каждая касается
/// одной сессии или одного чанка.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Нет доступа к устройству захвата: {0}")]
    MediaAccessDenied(String),
    #[error("Сигнал для пира {0}, которого уже нет в комнате")]
    NegotiationStale(String),
    #[error("Некому доставить результат в комнате {0}")]
    RelayTargetUnreachable(String),
    #[error("Не удалось декодировать аудио: {0}")]
    DecodeFailure(String),
    #[error("Соединение разорвано")]
    TransportDisconnect,
    #[error("Сессия уже в комнате {0}")]
    AlreadyJoined(String),
    #[error("Сессия не в комнате")]
    NotInRoom,
    #[error("Ошибка сервиса перевода: {0}")]
    Translation(String),
}

impl RelayError {
    /// Короткое имя для события `error`
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::MediaAccessDenied(_) => "MediaAccessDenied",
            RelayError::NegotiationStale(_) => "NegotiationStale",
            RelayError::RelayTargetUnreachable(_) => "RelayTargetUnreachable",
            RelayError::DecodeFailure(_) => "DecodeFailure",
            RelayError::TransportDisconnect => "TransportDisconnect",
            RelayError::AlreadyJoined(_) => "AlreadyJoined",
            RelayError::NotInRoom => "NotInRoom",
            RelayError::Translation(_) => "Translation",
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        RelayError::Translation(e.to_string())
    }
}

impl From<base64::DecodeError> for RelayError {
    fn from(e: base64::DecodeError) -> Self {
        RelayError::DecodeFailure(e.to_string())
    }
}
