use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::error::RelayError;
use crate::relay::{EchoTranslator, HttpTranslator, Relay, TranslationService};
use crate::room::RoomRegistry;
use crate::signal::SignalingCoordinator;

// Структура состояния приложения
#[derive(Clone)]
pub struct AppState {
    pub registry: RoomRegistry,
    pub signaling: Arc<SignalingCoordinator>,
    pub relay: Arc<Relay>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Состояние с сервисом перевода из конфигурации
    pub fn from_config(config: Config) -> Result<Self, RelayError> {
        let translator: Arc<dyn TranslationService> = match &config.translation_url {
            Some(url) => {
                info!("Сервис перевода: {}", url);
                Arc::new(HttpTranslator::new(url.clone(), config.translation_timeout)?)
            }
            None => {
                info!("TRANSLATION_URL не задан, используется эхо-переводчик");
                Arc::new(EchoTranslator)
            }
        };
        Ok(Self::with_translator(config, translator))
    }

    pub fn with_translator(config: Config, translator: Arc<dyn TranslationService>) -> Self {
        let registry = RoomRegistry::new();
        let signaling = Arc::new(SignalingCoordinator::new(
            registry.clone(),
            config.ice_policy,
        ));
        let relay = Arc::new(Relay::new(
            registry.clone(),
            translator,
            config.relay_self_mute,
            config.default_target_language.clone(),
        ));
        Self {
            registry,
            signaling,
            relay,
            config: Arc::new(config),
        }
    }
}
