//! Конфигурация сервера
//!
//! Читается из переменных окружения (и файла .env, если он есть)

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Каноническая частота дискретизации PCM16 mono
pub const SAMPLE_RATE: u32 = 24_000;
/// Размер блока захвата (~170 мс при 24 кГц)
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;
/// Сколько чанков копим перед началом воспроизведения
pub const PLAYBACK_PREBUFFER: usize = 2;
/// Ёмкость исходящей очереди ingest-пайплайна
pub const INGEST_QUEUE_CAPACITY: usize = 8;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Некорректное значение {0}: {1}")]
    InvalidValue(String, String),
}

/// Что делать с ICE-кандидатами, пришедшими до обмена offer/answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IcePolicy {
    #[default]
    Discard,
    Buffer,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub public_dir: PathBuf,
    /// HTTP-адрес сервиса перевода; без него используется эхо-переводчик
    pub translation_url: Option<String>,
    pub translation_timeout: Duration,
    /// Требовать bearer-токен при подключении
    pub require_auth: bool,
    /// Не отдавать отправителю его же переведённое аудио
    pub relay_self_mute: bool,
    pub ice_policy: IcePolicy,
    pub default_target_language: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            public_dir: PathBuf::from("public"),
            translation_url: None,
            translation_timeout: Duration::from_secs(30),
            require_auth: false,
            relay_self_mute: true,
            ice_policy: IcePolicy::Discard,
            default_target_language: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // .env необязателен
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Сборка конфигурации из произвольного источника ключей
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());

        let bind_addr = match get("BIND_ADDR") {
            Some(s) => s
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidValue("BIND_ADDR".to_string(), s))?,
            None => defaults.bind_addr,
        };

        let public_dir = get("PUBLIC_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.public_dir);

        let translation_timeout = match get("TRANSLATION_TIMEOUT_SECS") {
            Some(s) => s
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::InvalidValue("TRANSLATION_TIMEOUT_SECS".to_string(), s))?,
            None => defaults.translation_timeout,
        };

        let require_auth = parse_flag("REQUIRE_AUTH", get("REQUIRE_AUTH"), defaults.require_auth)?;
        let relay_self_mute = parse_flag(
            "RELAY_SELF_MUTE",
            get("RELAY_SELF_MUTE"),
            defaults.relay_self_mute,
        )?;

        let ice_policy = match get("ICE_POLICY").as_deref() {
            None => defaults.ice_policy,
            Some("discard") => IcePolicy::Discard,
            Some("buffer") => IcePolicy::Buffer,
            Some(other) => {
                return Err(ConfigError::InvalidValue(
                    "ICE_POLICY".to_string(),
                    other.to_string(),
                ))
            }
        };

        Ok(Self {
            bind_addr,
            public_dir,
            translation_url: get("TRANSLATION_URL"),
            translation_timeout,
            require_auth,
            relay_self_mute,
            ice_policy,
            default_target_language: get("DEFAULT_TARGET_LANGUAGE"),
        })
    }
}

fn parse_flag(key: &str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match value {
        None => Ok(default),
        Some(s) => match s.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key.to_string(), s)),
        },
    }
}
