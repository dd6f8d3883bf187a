//! Комнаты голосовой связи с сигналингом WebRTC и релеем перевода.

pub mod app_state;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod ingest;
pub mod playback;
pub mod relay;
pub mod room;
pub mod server;
pub mod session;
pub mod signal;

pub use app_state::AppState;
pub use config::Config;
pub use error::RelayError;
