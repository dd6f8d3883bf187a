use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voxroom::{server, AppState, Config};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,voxroom=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Не удалось загрузить конфигурацию: {}", e);
            std::process::exit(1);
        }
    };
    let addr = config.bind_addr;

    let app_state = match AppState::from_config(config) {
        Ok(state) => state,
        Err(e) => {
            error!("Не удалось создать клиент перевода: {}", e);
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Не удалось занять адрес {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("Сервер запущен по адресу http://{}", addr);

    if let Err(e) = axum::serve(listener, server::router(app_state).into_make_service()).await {
        error!("Сервер остановился с ошибкой: {}", e);
        std::process::exit(1);
    }
}
