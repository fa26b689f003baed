use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use axum::{Router, routing::get};
use botwatch_proto::HEALTH_PATH;
use confique::Config;
use tokio::{net::TcpListener, signal};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::trace;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::lifecycle::LogMode;

mod lifecycle;
mod observer;
mod route;
mod session;

const CONFIG_PATH_ENV: &str = "BOTWATCH_CONFIG";

#[derive(Config, Debug)]
struct Conf {
    /// Port to listen on
    #[config(env = "PORT", default = 3789)]
    port: u16,

    /// Bind address
    #[config(env = "BIND_ADDRESS", default = "0.0.0.0")]
    address: IpAddr,

    /// `detailed` or `minimal`
    #[config(env = "LOG_MODE", parse_env = lifecycle::parse_log_mode, default = "detailed")]
    log_mode: LogMode,
}

fn config(path: &str) -> anyhow::Result<Conf> {
    Conf::builder()
        .env()
        .file(path)
        .load()
        .map_err(|e| e.into())
}

#[derive(Clone, Debug)]
pub(crate) struct AppState {
    pub log_mode: LogMode,
    pub ws_graceful_shutdown: WebsocketGraceful,
}

impl AppState {
    fn new(log_mode: LogMode) -> Self {
        AppState {
            log_mode,
            ws_graceful_shutdown: WebsocketGraceful {
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct WebsocketGraceful {
    pub token: CancellationToken,
    pub tracker: TaskTracker,
}

fn app(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(route::health))
        .route("/", get(route::ingress_ws))
        .layer((
            TraceLayer::new_for_http(),
            // Prevent requests to hang forever
            TimeoutLayer::new(Duration::from_secs(60)),
        ))
        .with_state(state)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or("config.toml".to_owned());
    let config = config(&config_path)?;
    trace!("using config {:?}", config);

    let addr = SocketAddr::from((config.address, config.port));
    let listener = TcpListener::bind(addr).await?;
    lifecycle::server_started(listener.local_addr()?);

    let state = AppState::new(config.log_mode);

    axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(shutdown_signal(state.ws_graceful_shutdown.token.clone()))
        .await?;

    let ws_tracker = state.ws_graceful_shutdown.tracker.clone();
    ws_tracker.close();

    trace!("waiting {} websocket connection shutdown", ws_tracker.len());
    ws_tracker.wait().await;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                #[cfg(debug_assertions)]
                let default_log_level = format!(
                    "{}=debug,tower_http=debug,axum=trace",
                    env!("CARGO_CRATE_NAME")
                )
                .into();

                #[cfg(not(debug_assertions))]
                let default_log_level = format!(
                    "{}=info,tower_http=info,axum=info",
                    env!("CARGO_CRATE_NAME")
                )
                .into();

                default_log_level
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal(ws_token: CancellationToken) {
    let _ws_shutdown_guard = ws_token.drop_guard();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_is_independent_of_websocket_state() {
        let state = AppState::new(LogMode::Detailed);
        state.ws_graceful_shutdown.token.cancel();

        let req = Request::builder()
            .uri(HEALTH_PATH)
            .body(Body::empty())
            .unwrap();
        let res = app(state).oneshot(req).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn plain_get_on_root_is_not_upgraded() {
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let res = app(AppState::new(LogMode::Detailed))
            .oneshot(req)
            .await
            .unwrap();

        assert!(res.status().is_client_error());
    }

    #[test]
    fn config_defaults() {
        let conf = Conf::builder().load().unwrap();

        assert_eq!(conf.port, 3789);
        assert_eq!(conf.log_mode, LogMode::Detailed);
        assert!(conf.address.is_unspecified());
    }
}
