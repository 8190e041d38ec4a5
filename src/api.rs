use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use encoder_bus::{RouterStats, StreamRouter};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::Connection,
    pool::{PoolStats, ThreadPool},
    rtsp::{SessionRegistry, SessionSummary},
};

#[derive(Clone)]
pub struct ApiState {
    pub router: StreamRouter,
    pub sessions: SessionRegistry,
    pub pool: Arc<ThreadPool<Connection>>,
}

pub fn system_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/streams", get(streams))
        .route("/sessions", get(sessions))
        .route("/pool", get(pool))
        .with_state(state)
}

pub fn start_api_server(listen: String, state: ApiState, cancel: CancellationToken) {
    tokio::spawn(async move {
        let app = Router::new().nest("/system", system_router(state));

        let listener = match TcpListener::bind(&listen).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("API server cannot bind {}: {}", listen, e);
                return;
            }
        };
        log::info!("API server started on {}", listen);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("Error running API server: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}

async fn index() -> &'static str {
    "lite-rtsp status"
}

async fn streams(State(state): State<ApiState>) -> Json<RouterStats> {
    Json(state.router.stats())
}

async fn sessions(State(state): State<ApiState>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.snapshot())
}

async fn pool(State(state): State<ApiState>) -> Json<PoolStats> {
    Json(state.pool.stats())
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use encoder_bus::{ProfileBinding, sim::SimEncoder};

    use super::*;
    use crate::{
        pool::{PoolOptions, WorkerContext},
        rtsp::{Session, ports::PortAllocator, session::DEFAULT_SESSION_TIMEOUT},
    };

    fn state() -> ApiState {
        let router = StreamRouter::new(SimEncoder::default())
            .with_profile("main", ProfileBinding::video_only(0));
        let dispatch = |_conn: Connection, _ctx: &WorkerContext| {};
        ApiState {
            router,
            sessions: SessionRegistry::new(),
            pool: Arc::new(ThreadPool::new(PoolOptions::new(2), Arc::new(dispatch)).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_streams_reports_refcounts() {
        let state = state();
        let _a = state.router.acquire("main").unwrap();
        let _b = state.router.acquire("main").unwrap();

        let Json(stats) = streams(State(state.clone())).await;
        assert_eq!(stats.refcount("main"), 2);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["streams"]["main"], 2);
    }

    #[tokio::test]
    async fn test_sessions_and_pool() {
        let state = state();
        let now = Instant::now();
        let session = Session::new(
            "00000000000000AB".to_string(),
            state.router.clone(),
            PortAllocator::new(50000, 50010),
            DEFAULT_SESSION_TIMEOUT,
            now,
        );
        state
            .sessions
            .update(SessionSummary::of(&session, "127.0.0.1:5000", now));

        let Json(list) = sessions(State(state.clone())).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "00000000000000AB");

        let Json(stats) = pool(State(state.clone())).await;
        assert_eq!(stats.threads, 2);
        assert_eq!(stats.queued, 0);
        assert!(!stats.shutdown);
    }
}
