use std::{str::FromStr, sync::Arc};

use anyhow::Context;
use encoder_bus::{StreamRouter, sim::SimEncoder};
use tokio_util::sync::CancellationToken;

use lite_rtsp::{
    api,
    capability::StaticCapabilities,
    config,
    pool::ThreadPool,
    rtsp::{Authenticator, PortAllocator, RtspHandler, SessionRegistry},
    server::RtspServer,
};

fn init_logging(level: &str) {
    let level = log::LevelFilter::from_str(level).unwrap_or(log::LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(level)
        .filter_module("lite_rtsp", level)
        .filter_module("encoder_bus", level)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config::config_path();
    config::init(path.as_deref())?;
    let config = config::config();
    init_logging(&config.log_level);
    log::info!("config loaded from {}", path.as_deref().unwrap_or("built-in defaults"));

    let router = StreamRouter::new(
        SimEncoder::new(config.encoder.channel_capacity).with_frame_rate(config.encoder.frame_rate),
    );
    for profile in &config.profiles {
        router.bind_profile(&profile.token, profile.binding());
    }
    let caps = StaticCapabilities::from_config(config);
    log::info!("profiles: {}", caps.tokens().collect::<Vec<_>>().join(", "));

    let sessions = SessionRegistry::new();
    let handler = RtspHandler::new(
        Arc::new(caps),
        router.clone(),
        PortAllocator::new(config.rtp_port_range.start, config.rtp_port_range.end),
        sessions.clone(),
        config.default_session_timeout(),
        config.session_poll(),
    )
    .with_auth(Authenticator::from_config(&config.auth));
    let pool = Arc::new(
        ThreadPool::new(config.pool.options(), Arc::new(handler)).context("starting worker pool")?,
    );
    let server = RtspServer::bind(&config.rtsp_listen, Arc::clone(&pool))?;

    let cancel = CancellationToken::new();
    if !config.api_listen.is_empty() {
        let state = api::ApiState {
            router,
            sessions,
            pool: Arc::clone(&pool),
        };
        api::start_api_server(config.api_listen.clone(), state, cancel.clone());
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    log::info!("shutting down");
    let report = tokio::task::spawn_blocking(move || {
        server.stop();
        pool.shutdown()
    })
    .await?;
    if report.abandoned > 0 {
        log::error!("{} worker(s) abandoned at shutdown", report.abandoned);
    }
    Ok(())
}
