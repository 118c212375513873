//! Follow a doorbell's alert stream and fan its events out to the configured sinks.
use std::future::ready;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use alert_common::metrics::{serve, setup_metrics_routes};
use alert_common::sink::SinkRegistry;
use alert_worker::config::Config;
use alert_worker::dispatch::Dispatcher;
use alert_worker::error::WorkerError;
use alert_worker::health::{HealthRegistry, LinkStatus};
use alert_worker::reader::{Credentials, HttpConnector};
use alert_worker::sinks::{LogSink, WebhookSink};
use alert_worker::supervisor::{Supervisor, SupervisorSettings};

async fn index() -> &'static str {
    "alert worker"
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

fn sink_registry(config: &Config) -> Result<SinkRegistry, WorkerError> {
    let mut builder = SinkRegistry::builder();

    if config.log_sink {
        builder = builder.register("log", LogSink::default());
    }
    if let Some(webhook_url) = &config.webhook_url {
        let url = Url::parse(webhook_url.as_str())?;
        builder = builder.register("webhook", WebhookSink::new(url, config.sink_timeout.0)?);
    }

    Ok(builder.build())
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let registry = sink_registry(&config)?;
    if registry.is_empty() {
        warn!("no sinks configured, events will only be counted");
    }

    let connector = HttpConnector::new(
        config.device_endpoint()?,
        config.connect_timeout.0,
        config.device_insecure_tls,
    )?
    .with_auth(
        config.auth_scheme,
        Credentials {
            username: config.device_username.clone(),
            password: config.device_password.clone(),
        },
    );

    let shutdown = CancellationToken::new();
    let liveness = HealthRegistry::new("liveness");
    let supervisor_liveness =
        liveness.register("supervisor".to_string(), config.liveness_deadline());

    let (events_tx, events_rx) = mpsc::channel(config.dispatch_queue_capacity.max(1));
    let supervisor = Supervisor::new(
        connector,
        SupervisorSettings {
            retry_policy: config.retry_policy(),
            read_idle_timeout: config.read_idle_timeout.0,
            max_frame_size: config.max_frame_size,
            dedup_quiet_window: config.dedup_quiet_window.0,
            dedup_max_entries: config.dedup_max_entries,
            forward_inactive: config.forward_inactive_events,
        },
        events_tx,
        supervisor_liveness,
        shutdown.clone(),
    );

    let link_state = supervisor.subscribe();
    let router = Router::new()
        .route("/", get(index))
        .route(
            "/_readiness",
            get(move || ready(LinkStatus(*link_state.borrow()))),
        )
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);

    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let dispatcher = Dispatcher::new(registry, config.sink_timeout.0)
        .with_queue_capacity(config.dispatch_queue_capacity);
    let dispatcher = tokio::task::spawn(dispatcher.run(
        events_rx,
        shutdown.clone(),
        config.shutdown_grace_period.0,
    ));

    let signal_shutdown = shutdown.clone();
    tokio::task::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_shutdown.cancel();
    });

    info!(device = %config.device_host.as_str(), "starting alert worker");
    supervisor.run().await;

    if let Err(e) = dispatcher.await {
        error!("dispatcher task failed: {}", e);
    }
    info!("alert worker stopped");

    Ok(())
}
