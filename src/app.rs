use crate::camera::Camera;
use crate::config::Config;
use crate::detector::OrtDetector;
use crate::pipeline::{FramePipeline, PipelineSettings};
use crate::server::{HttpServer, SharedState};
use crate::speech::{engine_from_config, SpeechSession, SpeechWorker};
use crate::telemetry::Metrics;

use std::{error::Error, sync::Arc};
use tokio::{runtime::Handle, signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let metrics = Arc::new(Metrics::new()?);

    let detector = match OrtDetector::new(&config.detector) {
        Ok(detector) => Arc::new(detector),
        Err(e) => {
            tracing::error!("Failed to initialize detector: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let (shutdown_tx, _) = broadcast::channel(1);
    let session = Arc::new(SpeechSession::new());

    let speech = if config.speech.enabled {
        match engine_from_config(&config.speech) {
            Ok(engine) => {
                tracing::info!("Speech enabled with {} engine", engine.name());
                Some(Arc::new(SpeechWorker::new(
                    engine,
                    config.speech.max_concurrent_utterances,
                    Handle::current(),
                    shutdown_tx.clone(),
                    metrics.clone(),
                )))
            }
            Err(e) => {
                tracing::warn!("Speech unavailable, continuing without it: {}", e);
                None
            }
        }
    } else {
        tracing::info!("Speech disabled by configuration");
        None
    };

    let pipeline = Arc::new(FramePipeline::new(
        detector,
        Camera::opener(config.camera.clone()),
        session.clone(),
        speech,
        metrics.clone(),
        PipelineSettings::from_config(&config),
        shutdown_tx.clone(),
    ));

    let state = SharedState {
        pipeline,
        speech_session: session,
        metrics,
    };
    let server = HttpServer::new(state, &config).await?;
    let server_handle = server.run(shutdown_tx.subscribe())?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
