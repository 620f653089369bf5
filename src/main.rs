// src/main.rs

mod alert_store;
mod captioner;
mod config;
mod detection;
mod escalation;
mod frame_buffer;
mod frame_source;
mod media;
mod track_state;
mod tracker;
mod translator;
mod types;
mod weapon_detection;

use alert_store::SqliteAlertStore;
use anyhow::Result;
use captioner::HttpCaptioner;
use detection::{DetectionController, LoopSettings, Pipeline, StartStatus};
use escalation::{api_keys_from_env, ApiKeyPool, GeminiJudge};
use frame_source::{CameraSource, FrameSource};
use media::{HttpAssetUploader, OpenCvClipRecorder};
use std::sync::Arc;
use tracker::YoloWeaponTracker;
use tracing::{info, warn};
use translator::HttpTranslator;
use weapon_detection::WeaponDetector;

fn main() -> Result<()> {
    let config = types::Config::load("config.yaml")?;

    tracing_subscriber::fmt()
        .with_env_filter(config.logging.level.clone())
        .init();

    info!("🦅 Centinela Weapon Surveillance Starting");
    info!("✓ Configuration loaded");
    info!(
        "Detection thresholds: model={:.2}, alert={:.2}, sample_interval={}",
        config.detection.model_confidence,
        config.detection.min_confidence,
        config.detection.sample_interval
    );

    let store = Arc::new(SqliteAlertStore::open(&config.storage.db_path)?);

    let detector = WeaponDetector::new(&config.detection)?;
    let tracker = Box::new(YoloWeaponTracker::new(detector, &config.detection));
    info!("✓ Weapon tracker ready");

    let keys = api_keys_from_env().unwrap_or_else(|| config.judge.api_keys.clone());
    let judge = Arc::new(GeminiJudge::new(&config.judge, ApiKeyPool::new(keys)?)?);
    info!("✓ Escalation judge ready ({})", config.judge.model);

    let pipeline = Pipeline {
        captioner: Arc::new(HttpCaptioner::new(&config.caption)?),
        translator: Arc::new(HttpTranslator::new(&config.translate)?),
        judge,
        store: Arc::clone(&store),
        recorder: Arc::new(OpenCvClipRecorder::new(
            &config.media.videos_dir,
            config.media.clip_fps,
        )?),
        uploader: Arc::new(HttpAssetUploader::new(&config.storage)?),
    };
    info!("✓ Event pipeline ready");

    let camera = config.camera.clone();
    let opener = Box::new(move || {
        CameraSource::open(&camera).map(|source| Box::new(source) as Box<dyn FrameSource>)
    });

    let controller = DetectionController::new(
        LoopSettings::from_config(&config),
        tracker,
        opener,
        pipeline,
    );

    if controller.start(config.session.clone())? == StartStatus::AlreadyActive {
        warn!("⚠️  Detection already active");
    }
    info!(
        "📡 Watching {} ({})",
        config.session.nombre_local, config.session.ip_camara
    );
    info!("Press Enter to stop detection");

    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;

    controller.stop();
    controller.join();

    let status = controller.status();
    info!("\n📊 Final Report:");
    info!("  Frames processed: {}", status.frames_processed);
    info!("  Tracked weapons: {}", status.tracked_count);

    match controller.recent_alerts(10) {
        Ok(alerts) => {
            info!("  Recent alerts: {}", alerts.len());
            for alert in &alerts {
                info!(
                    "  🚨 {} | track {} | {}",
                    alert.timestamp.to_rfc3339(),
                    alert.track_id,
                    alert.descripcion_arma
                );
            }
        }
        Err(e) => warn!("Failed to read recent alerts: {e:#}"),
    }

    Ok(())
}
