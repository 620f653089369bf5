// src/detection.rs
//
// Detection loop orchestrator.
//
// Lifecycle is STOPPED -> RUNNING -> STOPPED, single session, no pause.
// The control surface (start/stop/status) stays responsive because the
// per-frame loop runs on a dedicated worker thread; the run flag is the
// single source of truth, checked once per processed frame, so stop
// latency is bounded by one frame's processing time.
//
// Per frame: every frame lands in the ring buffer; every Nth frame goes to
// the tracker; a tracked weapon box at high confidence whose caption
// drifted from the track's stored one triggers the event path: persist a
// baseline alert, consult the escalation judge once, and on a confident
// verdict capture/encode/upload a clip and attach it to the alert. Every
// collaborator failure on that path is logged and contained; nothing
// aborts the frame loop.

use crate::alert_store::{AlertRefinement, AlertStore, StoredAlert};
use crate::captioner::Captioner;
use crate::escalation::{EscalationJudge, JudgeOutcome, JudgeRequest, JudgeVerdict};
use crate::frame_buffer::FrameRingBuffer;
use crate::frame_source::FrameSource;
use crate::media::{self, AssetUploader, ClipRecorder, TempArtifact};
use crate::track_state::TrackStateMap;
use crate::tracker::{TrackedWeapon, WeaponTracker};
use crate::translator::Translator;
use crate::types::{Config, Frame, SessionParams};

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    Started,
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    Stopping,
    NotActive,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub active: bool,
    pub tracked_count: usize,
    pub frames_processed: u64,
    pub device: String,
}

/// Opens a fresh frame source for each session.
pub type SourceOpener = Box<dyn Fn() -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// The collaborators driven from the event path. All are shared handles;
/// each call site tolerates its collaborator failing.
#[derive(Clone)]
pub struct Pipeline {
    pub captioner: Arc<dyn Captioner>,
    pub translator: Arc<dyn Translator>,
    pub judge: Arc<dyn EscalationJudge>,
    pub store: Arc<dyn AlertStore>,
    pub recorder: Arc<dyn ClipRecorder>,
    pub uploader: Arc<dyn AssetUploader>,
}

#[derive(Clone)]
pub struct LoopSettings {
    pub sample_interval: u64,
    pub min_confidence: f32,
    pub buffer_frames: usize,
    pub escalation_threshold: u32,
    pub history_window_secs: i64,
    pub frames_dir: PathBuf,
    pub jpeg_quality: u8,
    pub device: String,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sample_interval: config.detection.sample_interval.max(1),
            min_confidence: config.detection.min_confidence,
            buffer_frames: config.media.buffer_frames,
            escalation_threshold: config.judge.escalation_threshold,
            history_window_secs: config.judge.history_window_secs,
            frames_dir: PathBuf::from(&config.media.frames_dir),
            jpeg_quality: config.media.jpeg_quality,
            device: if config.detection.use_cuda {
                "cuda".to_string()
            } else {
                "cpu".to_string()
            },
        }
    }
}

struct Shared {
    running: AtomicBool,
    tracked: AtomicUsize,
    frames: AtomicU64,
    session: Mutex<Option<SessionParams>>,
}

pub struct DetectionController {
    shared: Arc<Shared>,
    tracker: Arc<Mutex<Box<dyn WeaponTracker>>>,
    pipeline: Pipeline,
    opener: SourceOpener,
    settings: LoopSettings,
    /// Also serializes control requests: start/stop/join hold this lock.
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DetectionController {
    pub fn new(
        settings: LoopSettings,
        tracker: Box<dyn WeaponTracker>,
        opener: SourceOpener,
        pipeline: Pipeline,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                tracked: AtomicUsize::new(0),
                frames: AtomicU64::new(0),
                session: Mutex::new(None),
            }),
            tracker: Arc::new(Mutex::new(tracker)),
            pipeline,
            opener,
            settings,
            worker: Mutex::new(None),
        }
    }

    /// Launch a detection session. Only valid from STOPPED; a start while
    /// RUNNING is reported, not an error, and leaves the session alone.
    pub fn start(&self, params: SessionParams) -> Result<StartStatus> {
        let mut worker = self.worker.lock().unwrap();

        if self.shared.running.load(Ordering::SeqCst) {
            warn!("⚠️  La detección ya está activa");
            return Ok(StartStatus::AlreadyActive);
        }

        // The previous worker saw the flag drop; it exits after at most
        // one more frame. Drain it before reusing the tracker.
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }

        let source = match (self.opener)() {
            Ok(source) => source,
            Err(e) => {
                error!("❌ Error al abrir cámara o stream: {e:#}");
                return Err(e);
            }
        };

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.tracked.store(0, Ordering::SeqCst);
        self.shared.frames.store(0, Ordering::SeqCst);
        *self.shared.session.lock().unwrap() = Some(params.clone());

        let env = WorkerEnv {
            pipeline: self.pipeline.clone(),
            settings: self.settings.clone(),
            params,
            shared: Arc::clone(&self.shared),
        };
        let tracker = Arc::clone(&self.tracker);

        let handle = thread::Builder::new()
            .name("detection-loop".to_string())
            .spawn(move || detection_loop(source, tracker, env));
        match handle {
            Ok(handle) => {
                *worker = Some(handle);
                info!("🟢 Sistema de detección iniciado");
                Ok(StartStatus::Started)
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Request the loop to exit after its current frame. In-flight judge or
    /// upload calls are not cancelled; the flag only prevents the next one.
    pub fn stop(&self) -> StopStatus {
        let _worker = self.worker.lock().unwrap();

        if !self.shared.running.swap(false, Ordering::SeqCst) {
            warn!("⚠️  La detección no está activa");
            return StopStatus::NotActive;
        }
        info!("🔴 Deteniendo la detección");
        StopStatus::Stopping
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            active: self.shared.running.load(Ordering::SeqCst),
            tracked_count: self.shared.tracked.load(Ordering::SeqCst),
            frames_processed: self.shared.frames.load(Ordering::SeqCst),
            device: self.settings.device.clone(),
        }
    }

    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<StoredAlert>> {
        self.pipeline.store.recent(limit)
    }

    /// Wait for the worker to finish. Call after `stop()`, or after the
    /// source ended the session on its own.
    pub fn join(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// WORKER
// ============================================================================

struct WorkerEnv {
    pipeline: Pipeline,
    settings: LoopSettings,
    params: SessionParams,
    shared: Arc<Shared>,
}

fn detection_loop(
    mut source: Box<dyn FrameSource>,
    tracker: Arc<Mutex<Box<dyn WeaponTracker>>>,
    env: WorkerEnv,
) {
    info!(
        "🟢 Bucle de detección en marcha ({})",
        env.params.nombre_local
    );

    if let Err(e) = std::fs::create_dir_all(&env.settings.frames_dir) {
        error!("Cannot create frames directory: {e}");
    }

    // Uncontended: exactly one worker is alive at a time
    let mut engine = tracker.lock().unwrap();
    let mut track_state = TrackStateMap::new();
    let mut ring = FrameRingBuffer::new(env.settings.buffer_frames);
    let mut frame_count: u64 = 0;

    while env.shared.running.load(Ordering::SeqCst) {
        let frame = match source.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                error!("❌ Error al capturar frame: stream terminado");
                break;
            }
            Err(e) => {
                error!("❌ Error al capturar frame: {e:#}");
                break;
            }
        };

        frame_count += 1;
        env.shared.frames.store(frame_count, Ordering::SeqCst);

        // Every frame is buffered so a clip keeps full temporal resolution
        ring.push(frame.clone());

        // Temporal subsampling bounds tracker compute
        if frame_count % env.settings.sample_interval != 0 {
            continue;
        }

        let boxes = match engine.track(&frame) {
            Ok(boxes) => boxes,
            Err(e) => {
                debug!("Tracker failed on frame {frame_count}: {e:#}");
                continue;
            }
        };

        for tracked in &boxes {
            // Boxes without an assigned identity are skipped, not fatal
            let Some(track_id) = tracked.track_id else {
                continue;
            };
            if tracked.confidence < env.settings.min_confidence {
                continue;
            }
            handle_tracked_box(&env, &ring, &mut track_state, &frame, track_id, tracked);
        }

        env.shared
            .tracked
            .store(track_state.len(), Ordering::SeqCst);
    }

    env.shared.running.store(false, Ordering::SeqCst);
    info!("🔴 Sistema de detección detenido ({frame_count} frames)");
    // Dropping the source releases the camera
}

fn handle_tracked_box(
    env: &WorkerEnv,
    ring: &FrameRingBuffer,
    track_state: &mut TrackStateMap,
    frame: &Frame,
    track_id: u32,
    tracked: &TrackedWeapon,
) {
    let Some((crop, crop_w, crop_h)) = media::crop_region(frame, &tracked.bbox) else {
        return;
    };
    let Some(crop_jpeg) =
        media::encode_rgb_to_jpeg(&crop, crop_w, crop_h, env.settings.jpeg_quality)
    else {
        debug!("JPEG encode failed for track {track_id}");
        return;
    };

    let caption = match env.pipeline.captioner.describe(&crop_jpeg) {
        Ok(caption) => caption,
        Err(e) => {
            warn!("Caption failed for track {track_id}: {e:#}");
            return;
        }
    };

    // The only trigger for persistence, escalation and media capture
    if !track_state.is_state_change(track_id, &caption) {
        return;
    }

    info!(
        "🚨 ALERTA - track {track_id}: \"{caption}\" ({:.1}%)",
        tracked.confidence * 100.0
    );

    let descripcion = env.pipeline.translator.to_spanish(&caption);

    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let frame_path = env
        .settings
        .frames_dir
        .join(format!("alerta_{track_id}_{stamp}.jpg"));
    let label = format!("ARMA ID:{track_id} {:.1}%", tracked.confidence * 100.0);
    if let Err(e) = media::save_alert_frame(frame, &tracked.bbox, &label, &frame_path) {
        warn!("Failed to save alert frame: {e:#}");
    }

    // Prior alerts for this track, before this event's own record lands
    let window = Duration::seconds(env.settings.history_window_secs);
    let history = env
        .pipeline
        .store
        .history_for_track(track_id, window)
        .unwrap_or_else(|e| {
            warn!("History lookup failed for track {track_id}: {e:#}");
            Vec::new()
        });

    // Baseline alert goes in first so a record exists even if everything
    // downstream fails
    let alert_id = Uuid::new_v4().to_string();
    let alert = StoredAlert {
        alert_id: alert_id.clone(),
        timestamp: Utc::now(),
        track_id,
        confidence: tracked.confidence,
        descripcion_arma: descripcion.clone(),
        latitud: env.params.latitud,
        longitud: env.params.longitud,
        nombre_local: env.params.nombre_local.clone(),
        ip_camara: env.params.ip_camara.clone(),
        processed: false,
        video_url: None,
        frame_url: None,
        refined_description: None,
        confidence_level: None,
    };
    if let Err(e) = env.pipeline.store.insert(&alert) {
        error!("❌ Error al guardar alerta: {e:#}");
    }

    let frame_jpeg =
        media::encode_rgb_to_jpeg(&frame.data, frame.width, frame.height, env.settings.jpeg_quality)
            .unwrap_or_default();
    let request = JudgeRequest {
        descripcion,
        detector_confidence: tracked.confidence,
        history: history.iter().map(|a| a.descripcion_arma.clone()).collect(),
        frame_jpeg,
        frame_path: frame_path.display().to_string(),
    };

    match env.pipeline.judge.assess(&request) {
        JudgeOutcome::Verdict(verdict) => {
            info!(
                "🎯 Confianza: {} | Gravedad: {}",
                verdict.confidence_level, verdict.threat_severity
            );
            if verdict.confidence_level >= env.settings.escalation_threshold {
                capture_and_attach(env, ring, &alert_id, track_id, &stamp, &frame_path, &verdict);
            }
        }
        JudgeOutcome::Unparseable => {
            warn!("⚠️  Refinamiento no disponible; la alerta {alert_id} queda como base");
        }
    }

    // Stored only after the event is handled; a failed attempt re-fires on
    // the next sampled frame
    track_state.record(track_id, caption);
}

fn capture_and_attach(
    env: &WorkerEnv,
    ring: &FrameRingBuffer,
    alert_id: &str,
    track_id: u32,
    stamp: &str,
    frame_path: &Path,
    verdict: &JudgeVerdict,
) {
    // Fixed-length buffer snapshot, not a live re-read
    let snapshot = ring.snapshot();
    let tag = format!("{track_id}_{stamp}");

    let clip_path = match env.pipeline.recorder.materialize(&snapshot, &tag) {
        Ok(path) => path,
        Err(e) => {
            error!("❌ Clip pipeline failed for alert {alert_id}: {e:#}");
            return;
        }
    };

    // Both local files go away after the upload attempt, uploaded or not
    let _clip_guard = TempArtifact::new(clip_path.clone());
    let _frame_guard = TempArtifact::new(frame_path.to_path_buf());

    let video_url = env.pipeline.uploader.upload_video(&clip_path);
    let frame_url = env.pipeline.uploader.upload_frame(frame_path);

    if video_url.is_none() {
        warn!("Alert {alert_id} keeps baseline fields (no media uploaded)");
        return;
    }

    let refinement = AlertRefinement {
        video_url,
        frame_url,
        refined_description: verdict.refined_description.clone(),
        confidence_level: verdict.confidence_level,
    };
    if let Err(e) = env.pipeline.store.attach_refinement(alert_id, &refinement) {
        error!("❌ Error al adjuntar media a la alerta {alert_id}: {e:#}");
    }
}

// ============================================================================
// TESTS
// ============================================================================
