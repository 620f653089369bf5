// src/alert_store.rs
//
// Durable alert records. The store exposes document-style operations:
// insert once per state-changing event, update at most once more when
// escalation/media succeeds, plus the two read paths the control surface
// and the judge need (recent alerts, per-track history window).

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

/// Persistence record. Field names are the wire format and must round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub track_id: u32,
    pub confidence: f32,
    pub descripcion_arma: String,
    pub latitud: f64,
    pub longitud: f64,
    pub nombre_local: String,
    pub ip_camara: String,
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refined_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_level: Option<u32>,
}

/// Fields attached to an existing alert after successful escalation.
#[derive(Debug, Clone)]
pub struct AlertRefinement {
    pub video_url: Option<String>,
    pub frame_url: Option<String>,
    pub refined_description: Option<String>,
    pub confidence_level: u32,
}

pub trait AlertStore: Send + Sync {
    fn insert(&self, alert: &StoredAlert) -> Result<()>;
    /// Update-not-create, keyed by alert id. A missing id is logged, not
    /// an error: the baseline alert may have failed to persist.
    fn attach_refinement(&self, alert_id: &str, refinement: &AlertRefinement) -> Result<()>;
    /// Most recent alerts, newest first.
    fn recent(&self, limit: usize) -> Result<Vec<StoredAlert>>;
    /// Alerts for one track within the look-back window, oldest first.
    fn history_for_track(&self, track_id: u32, window: Duration) -> Result<Vec<StoredAlert>>;
}

// ============================================================================
// SQLITE IMPLEMENTATION
// ============================================================================

/// Migrations in order; PRAGMA user_version tracks progress.
const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS alerts (
        alert_id TEXT PRIMARY KEY NOT NULL,
        timestamp TEXT NOT NULL,
        track_id INTEGER NOT NULL,
        confidence REAL NOT NULL,
        descripcion_arma TEXT NOT NULL,
        latitud REAL NOT NULL,
        longitud REAL NOT NULL,
        nombre_local TEXT NOT NULL,
        ip_camara TEXT NOT NULL,
        processed INTEGER NOT NULL DEFAULT 0,
        video_url TEXT,
        frame_url TEXT,
        refined_description TEXT,
        confidence_level INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_alerts_timestamp ON alerts(timestamp);
    CREATE INDEX IF NOT EXISTS idx_alerts_track ON alerts(track_id, timestamp);
    "#];

pub struct SqliteAlertStore {
    conn: Mutex<Connection>,
}

impl SqliteAlertStore {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Cannot create alert DB directory {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open alert DB {path}"))?;
        Self::initialize(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA busy_timeout=5000;")?;

        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        for (i, sql) in MIGRATIONS.iter().enumerate().skip(version as usize) {
            conn.execute_batch(sql)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", i + 1))?;
        }

        info!("✓ Alert store ready (schema v{})", MIGRATIONS.len());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredAlert> {
    let raw_ts: String = row.get("timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(&raw_ts)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?
        .with_timezone(&Utc);

    Ok(StoredAlert {
        alert_id: row.get("alert_id")?,
        timestamp,
        track_id: row.get("track_id")?,
        confidence: row.get("confidence")?,
        descripcion_arma: row.get("descripcion_arma")?,
        latitud: row.get("latitud")?,
        longitud: row.get("longitud")?,
        nombre_local: row.get("nombre_local")?,
        ip_camara: row.get("ip_camara")?,
        processed: row.get::<_, i64>("processed")? != 0,
        video_url: row.get("video_url")?,
        frame_url: row.get("frame_url")?,
        refined_description: row.get("refined_description")?,
        confidence_level: row.get("confidence_level")?,
    })
}

impl AlertStore for SqliteAlertStore {
    fn insert(&self, alert: &StoredAlert) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alerts (
                alert_id, timestamp, track_id, confidence, descripcion_arma,
                latitud, longitud, nombre_local, ip_camara, processed,
                video_url, frame_url, refined_description, confidence_level
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                alert.alert_id,
                alert.timestamp.to_rfc3339(),
                alert.track_id,
                alert.confidence,
                alert.descripcion_arma,
                alert.latitud,
                alert.longitud,
                alert.nombre_local,
                alert.ip_camara,
                alert.processed as i64,
                alert.video_url,
                alert.frame_url,
                alert.refined_description,
                alert.confidence_level,
            ],
        )
        .context("Failed to insert alert")?;

        info!("💾 Alert {} saved", alert.alert_id);
        Ok(())
    }

    fn attach_refinement(&self, alert_id: &str, refinement: &AlertRefinement) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE alerts SET
                    video_url = ?1,
                    frame_url = ?2,
                    refined_description = ?3,
                    confidence_level = ?4
                 WHERE alert_id = ?5",
                params![
                    refinement.video_url,
                    refinement.frame_url,
                    refinement.refined_description,
                    refinement.confidence_level,
                    alert_id,
                ],
            )
            .context("Failed to update alert")?;

        if updated == 0 {
            warn!("Refinement for unknown alert {alert_id} dropped");
        }
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<StoredAlert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM alerts ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_alert)?;
        let mut alerts = Vec::new();
        for row in rows {
            alerts.push(row?);
        }
        Ok(alerts)
    }

    fn history_for_track(&self, track_id: u32, window: Duration) -> Result<Vec<StoredAlert>> {
        let cutoff = (Utc::now() - window).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM alerts
             WHERE track_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![track_id, cutoff], row_to_alert)?;
        let mut alerts = Vec::new();
        for row in rows {
            alerts.push(row?);
        }
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(id: &str, track_id: u32, descripcion: &str, age: Duration) -> StoredAlert {
        StoredAlert {
            alert_id: id.to_string(),
            timestamp: Utc::now() - age,
            track_id,
            confidence: 0.87,
            descripcion_arma: descripcion.to_string(),
            latitud: -12.046374,
            longitud: -77.042793,
            nombre_local: "Bodega San Martín".to_string(),
            ip_camara: "rtsp://10.0.0.4/stream".to_string(),
            processed: false,
            video_url: None,
            frame_url: None,
            refined_description: None,
            confidence_level: None,
        }
    }

    #[test]
    fn test_insert_and_read_back_round_trip() {
        let store = SqliteAlertStore::open_in_memory().unwrap();
        let original = alert("a1", 7, "pistola negra", Duration::seconds(1));
        store.insert(&original).unwrap();

        let read = store.recent(10).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0], original);
    }

    #[test]
    fn test_recent_is_newest_first_and_limited() {
        let store = SqliteAlertStore::open_in_memory().unwrap();
        store
            .insert(&alert("old", 1, "a", Duration::seconds(60)))
            .unwrap();
        store
            .insert(&alert("mid", 1, "b", Duration::seconds(30)))
            .unwrap();
        store
            .insert(&alert("new", 1, "c", Duration::seconds(1)))
            .unwrap();

        let read = store.recent(2).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].alert_id, "new");
        assert_eq!(read[1].alert_id, "mid");
    }

    #[test]
    fn test_history_window_filters_and_orders_oldest_first() {
        let store = SqliteAlertStore::open_in_memory().unwrap();
        store
            .insert(&alert("stale", 7, "pistola", Duration::seconds(120)))
            .unwrap();
        store
            .insert(&alert("h1", 7, "pistola", Duration::seconds(20)))
            .unwrap();
        store
            .insert(&alert("h2", 7, "pistola levantada", Duration::seconds(5)))
            .unwrap();
        store
            .insert(&alert("other", 9, "cuchillo", Duration::seconds(5)))
            .unwrap();

        let history = store.history_for_track(7, Duration::seconds(30)).unwrap();
        let ids: Vec<&str> = history.iter().map(|a| a.alert_id.as_str()).collect();
        assert_eq!(ids, vec!["h1", "h2"]);
    }

    #[test]
    fn test_attach_refinement_updates_in_place() {
        let store = SqliteAlertStore::open_in_memory().unwrap();
        store
            .insert(&alert("a1", 7, "pistola", Duration::seconds(1)))
            .unwrap();

        store
            .attach_refinement(
                "a1",
                &AlertRefinement {
                    video_url: Some("https://cdn.example/v.mp4".to_string()),
                    frame_url: Some("https://cdn.example/f.jpg".to_string()),
                    refined_description: Some("sujeto apuntando".to_string()),
                    confidence_level: 85,
                },
            )
            .unwrap();

        let read = store.recent(1).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].video_url.as_deref(), Some("https://cdn.example/v.mp4"));
        assert_eq!(read[0].confidence_level, Some(85));
        // Baseline fields untouched
        assert_eq!(read[0].descripcion_arma, "pistola");
    }

    #[test]
    fn test_refinement_for_unknown_alert_is_not_an_error() {
        let store = SqliteAlertStore::open_in_memory().unwrap();
        let outcome = store.attach_refinement(
            "ghost",
            &AlertRefinement {
                video_url: None,
                frame_url: None,
                refined_description: None,
                confidence_level: 10,
            },
        );
        assert!(outcome.is_ok());
    }

    #[test]
    fn test_optional_fields_skipped_in_json_until_present() {
        let baseline = alert("a1", 7, "pistola", Duration::seconds(1));
        let json = serde_json::to_string(&baseline).unwrap();
        assert!(!json.contains("video_url"));
        assert!(!json.contains("refined_description"));

        let mut refined = baseline.clone();
        refined.video_url = Some("https://cdn.example/v.mp4".to_string());
        let json = serde_json::to_string(&refined).unwrap();
        assert!(json.contains("video_url"));

        let back: StoredAlert = serde_json::from_str(&json).unwrap();
        assert_eq!(back, refined);
    }
}
