// src/tracker.rs
//
// IoU-based tracker for weapon detections.
//
// Design:
//   - Greedy IoU matching (sufficient for a handful of objects per frame)
//   - Tracks coast through brief detection gaps (occlusion, motion blur)
//   - Tentative tracks expose no id until confirmed; the detection loop
//     skips boxes without an assigned identity

use crate::types::{DetectionConfig, Frame};
use crate::weapon_detection::{calculate_iou, Detection, WeaponDetector};
use anyhow::Result;
use tracing::debug;

/// A detection with (maybe) a tracker-assigned identity.
#[derive(Debug, Clone)]
pub struct TrackedWeapon {
    pub track_id: Option<u32>,
    pub bbox: [f32; 4],
    pub confidence: f32,
}

/// Per-frame detection + identity tracking.
pub trait WeaponTracker: Send {
    fn track(&mut self, frame: &Frame) -> Result<Vec<TrackedWeapon>>;
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Minimum IoU to match a detection to an existing track
    pub min_iou: f32,
    /// Frames a track survives without a detection before deletion
    pub max_coast_frames: u32,
    /// Consecutive hits required to promote Tentative -> Confirmed
    pub min_hits_to_confirm: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_iou: 0.3,
            max_coast_frames: 12,
            min_hits_to_confirm: 2,
        }
    }
}

struct Track {
    id: u32,
    bbox: [f32; 4],
    hits: u32,
    misses: u32,
    confirmed: bool,
}

/// Greedy IoU association across frames.
pub struct IouTracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u32,
}

impl IouTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Associate the frame's detections with existing tracks and return
    /// them with their assigned identities (None while tentative).
    pub fn update(&mut self, detections: &[Detection]) -> Vec<TrackedWeapon> {
        // All candidate (track, detection) pairs above the IoU floor,
        // best first
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                let iou = calculate_iou(&track.bbox, &det.bbox);
                if iou >= self.config.min_iou {
                    pairs.push((ti, di, iou));
                }
            }
        }
        pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_track: Vec<Option<usize>> = vec![None; detections.len()];

        for (ti, di, _) in pairs {
            if track_matched[ti] || det_track[di].is_some() {
                continue;
            }
            track_matched[ti] = true;
            det_track[di] = Some(ti);
        }

        // Update matched tracks, capturing the identity each detection got
        let mut det_identity: Vec<Option<Option<u32>>> = vec![None; detections.len()];
        for (di, slot) in det_track.iter().enumerate() {
            if let Some(ti) = slot {
                let track = &mut self.tracks[*ti];
                track.bbox = detections[di].bbox;
                track.hits += 1;
                track.misses = 0;
                if !track.confirmed && track.hits >= self.config.min_hits_to_confirm {
                    track.confirmed = true;
                    debug!("Track #{} confirmed", track.id);
                }
                det_identity[di] = Some(if track.confirmed {
                    Some(track.id)
                } else {
                    None
                });
            }
        }

        // New tentative tracks for unmatched detections
        for (di, det) in detections.iter().enumerate() {
            if det_identity[di].is_some() {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            let confirmed = self.config.min_hits_to_confirm <= 1;
            self.tracks.push(Track {
                id,
                bbox: det.bbox,
                hits: 1,
                misses: 0,
                confirmed,
            });
            det_identity[di] = Some(if confirmed { Some(id) } else { None });
        }

        // Age unmatched tracks, drop the ones that coasted too long
        for (ti, track) in self.tracks.iter_mut().enumerate() {
            if ti < track_matched.len() && !track_matched[ti] {
                track.misses += 1;
            }
        }
        let max_coast = self.config.max_coast_frames;
        self.tracks.retain(|t| t.misses <= max_coast);

        detections
            .iter()
            .zip(det_identity)
            .map(|(det, identity)| TrackedWeapon {
                track_id: identity.flatten(),
                bbox: det.bbox,
                confidence: det.confidence,
            })
            .collect()
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.iter().filter(|t| t.confirmed).count()
    }
}

/// Weapon detector + IoU tracker behind the `WeaponTracker` seam.
pub struct YoloWeaponTracker {
    detector: WeaponDetector,
    tracker: IouTracker,
    model_confidence: f32,
}

impl YoloWeaponTracker {
    pub fn new(detector: WeaponDetector, config: &DetectionConfig) -> Self {
        Self {
            detector,
            tracker: IouTracker::new(TrackerConfig::default()),
            model_confidence: config.model_confidence,
        }
    }
}

impl WeaponTracker for YoloWeaponTracker {
    fn track(&mut self, frame: &Frame) -> Result<Vec<TrackedWeapon>> {
        let detections = self.detector.detect(
            &frame.data,
            frame.width,
            frame.height,
            self.model_confidence,
        )?;
        Ok(self.tracker.update(&detections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            bbox: [x1, y1, x2, y2],
            confidence: 0.9,
            class_id: 0,
        }
    }

    #[test]
    fn test_track_tentative_then_confirmed() {
        let mut tracker = IouTracker::new(TrackerConfig::default());

        let first = tracker.update(&[det(100.0, 100.0, 200.0, 200.0)]);
        assert_eq!(first.len(), 1);
        assert!(first[0].track_id.is_none(), "fresh track must be tentative");

        let second = tracker.update(&[det(105.0, 102.0, 205.0, 202.0)]);
        assert_eq!(second[0].track_id, Some(1));
    }

    #[test]
    fn test_track_id_stable_across_frames() {
        let mut tracker = IouTracker::new(TrackerConfig::default());

        tracker.update(&[det(100.0, 100.0, 200.0, 200.0)]);
        let a = tracker.update(&[det(104.0, 100.0, 204.0, 200.0)]);
        let b = tracker.update(&[det(108.0, 101.0, 208.0, 201.0)]);
        assert_eq!(a[0].track_id, b[0].track_id);
    }

    #[test]
    fn test_separate_objects_get_separate_ids() {
        let mut tracker = IouTracker::new(TrackerConfig::default());

        tracker.update(&[
            det(0.0, 0.0, 50.0, 50.0),
            det(300.0, 300.0, 400.0, 400.0),
        ]);
        let out = tracker.update(&[
            det(2.0, 1.0, 52.0, 51.0),
            det(303.0, 301.0, 403.0, 401.0),
        ]);
        assert_eq!(out[0].track_id, Some(1));
        assert_eq!(out[1].track_id, Some(2));
    }

    #[test]
    fn test_track_dropped_after_coasting() {
        let config = TrackerConfig {
            max_coast_frames: 2,
            ..TrackerConfig::default()
        };
        let mut tracker = IouTracker::new(config);

        tracker.update(&[det(100.0, 100.0, 200.0, 200.0)]);
        tracker.update(&[det(100.0, 100.0, 200.0, 200.0)]);
        assert_eq!(tracker.active_tracks(), 1);

        tracker.update(&[]);
        tracker.update(&[]);
        tracker.update(&[]);
        assert_eq!(tracker.active_tracks(), 0);

        // Same position again: a new identity, not the old one
        tracker.update(&[det(100.0, 100.0, 200.0, 200.0)]);
        let out = tracker.update(&[det(100.0, 100.0, 200.0, 200.0)]);
        assert_eq!(out[0].track_id, Some(2));
    }
}
