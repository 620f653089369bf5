// src/weapon_detection.rs

use crate::types::DetectionConfig;
use anyhow::Result;
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info};

const YOLO_INPUT_SIZE: usize = 640;
const NUM_PREDICTIONS: usize = 8400;

#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: [f32; 4], // [x1, y1, x2, y2] in original image coordinates
    pub confidence: f32,
    pub class_id: usize,
}

pub struct WeaponDetector {
    session: Session,
    num_classes: usize,
    weapon_class_id: usize,
    nms_iou_threshold: f32,
}

impl WeaponDetector {
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        info!("Loading weapon model: {}", config.model_path);

        let mut builder = Session::builder()?;
        if config.use_cuda {
            builder = builder.with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(0)
                .build()])?;
        }
        let session = builder
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.num_threads)?
            .commit_from_file(&config.model_path)?;

        info!("✓ Weapon detector initialized");
        Ok(Self {
            session,
            num_classes: config.num_classes,
            weapon_class_id: config.weapon_class_id,
            nms_iou_threshold: config.nms_iou_threshold,
        })
    }

    pub fn detect(
        &mut self,
        frame: &[u8],
        width: usize,
        height: usize,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>> {
        let (input, scale, pad_x, pad_y) = self.preprocess(frame, width, height)?;

        let output = self.infer(&input)?;

        let detections = self.postprocess(&output, scale, pad_x, pad_y, confidence_threshold)?;

        debug!("Detected {} weapon candidate(s)", detections.len());
        Ok(detections)
    }

    fn preprocess(
        &self,
        src: &[u8],
        src_w: usize,
        src_h: usize,
    ) -> Result<(Vec<f32>, f32, f32, f32)> {
        let target_size = YOLO_INPUT_SIZE;

        // Scale to fit inside 640x640 while keeping aspect ratio
        let scale = (target_size as f32 / src_w as f32).min(target_size as f32 / src_h as f32);
        let scaled_w = (src_w as f32 * scale) as usize;
        let scaled_h = (src_h as f32 * scale) as usize;

        let pad_x = (target_size - scaled_w) as f32 / 2.0;
        let pad_y = (target_size - scaled_h) as f32 / 2.0;

        let resized = resize_bilinear(src, src_w, src_h, scaled_w, scaled_h);

        // Padded 640x640 canvas (gray background)
        let mut canvas = vec![114u8; target_size * target_size * 3];

        for y in 0..scaled_h {
            for x in 0..scaled_w {
                let src_idx = (y * scaled_w + x) * 3;
                let dst_x = x + pad_x as usize;
                let dst_y = y + pad_y as usize;
                let dst_idx = (dst_y * target_size + dst_x) * 3;
                canvas[dst_idx..dst_idx + 3].copy_from_slice(&resized[src_idx..src_idx + 3]);
            }
        }

        // Normalize [0, 255] -> [0, 1] and convert HWC -> CHW
        let mut input = vec![0.0f32; 3 * target_size * target_size];
        for c in 0..3 {
            for h in 0..target_size {
                for w in 0..target_size {
                    let hwc_idx = (h * target_size + w) * 3 + c;
                    let chw_idx = c * target_size * target_size + h * target_size + w;
                    input[chw_idx] = canvas[hwc_idx] as f32 / 255.0;
                }
            }
        }

        Ok((input, scale, pad_x, pad_y))
    }

    fn infer(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let shape = [1, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.to_vec().into_boxed_slice()))?;

        let outputs = self.session.run(ort::inputs!["images" => input_value])?;
        let output = &outputs[0];
        let (_, data) = output.try_extract_tensor::<f32>()?;

        Ok(data.to_vec())
    }

    fn postprocess(
        &self,
        output: &[f32],
        scale: f32,
        pad_x: f32,
        pad_y: f32,
        conf_thresh: f32,
    ) -> Result<Vec<Detection>> {
        let mut detections = Vec::new();

        // YOLO output: [1, 4 + num_classes, 8400]
        // Each prediction column: [x, y, w, h, class0_conf, class1_conf, ...]
        for i in 0..NUM_PREDICTIONS {
            let cx = output[i];
            let cy = output[NUM_PREDICTIONS + i];
            let w = output[NUM_PREDICTIONS * 2 + i];
            let h = output[NUM_PREDICTIONS * 3 + i];

            let mut max_conf = 0.0f32;
            let mut best_class = 0;

            for c in 0..self.num_classes {
                let conf = output[NUM_PREDICTIONS * (4 + c) + i];
                if conf > max_conf {
                    max_conf = conf;
                    best_class = c;
                }
            }

            if max_conf < conf_thresh || best_class != self.weapon_class_id {
                continue;
            }

            // Center format -> corner format
            let x1 = cx - w / 2.0;
            let y1 = cy - h / 2.0;
            let x2 = cx + w / 2.0;
            let y2 = cy + h / 2.0;

            // Reverse letterbox transformation
            let x1 = (x1 - pad_x) / scale;
            let y1 = (y1 - pad_y) / scale;
            let x2 = (x2 - pad_x) / scale;
            let y2 = (y2 - pad_y) / scale;

            detections.push(Detection {
                bbox: [x1, y1, x2, y2],
                confidence: max_conf,
                class_id: best_class,
            });
        }

        let detections = nms(detections, self.nms_iou_threshold);

        Ok(detections)
    }
}

fn resize_bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];
    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sy = dy as f32 * y_ratio;
            let sx0 = sx.floor() as usize;
            let sy0 = sy.floor() as usize;
            let sx1 = (sx0 + 1).min(src_w - 1);
            let sy1 = (sy0 + 1).min(src_h - 1);
            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * 3 + c] = val.round() as u8;
            }
        }
    }
    dst
}

pub(crate) fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    detections.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());

    let mut keep = Vec::new();

    while !detections.is_empty() {
        let current = detections.remove(0);
        keep.push(current.clone());

        detections.retain(|det| {
            let iou = calculate_iou(&current.bbox, &det.bbox);
            iou < iou_threshold
        });
    }

    keep
}

pub(crate) fn calculate_iou(box1: &[f32; 4], box2: &[f32; 4]) -> f32 {
    let x1 = box1[0].max(box2[0]);
    let y1 = box1[1].max(box2[1]);
    let x2 = box1[2].min(box2[2]);
    let y2 = box1[3].min(box2[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area1 = (box1[2] - box1[0]) * (box1[3] - box1[1]);
    let area2 = (box2[2] - box2[0]) * (box2[3] - box2[1]);
    let union = area1 + area2 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, conf: f32) -> Detection {
        Detection {
            bbox: [x1, y1, x2, y2],
            confidence: conf,
            class_id: 0,
        }
    }

    #[test]
    fn test_iou_overlap() {
        let a = [0.0, 0.0, 100.0, 100.0];
        let b = [50.0, 50.0, 150.0, 150.0];
        let score = calculate_iou(&a, &b);
        assert!((score - 2500.0 / 17500.0).abs() < 0.01);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = [0.0, 0.0, 50.0, 50.0];
        let b = [100.0, 100.0, 200.0, 200.0];
        assert_eq!(calculate_iou(&a, &b), 0.0);
    }

    #[test]
    fn test_nms_suppresses_overlapping_boxes() {
        let dets = vec![
            det(0.0, 0.0, 100.0, 100.0, 0.9),
            det(5.0, 5.0, 105.0, 105.0, 0.7),
            det(300.0, 300.0, 400.0, 400.0, 0.8),
        ];
        let kept = nms(dets, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.8);
    }

    #[test]
    fn test_resize_preserves_solid_color() {
        let src = vec![200u8; 8 * 8 * 3];
        let dst = resize_bilinear(&src, 8, 8, 4, 4);
        assert_eq!(dst.len(), 4 * 4 * 3);
        assert!(dst.iter().all(|&v| v == 200));
    }
}
