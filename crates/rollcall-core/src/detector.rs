//! MTCNN face detector via ONNX Runtime.
//!
//! Three-stage cascade: PNet proposes candidate windows over an image
//! pyramid, RNet refines them, ONet produces the final boxes. Each stage
//! applies its own confidence threshold and NMS pass, and feeds the bounding
//! box regression offsets back into the candidate boxes.

use crate::types::FaceBox;
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const MTCNN_MIN_FACE_SIZE: f32 = 20.0;
/// Per-stage face probability thresholds: [PNet, RNet, ONet].
const MTCNN_STAGE_THRESHOLDS: [f32; 3] = [0.6, 0.7, 0.7];
const MTCNN_NMS_THRESHOLD: f32 = 0.709;
const MTCNN_SCALE_FACTOR: f32 = 0.709;
const MTCNN_MEAN: f32 = 127.5;
const MTCNN_STD: f32 = 128.0;
/// PNet is fully convolutional: receptive field 12, output stride 2.
const PNET_CELL_SIZE: f32 = 12.0;
const PNET_STRIDE: f32 = 2.0;
const RNET_INPUT_SIZE: u32 = 24;
const ONET_INPUT_SIZE: u32 = 48;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — place the MTCNN ONNX exports in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// One candidate window flowing through the cascade.
#[derive(Debug, Clone)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    /// Regression offsets [dx1, dy1, dx2, dy2], relative to box size.
    reg: [f32; 4],
}

/// MTCNN-based face detector.
pub struct FaceDetector {
    pnet: Session,
    rnet: Session,
    onet: Session,
}

impl FaceDetector {
    /// Load the three MTCNN stage models from the given paths.
    pub fn load(pnet_path: &str, rnet_path: &str, onet_path: &str) -> Result<Self, DetectorError> {
        // PNet and RNet emit (probability, regression); ONet adds landmarks.
        let pnet = load_session(pnet_path, 2)?;
        let rnet = load_session(rnet_path, 2)?;
        let onet = load_session(onet_path, 3)?;
        tracing::info!(pnet = pnet_path, rnet = rnet_path, onet = onet_path, "loaded MTCNN cascade");
        Ok(Self { pnet, rnet, onet })
    }

    /// Detect faces in an RGB frame, returning boxes sorted by confidence.
    ///
    /// An empty result means no face cleared the cascade — the caller decides
    /// how to report that.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceBox>, DetectorError> {
        let proposals = self.stage_pnet(frame)?;
        if proposals.is_empty() {
            return Ok(Vec::new());
        }

        let refined = self.stage_refine(
            frame,
            proposals,
            RNET_INPUT_SIZE,
            MTCNN_STAGE_THRESHOLDS[1],
            Stage::RNet,
        )?;
        if refined.is_empty() {
            return Ok(Vec::new());
        }

        let output = self.stage_refine(
            frame,
            refined,
            ONET_INPUT_SIZE,
            MTCNN_STAGE_THRESHOLDS[2],
            Stage::ONet,
        )?;

        let mut boxes: Vec<FaceBox> = output
            .into_iter()
            .map(|c| FaceBox {
                x1: c.x1,
                y1: c.y1,
                x2: c.x2,
                y2: c.y2,
                confidence: c.score,
            })
            .collect();
        boxes.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        tracing::debug!(count = boxes.len(), "MTCNN cascade finished");
        Ok(boxes)
    }

    /// Stage 1: run PNet over an image pyramid and collect proposals.
    fn stage_pnet(&mut self, frame: &RgbImage) -> Result<Vec<Candidate>, DetectorError> {
        let (width, height) = frame.dimensions();
        let mut candidates = Vec::new();

        for scale in pyramid_scales(width, height) {
            let scaled_w = ((width as f32 * scale).ceil() as u32).max(1);
            let scaled_h = ((height as f32 * scale).ceil() as u32).max(1);
            if scaled_w < PNET_CELL_SIZE as u32 || scaled_h < PNET_CELL_SIZE as u32 {
                continue;
            }

            let resized = imageops::resize(frame, scaled_w, scaled_h, imageops::FilterType::Triangle);
            let input = rgb_to_tensor(&resized);

            let outputs = self
                .pnet
                .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

            let grid_w = ((scaled_w as f32 - PNET_CELL_SIZE) / PNET_STRIDE) as usize + 1;
            let grid_h = ((scaled_h as f32 - PNET_CELL_SIZE) / PNET_STRIDE) as usize + 1;

            // PNet outputs a 2-channel probability map and a 4-channel
            // regression map; tell them apart by element count.
            let cells = grid_w * grid_h;
            let mut prob: Option<Vec<f32>> = None;
            let mut reg: Option<Vec<f32>> = None;
            for i in 0..2 {
                let (_, data) = outputs[i].try_extract_tensor::<f32>().map_err(|e| {
                    DetectorError::InferenceFailed(format!("PNet output {i}: {e}"))
                })?;
                if data.len() == 2 * cells {
                    prob = Some(data.to_vec());
                } else if data.len() == 4 * cells {
                    reg = Some(data.to_vec());
                }
            }
            let (prob, reg) = match (prob, reg) {
                (Some(p), Some(r)) => (p, r),
                _ => {
                    return Err(DetectorError::InferenceFailed(format!(
                        "PNet outputs do not match a {grid_w}x{grid_h} grid"
                    )))
                }
            };

            let mut scale_candidates = generate_proposals(
                &prob,
                &reg,
                grid_w,
                grid_h,
                scale,
                MTCNN_STAGE_THRESHOLDS[0],
            );
            scale_candidates = nms(scale_candidates, MTCNN_NMS_THRESHOLD);
            candidates.extend(scale_candidates);
        }

        let mut merged = nms(candidates, MTCNN_NMS_THRESHOLD);
        for c in &mut merged {
            apply_regression(c);
        }
        let mut squared: Vec<Candidate> = merged.into_iter().map(square_box).collect();
        squared.retain(|c| c.x2 > c.x1 && c.y2 > c.y1);
        Ok(squared)
    }

    /// Stages 2 and 3: crop each candidate, rerun through RNet/ONet, rescore.
    fn stage_refine(
        &mut self,
        frame: &RgbImage,
        candidates: Vec<Candidate>,
        input_size: u32,
        threshold: f32,
        stage: Stage,
    ) -> Result<Vec<Candidate>, DetectorError> {
        let mut kept = Vec::new();

        for c in candidates {
            let crop = crop_with_padding(frame, &c, input_size);
            let input = rgb_to_tensor(&crop);

            let session = match stage {
                Stage::RNet => &mut self.rnet,
                Stage::ONet => &mut self.onet,
            };
            let outputs =
                session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

            // Per-crop batch of one: probability is 2 elements, regression 4.
            // ONet additionally emits 10 landmark coordinates, which this
            // pipeline does not use.
            let num_outputs = match stage {
                Stage::RNet => 2,
                Stage::ONet => 3,
            };
            let mut score: Option<f32> = None;
            let mut reg: Option<[f32; 4]> = None;
            for i in 0..num_outputs {
                let (_, data) = outputs[i].try_extract_tensor::<f32>().map_err(|e| {
                    DetectorError::InferenceFailed(format!("{stage:?} output {i}: {e}"))
                })?;
                match data.len() {
                    2 => score = Some(data[1]),
                    4 => reg = Some([data[0], data[1], data[2], data[3]]),
                    _ => {}
                }
            }
            let (score, reg) = match (score, reg) {
                (Some(s), Some(r)) => (s, r),
                _ => {
                    return Err(DetectorError::InferenceFailed(format!(
                        "{stage:?} outputs missing probability or regression tensor"
                    )))
                }
            };

            if score >= threshold {
                kept.push(Candidate { score, reg, ..c });
            }
        }

        let mut refined = nms(kept, MTCNN_NMS_THRESHOLD);
        for c in &mut refined {
            apply_regression(c);
        }
        if matches!(stage, Stage::RNet) {
            refined = refined.into_iter().map(square_box).collect();
        }
        refined.retain(|c| c.x2 > c.x1 && c.y2 > c.y1);
        Ok(refined)
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    RNet,
    ONet,
}

fn load_session(path: &str, expected_outputs: usize) -> Result<Session, DetectorError> {
    if !Path::new(path).exists() {
        return Err(DetectorError::ModelNotFound(path.to_string()));
    }
    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;

    let num_outputs = session.outputs().len();
    if num_outputs != expected_outputs {
        return Err(DetectorError::InferenceFailed(format!(
            "{path}: expected {expected_outputs} output tensors, model has {num_outputs}"
        )));
    }
    Ok(session)
}

/// Compute the image pyramid scales for the PNet stage.
///
/// Starts at cell_size / min_face_size and shrinks by the scale factor until
/// the scaled shorter side drops below one PNet cell.
fn pyramid_scales(width: u32, height: u32) -> Vec<f32> {
    let min_dim = width.min(height) as f32;
    let mut scale = PNET_CELL_SIZE / MTCNN_MIN_FACE_SIZE;
    let mut scales = Vec::new();
    while min_dim * scale >= PNET_CELL_SIZE {
        scales.push(scale);
        scale *= MTCNN_SCALE_FACTOR;
    }
    scales
}

/// Convert an RGB image to a normalized NCHW float tensor.
fn rgb_to_tensor(img: &RgbImage) -> Array4<f32> {
    let (w, h) = img.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in img.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - MTCNN_MEAN) / MTCNN_STD;
        }
    }
    tensor
}

/// Turn the PNet probability/regression maps for one pyramid level into
/// candidate boxes in original-frame coordinates.
fn generate_proposals(
    prob: &[f32],
    reg: &[f32],
    grid_w: usize,
    grid_h: usize,
    scale: f32,
    threshold: f32,
) -> Vec<Candidate> {
    let cells = grid_w * grid_h;
    let mut candidates = Vec::new();

    for gy in 0..grid_h {
        for gx in 0..grid_w {
            let cell = gy * grid_w + gx;
            // Channel-major layout: face probability is channel 1.
            let score = prob[cells + cell];
            if score < threshold {
                continue;
            }

            let x1 = (PNET_STRIDE * gx as f32 + 1.0) / scale;
            let y1 = (PNET_STRIDE * gy as f32 + 1.0) / scale;
            let x2 = (PNET_STRIDE * gx as f32 + PNET_CELL_SIZE) / scale;
            let y2 = (PNET_STRIDE * gy as f32 + PNET_CELL_SIZE) / scale;

            candidates.push(Candidate {
                x1,
                y1,
                x2,
                y2,
                score,
                reg: [
                    reg[cell],
                    reg[cells + cell],
                    reg[2 * cells + cell],
                    reg[3 * cells + cell],
                ],
            });
        }
    }

    candidates
}

/// Shift a candidate by its regression offsets (scaled by box size).
fn apply_regression(c: &mut Candidate) {
    let w = c.x2 - c.x1;
    let h = c.y2 - c.y1;
    c.x1 += c.reg[0] * w;
    c.y1 += c.reg[1] * h;
    c.x2 += c.reg[2] * w;
    c.y2 += c.reg[3] * h;
    c.reg = [0.0; 4];
}

/// Expand a candidate to a square around its center; RNet and ONet expect
/// square crops.
fn square_box(c: Candidate) -> Candidate {
    let w = c.x2 - c.x1;
    let h = c.y2 - c.y1;
    let side = w.max(h);
    let cx = c.x1 + w / 2.0;
    let cy = c.y1 + h / 2.0;
    Candidate {
        x1: cx - side / 2.0,
        y1: cy - side / 2.0,
        x2: cx + side / 2.0,
        y2: cy + side / 2.0,
        ..c
    }
}

/// Crop a candidate region from the frame, zero-padding any part that falls
/// outside the frame, and resize to the stage input size.
fn crop_with_padding(frame: &RgbImage, c: &Candidate, size: u32) -> RgbImage {
    let (fw, fh) = frame.dimensions();
    let x1 = c.x1.round() as i64;
    let y1 = c.y1.round() as i64;
    let w = ((c.x2 - c.x1).round() as i64).max(1);
    let h = ((c.y2 - c.y1).round() as i64).max(1);

    let mut crop = RgbImage::new(w as u32, h as u32);
    for dy in 0..h {
        for dx in 0..w {
            let sx = x1 + dx;
            let sy = y1 + dy;
            if sx >= 0 && sy >= 0 && (sx as u32) < fw && (sy as u32) < fh {
                crop.put_pixel(dx as u32, dy as u32, *frame.get_pixel(sx as u32, sy as u32));
            }
        }
    }

    imageops::resize(&crop, size, size, imageops::FilterType::Triangle)
}

/// Non-Maximum Suppression: drop candidates overlapping a higher-scored one.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; candidates.len()];

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(candidates[i].clone());

        for j in (i + 1)..candidates.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&candidates[i], &candidates[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Intersection-over-Union of two candidate boxes.
fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter_w = (x2 - x1).max(0.0);
    let inter_h = (y2 - y1).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union_area = area_a + area_b - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_candidate(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Candidate {
        Candidate {
            x1,
            y1,
            x2,
            y2,
            score,
            reg: [0.0; 4],
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_candidate(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = make_candidate(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_candidate(20.0, 20.0, 30.0, 30.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_candidate(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_candidate(5.0, 0.0, 15.0, 10.0, 1.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        let expected = 50.0 / 150.0;
        assert!((iou(&a, &b) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let candidates = vec![
            make_candidate(0.0, 0.0, 100.0, 100.0, 0.9),
            make_candidate(5.0, 5.0, 105.0, 105.0, 0.8),
            make_candidate(200.0, 200.0, 250.0, 250.0, 0.7),
        ];
        let result = nms(candidates, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].score - 0.9).abs() < 1e-6);
        assert!((result[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], MTCNN_NMS_THRESHOLD).is_empty());
    }

    #[test]
    fn test_pyramid_scales_shrink_by_factor() {
        let scales = pyramid_scales(640, 480);
        assert!(!scales.is_empty());
        assert!((scales[0] - PNET_CELL_SIZE / MTCNN_MIN_FACE_SIZE).abs() < 1e-6);
        for pair in scales.windows(2) {
            assert!((pair[1] / pair[0] - MTCNN_SCALE_FACTOR).abs() < 1e-5);
        }
        // Last scale still fits a PNet cell on the shorter side
        assert!(480.0 * scales[scales.len() - 1] >= PNET_CELL_SIZE);
    }

    #[test]
    fn test_pyramid_scales_tiny_frame() {
        // Shorter side below the minimum face size produces no usable scale
        assert!(pyramid_scales(10, 10).is_empty());
    }

    #[test]
    fn test_generate_proposals_threshold() {
        let grid_w = 2;
        let grid_h = 2;
        let cells = grid_w * grid_h;
        // Channel 0 = non-face, channel 1 = face
        let mut prob = vec![0.0f32; 2 * cells];
        prob[cells] = 0.95; // cell (0,0) above threshold
        prob[cells + 3] = 0.3; // cell (1,1) below threshold
        let reg = vec![0.0f32; 4 * cells];

        let proposals = generate_proposals(&prob, &reg, grid_w, grid_h, 0.5, 0.6);
        assert_eq!(proposals.len(), 1);
        assert!((proposals[0].score - 0.95).abs() < 1e-6);
        // Cell (0,0) at scale 0.5 maps back to a 1/0.5 = 2x larger window
        assert!((proposals[0].x1 - 2.0).abs() < 1e-4);
        assert!((proposals[0].x2 - PNET_CELL_SIZE / 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_apply_regression_shifts_box() {
        let mut c = make_candidate(0.0, 0.0, 100.0, 100.0, 0.9);
        c.reg = [0.1, 0.1, -0.1, -0.1];
        apply_regression(&mut c);
        assert!((c.x1 - 10.0).abs() < 1e-4);
        assert!((c.y1 - 10.0).abs() < 1e-4);
        assert!((c.x2 - 90.0).abs() < 1e-4);
        assert!((c.y2 - 90.0).abs() < 1e-4);
        assert_eq!(c.reg, [0.0; 4]);
    }

    #[test]
    fn test_square_box_preserves_center() {
        let c = make_candidate(0.0, 0.0, 40.0, 100.0, 0.9);
        let sq = square_box(c);
        assert!((sq.x2 - sq.x1 - 100.0).abs() < 1e-4);
        assert!((sq.y2 - sq.y1 - 100.0).abs() < 1e-4);
        // Center unchanged
        assert!(((sq.x1 + sq.x2) / 2.0 - 20.0).abs() < 1e-4);
        assert!(((sq.y1 + sq.y2) / 2.0 - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_crop_with_padding_out_of_bounds() {
        let mut frame = RgbImage::from_pixel(10, 10, image::Rgb([255, 255, 255]));
        frame.put_pixel(0, 0, image::Rgb([100, 0, 0]));
        // Box half outside the frame on the top-left
        let c = make_candidate(-5.0, -5.0, 5.0, 5.0, 0.9);
        let crop = crop_with_padding(&frame, &c, 10);
        assert_eq!(crop.dimensions(), (10, 10));
        // Top-left of the crop is padding (black)
        assert_eq!(crop.get_pixel(0, 0).0, [0, 0, 0]);
        // Bottom-right falls inside the frame (white)
        assert_eq!(crop.get_pixel(9, 9).0, [255, 255, 255]);
    }

    #[test]
    fn test_rgb_to_tensor_normalization() {
        let img = RgbImage::from_pixel(2, 2, image::Rgb([128, 0, 255]));
        let tensor = rgb_to_tensor(&img);
        assert_eq!(tensor.shape(), &[1, 3, 2, 2]);
        assert!((tensor[[0, 0, 0, 0]] - (128.0 - MTCNN_MEAN) / MTCNN_STD).abs() < 1e-6);
        assert!((tensor[[0, 1, 0, 0]] - (0.0 - MTCNN_MEAN) / MTCNN_STD).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 0]] - (255.0 - MTCNN_MEAN) / MTCNN_STD).abs() < 1e-6);
    }
}
