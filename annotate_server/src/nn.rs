use std::path::Path;

use anyhow::{bail, Result};
use image::RgbImage;
use itertools::Itertools;
use ndarray::{s, ArrayView2, Axis, Ix3};
use tract_onnx::prelude::*;

use crate::labels::{class_name, COCO_CLASSES};

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Side length of the square network input.
pub const INPUT_SIZE: u32 = 640;

/// One labeled bounding box in frame pixel coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`
    pub bbox: [f32; 4],
    pub class_id: usize,
    pub label: &'static str,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: [f32; 4], class_id: usize, confidence: f32) -> Self {
        Self {
            bbox,
            class_id,
            label: class_name(class_id),
            confidence,
        }
    }
}

/// All detections found on one frame.
///
/// Rendering lives in [`crate::render`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }
}

/// Object detector applied to every sampled frame.
///
/// Always returns a sequence of results, usually of length one. Implementations are shared
/// between concurrent runs and must not keep per-frame state.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<DetectionResult>>;
}

/// YOLOv5u network exported to ONNX, run with `tract`.
pub struct YoloModel {
    model: NnModel,
    max_iou: f32,
    min_confidence: f32,
}

impl YoloModel {
    pub fn load(path: impl AsRef<Path>, min_confidence: f32, max_iou: f32) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading detector from {}", path.display());

        let input_fact = InferenceFact::dt_shape(
            f32::datum_type(),
            tvec!(1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize),
        );
        let model = tract_onnx::onnx()
            .model_for_path(path)?
            .with_input_fact(0, input_fact)?
            .into_optimized()?
            .into_runnable()?;

        Ok(Self {
            model,
            max_iou,
            min_confidence,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let resized: RgbImage = image::imageops::resize(
            input,
            INPUT_SIZE,
            INPUT_SIZE,
            image::imageops::FilterType::Triangle,
        );

        let tensor: Tensor = tract_ndarray::Array4::from_shape_fn(
            (1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize),
            |(_, c, y, x)| resized[(x as _, y as _)][c] as f32 / 255.0,
        )
        .into();

        tensor
    }

    fn postproc(&self, raw: &Tensor, width: u32, height: u32) -> Result<Vec<Detection>> {
        // Output is [1, 4 + classes, candidates], boxes as center/size in input pixels
        let output = raw.to_array_view::<f32>()?.into_dimensionality::<Ix3>()?;
        let predictions = output.slice(s![0, .., ..]);
        if predictions.nrows() != 4 + COCO_CLASSES.len() {
            bail!(
                "unexpected detector output shape {:?}, expected [1, {}, N]",
                output.shape(),
                4 + COCO_CLASSES.len()
            );
        }

        let scale = (
            width as f32 / INPUT_SIZE as f32,
            height as f32 / INPUT_SIZE as f32,
        );
        let candidates = decode_predictions(predictions, scale, self.min_confidence);
        let selected = non_maximum_suppression(candidates, self.max_iou);
        log::debug!("Selected {} detections", selected.len());

        Ok(selected)
    }

    /// Run the network on one frame and return the surviving boxes.
    pub fn run(&self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let (width, height) = frame.dimensions();
        let outputs = self.model.run(tvec!(self.preproc(frame).into()))?;
        self.postproc(&outputs[0], width, height)
    }
}

impl Detector for YoloModel {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<DetectionResult>> {
        Ok(vec![DetectionResult::new(self.run(frame)?)])
    }
}

/// Turn raw `[4 + classes, candidates]` predictions into detections.
///
/// Each candidate column holds `x_center, y_center, width, height` followed by one score per
/// class. The best scoring class is kept if it reaches `min_confidence`. Boxes are scaled by
/// `scale = (x, y)` into frame pixels.
fn decode_predictions(
    predictions: ArrayView2<f32>,
    scale: (f32, f32),
    min_confidence: f32,
) -> Vec<Detection> {
    predictions
        .axis_iter(Axis(1))
        .filter_map(|candidate| {
            let (class_id, confidence) = candidate
                .iter()
                .skip(4)
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))?;
            if confidence < min_confidence {
                return None;
            }

            let (xc, yc) = (candidate[0] * scale.0, candidate[1] * scale.1);
            let (w, h) = (candidate[2] * scale.0, candidate[3] * scale.1);
            let bbox = [xc - w / 2.0, yc - h / 2.0, xc + w / 2.0, yc + h / 2.0];

            Some(Detection::new(bbox, class_id, confidence))
        })
        .collect()
}

/// Run non-maximum-suppression on candidate detections.
///
/// Start with the most confident box and iterate over all other boxes in the order of sinking
/// confidence. A candidate is kept only if it does not overlap an already selected box of the
/// same class by more than `max_iou`.
fn non_maximum_suppression(candidates: Vec<Detection>, max_iou: f32) -> Vec<Detection> {
    let mut ascending: Vec<Detection> = candidates
        .into_iter()
        .sorted_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .collect();

    let mut selected: Vec<Detection> = vec![];
    'candidates: while let Some(candidate) = ascending.pop() {
        for chosen in selected.iter() {
            if chosen.class_id == candidate.class_id && iou(&candidate.bbox, &chosen.bbox) > max_iou
            {
                continue 'candidates;
            }
        }

        selected.push(candidate);
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // If the boxes do not overlap, the corner points of the overlap box are ill defined and its
    // area is zero.
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// The bounding box is passed as four-element array defining two points:
/// `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`
/// If the bottom-right point lies above or to the left of the top-left point, the area is zero.
fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::Array2;

    fn candidates(columns: &[([f32; 4], usize, f32)]) -> Array2<f32> {
        let mut predictions = Array2::<f32>::zeros((4 + COCO_CLASSES.len(), columns.len()));
        for (i, (bbox, class_id, score)) in columns.iter().enumerate() {
            for (row, value) in bbox.iter().enumerate() {
                predictions[[row, i]] = *value;
            }
            predictions[[4 + class_id, i]] = *score;
        }
        predictions
    }

    #[test]
    fn test_iou() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-5);

        let b = [5.0, 0.0, 15.0, 10.0];
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-5);

        let far = [20.0, 20.0, 30.0, 30.0];
        assert_eq!(iou(&a, &far), 0.0);
    }

    #[test]
    fn test_bbox_area_of_inverted_box_is_zero() {
        assert_eq!(bbox_area(&[10.0, 10.0, 5.0, 20.0]), 0.0);
        assert_eq!(bbox_area(&[0.0, 0.0, 4.0, 2.5]), 10.0);
    }

    #[test]
    fn test_decode_predictions() {
        let predictions = candidates(&[
            ([320.0, 320.0, 64.0, 32.0], 0, 0.9),
            ([100.0, 100.0, 10.0, 10.0], 32, 0.1),
        ]);

        let detections = decode_predictions(predictions.view(), (2.0, 0.5), 0.25);

        assert_eq!(detections.len(), 1);
        let person = &detections[0];
        assert_eq!(person.label, "person");
        assert_eq!(person.class_id, 0);
        assert_eq!(person.bbox, [576.0, 152.0, 704.0, 168.0]);
        assert!((person.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_most_confident_of_overlapping_boxes() {
        let selected = non_maximum_suppression(
            vec![
                Detection::new([0.0, 0.0, 10.0, 10.0], 0, 0.6),
                Detection::new([1.0, 1.0, 10.0, 10.0], 0, 0.9),
                Detection::new([50.0, 50.0, 60.0, 60.0], 0, 0.5),
            ],
            0.7,
        );

        assert_eq!(selected.len(), 2);
        assert!((selected[0].confidence - 0.9).abs() < 1e-6);
        assert!((selected[1].confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_nms_is_per_class() {
        let selected = non_maximum_suppression(
            vec![
                Detection::new([0.0, 0.0, 10.0, 10.0], 0, 0.8),
                Detection::new([0.0, 0.0, 10.0, 10.0], 32, 0.7),
            ],
            0.7,
        );

        assert_eq!(selected.len(), 2);
        assert_eq!(selected[1].label, "sports ball");
    }
}
