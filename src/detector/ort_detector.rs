use super::{load_yolov8_labels, ColorLabel, Detector, DetectorError};
use crate::{
    config::{DetectorConfig, Validatable},
    cv_utils::CvImage,
    detection::{Detection, LabelColor},
};
use ndarray::{Array, ArrayView2, Axis, Ix3, Ix4};
use opencv::{
    core::{Mat, Size},
    imgproc,
    prelude::*,
};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

const MODEL_INPUT_SIZE: usize = 640;

#[derive(Debug, Clone, Copy, PartialEq)]
struct RawBox {
    class_id: usize,
    confidence: f32,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

fn intersection(box1: &RawBox, box2: &RawBox) -> f32 {
    let width = (box1.x2.min(box2.x2) - box1.x1.max(box2.x1)).max(0.);
    let height = (box1.y2.min(box2.y2) - box1.y1.max(box2.y1)).max(0.);
    width * height
}

fn union(box1: &RawBox, box2: &RawBox) -> f32 {
    ((box1.x2 - box1.x1) * (box1.y2 - box1.y1)) + ((box2.x2 - box2.x1) * (box2.y2 - box2.y1))
        - intersection(box1, box2)
}

fn iou(box1: &RawBox, box2: &RawBox) -> f32 {
    let union = union(box1, box2);
    if union <= 0. {
        return 0.;
    }
    intersection(box1, box2) / union
}

/// Resizes to the model input and lays the BGR bytes out as normalized RGB planes.
fn frame_to_tensor(frame: &CvImage) -> Result<Array<f32, Ix4>, DetectorError> {
    let side = MODEL_INPUT_SIZE as i32;
    let mut resized = Mat::default();
    imgproc::resize(
        &frame.mat,
        &mut resized,
        Size::new(side, side),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )
    .map_err(|e| DetectorError::Preprocess(e.to_string()))?;

    let bytes = resized
        .data_bytes()
        .map_err(|e| DetectorError::Preprocess(e.to_string()))?;
    if bytes.len() != MODEL_INPUT_SIZE * MODEL_INPUT_SIZE * 3 {
        return Err(DetectorError::Preprocess(format!(
            "expected a 3 channel 8-bit frame, got {} bytes",
            bytes.len()
        )));
    }

    let mut input = Array::zeros((1, 3, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE));
    for (index, pixel) in bytes.chunks_exact(3).enumerate() {
        let y = index / MODEL_INPUT_SIZE;
        let x = index % MODEL_INPUT_SIZE;
        input[[0, 0, y, x]] = (pixel[2] as f32) / 255.;
        input[[0, 1, y, x]] = (pixel[1] as f32) / 255.;
        input[[0, 2, y, x]] = (pixel[0] as f32) / 255.;
    }

    Ok(input)
}

/// `output` is one row per anchor: `[xc, yc, w, h, class scores...]` in model pixels.
fn extract_boxes(
    output: ArrayView2<f32>,
    frame_width: f32,
    frame_height: f32,
    min_probability: f32,
) -> Vec<RawBox> {
    let scale_x = frame_width / MODEL_INPUT_SIZE as f32;
    let scale_y = frame_height / MODEL_INPUT_SIZE as f32;
    let mut boxes = Vec::new();

    for row in output.axis_iter(Axis(0)) {
        let best = row
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum });
        let Some((class_id, prob)) = best else {
            continue;
        };

        if prob < min_probability {
            continue;
        }

        let xc = row[0] * scale_x;
        let yc = row[1] * scale_y;
        let w = row[2] * scale_x;
        let h = row[3] * scale_y;

        boxes.push(RawBox {
            class_id,
            confidence: prob,
            x1: xc - w / 2.,
            y1: yc - h / 2.,
            x2: xc + w / 2.,
            y2: yc + h / 2.,
        });
    }

    boxes
}

fn non_max_suppression(mut boxes: Vec<RawBox>, iou_threshold: f32) -> Vec<RawBox> {
    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));
    let mut result = Vec::new();

    while !boxes.is_empty() {
        let best = boxes.remove(0);
        boxes.retain(|candidate| iou(&best, candidate) < iou_threshold);
        result.push(best);
    }

    result
}

pub struct OrtDetector {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
    labels: Vec<ColorLabel>,
    min_probability: f32,
    iou_threshold: f32,
}

impl OrtDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self, DetectorError> {
        config.model.validate().map_err(DetectorError::ModelLoad)?;
        config.labels.validate().map_err(DetectorError::Labels)?;

        let labels = load_yolov8_labels(&config.labels.get_path())
            .map_err(|e| DetectorError::Labels(e.to_string()))?;

        let num_instances = config.model.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()
                    .map_err(|e| DetectorError::ModelLoad(e.to_string()))?
                    .with_optimization_level(GraphOptimizationLevel::Level3)
                    .map_err(|e| DetectorError::ModelLoad(e.to_string()))?
                    .commit_from_file(config.model.get_path())
                    .map_err(|e| DetectorError::ModelLoad(e.to_string()))?;
                Ok(Mutex::new(session))
            })
            .collect::<Result<Vec<_>, DetectorError>>()?;

        tracing::info!(
            "Created {} ONNX sessions for {:?} with {} labels",
            num_instances,
            config.model.get_path(),
            labels.len()
        );

        Ok(Self {
            sessions,
            counter: AtomicUsize::new(0),
            labels,
            min_probability: config.model.min_probability,
            iou_threshold: config.model.iou_threshold,
        })
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ndarray::ArrayD<f32>, DetectorError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| DetectorError::Inference(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Running inference with session {}", index);
        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| DetectorError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::Inference(format!("failed to extract tensor: {}", e)))?;

        ndarray::ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| DetectorError::Inference(format!("invalid tensor shape: {}", e)))
    }

    fn label_box(&self, bbox: RawBox) -> Detection {
        let (class_label, color) = match self.labels.get(bbox.class_id) {
            Some(color_label) => (color_label.label.clone(), color_label.color),
            None => (format!("Unknown class {}", bbox.class_id), LabelColor::BLACK),
        };

        Detection {
            x1: bbox.x1.round() as i32,
            y1: bbox.y1.round() as i32,
            x2: bbox.x2.round() as i32,
            y2: bbox.y2.round() as i32,
            class_id: bbox.class_id,
            class_label,
            confidence: bbox.confidence,
            color,
        }
    }
}

impl Detector for OrtDetector {
    fn detect(&self, frame: &CvImage) -> Result<Vec<Detection>, DetectorError> {
        let input = frame_to_tensor(frame)?;
        let outputs = self.run_inference(&input)?;

        // [1, 4 + classes, anchors] -> [anchors, 4 + classes]
        let outputs = outputs
            .into_dimensionality::<Ix3>()
            .map_err(|e| DetectorError::Inference(format!("unexpected output rank: {}", e)))?;
        let rows = outputs.index_axis(Axis(0), 0);

        let boxes = extract_boxes(
            rows.t(),
            frame.width() as f32,
            frame.height() as f32,
            self.min_probability,
        );
        let detections: Vec<Detection> = non_max_suppression(boxes, self.iou_threshold)
            .into_iter()
            .map(|bbox| self.label_box(bbox))
            .collect();

        tracing::debug!("Detected {} objects", detections.len());
        Ok(detections)
    }
}
