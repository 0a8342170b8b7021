mod labels;
mod ort_detector;

pub use labels::{load_yolov8_labels, ColorLabel};
pub use ort_detector::OrtDetector;

use crate::cv_utils::CvImage;
use crate::detection::Detection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    #[error("Failed to load labels: {0}")]
    Labels(String),
    #[error("Failed to prepare frame: {0}")]
    Preprocess(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Anything that turns a frame into boxes. Calls are synchronous and may block.
pub trait Detector: Send + Sync + 'static {
    fn detect(&self, frame: &CvImage) -> Result<Vec<Detection>, DetectorError>;
}
