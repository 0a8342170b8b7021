use crate::config::CameraConfig;
use crate::cv_utils::CvImage;
use opencv::{core::Mat, prelude::*, videoio};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Failed to open camera {0}: {1}")]
    OpenCameraFailed(i32, opencv::Error),
    #[error("Camera {0} is not available")]
    CameraUnavailable(i32),
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(opencv::Error),
}

/// Produces frames until the device gives up. `Ok(None)` is the end of the stream.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<CvImage>, CameraError>;
}

/// Opens a fresh source for every stream session.
pub type SourceOpener = Arc<dyn Fn() -> Result<Box<dyn FrameSource>, CameraError> + Send + Sync>;

#[derive(Debug)]
pub struct Camera {
    device_index: i32,
    capture: videoio::VideoCapture,
}

impl Camera {
    pub fn open(config: &CameraConfig) -> Result<Self, CameraError> {
        let capture = videoio::VideoCapture::new(config.device_index, videoio::CAP_ANY)
            .map_err(|e| CameraError::OpenCameraFailed(config.device_index, e))?;

        let opened = capture
            .is_opened()
            .map_err(|e| CameraError::OpenCameraFailed(config.device_index, e))?;
        if !opened {
            return Err(CameraError::CameraUnavailable(config.device_index));
        }

        tracing::info!("Opened camera {}", config.device_index);
        Ok(Self {
            device_index: config.device_index,
            capture,
        })
    }

    pub fn opener(config: CameraConfig) -> SourceOpener {
        Arc::new(move || Ok(Box::new(Camera::open(&config)?) as Box<dyn FrameSource>))
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Option<CvImage>, CameraError> {
        let mut frame = Mat::default();
        let grabbed = self
            .capture
            .read(&mut frame)
            .map_err(CameraError::ReadFrameFailed)?;
        if !grabbed || frame.empty() {
            return Ok(None);
        }
        Ok(Some(CvImage::new(frame)))
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if let Err(e) = self.capture.release() {
            tracing::warn!("Failed to release camera {}: {:?}", self.device_index, e);
        } else {
            tracing::info!("Released camera {}", self.device_index);
        }
    }
}
