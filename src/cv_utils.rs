use crate::detection::Detection;
use opencv::{
    core::{Mat, Point, Rect, Scalar, Size, Vector},
    imgcodecs, imgproc,
    prelude::*,
};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CvUtilsError {
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(opencv::Error),
    #[error("Failed to resize frame: {0}")]
    ResizeFrameFailed(opencv::Error),
    #[error("OpenCV error: {0}")]
    OpenCvError(opencv::Error),
}

impl From<opencv::Error> for CvUtilsError {
    fn from(err: opencv::Error) -> Self {
        CvUtilsError::OpenCvError(err)
    }
}

const FPS_ORIGIN: (i32, i32) = (10, 30);
const CAPTION_OFFSET: i32 = 10;

/// A BGR frame as produced by the camera.
pub struct CvImage {
    pub mat: Mat,
}

impl CvImage {
    pub fn new(mat: Mat) -> Self {
        Self { mat }
    }

    pub fn width(&self) -> i32 {
        self.mat.cols()
    }

    pub fn height(&self) -> i32 {
        self.mat.rows()
    }

    pub fn resize(&mut self, width: i32, height: i32) -> Result<&mut Self, CvUtilsError> {
        if self.width() == width && self.height() == height {
            return Ok(self);
        }
        let mut resized = Mat::default();
        imgproc::resize(
            &self.mat,
            &mut resized,
            Size::new(width, height),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )
        .map_err(CvUtilsError::ResizeFrameFailed)?;
        self.mat = resized;
        Ok(self)
    }

    pub fn to_jpg(&self) -> Result<Vec<u8>, CvUtilsError> {
        let mut buf = Vector::<u8>::new();
        imgcodecs::imencode(".jpg", &self.mat, &mut buf, &Vector::new())
            .map_err(CvUtilsError::EncodeFrameFailed)?;
        Ok(buf.into())
    }

    pub fn annotate(&mut self, detections: &[Detection]) -> Result<&mut Self, CvUtilsError> {
        for detection in detections {
            let color = Scalar::new(
                detection.color.blue as f64,
                detection.color.green as f64,
                detection.color.red as f64,
                0.0,
            );

            imgproc::rectangle(
                &mut self.mat,
                Rect::new(
                    detection.x1,
                    detection.y1,
                    detection.x2 - detection.x1,
                    detection.y2 - detection.y1,
                ),
                color,
                2,
                imgproc::LINE_8,
                0,
            )?;

            imgproc::put_text(
                &mut self.mat,
                &detection.caption(),
                Point::new(detection.x1, detection.y1 - CAPTION_OFFSET),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.5,
                color,
                2,
                imgproc::LINE_AA,
                false,
            )?;
        }
        Ok(self)
    }

    pub fn draw_fps(&mut self, fps: f64) -> Result<&mut Self, CvUtilsError> {
        imgproc::put_text(
            &mut self.mat,
            &format!("FPS: {:.2}", fps),
            Point::new(FPS_ORIGIN.0, FPS_ORIGIN.1),
            imgproc::FONT_HERSHEY_SIMPLEX,
            1.0,
            Scalar::new(0.0, 255.0, 255.0, 0.0),
            2,
            imgproc::LINE_AA,
            false,
        )?;
        Ok(self)
    }
}

/// Instantaneous frame rate from the gap between consecutive ticks.
#[derive(Debug, Default)]
pub struct FpsCounter {
    previous: Option<Instant>,
}

impl FpsCounter {
    const MIN_ELAPSED_SECS: f64 = 0.001;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self) -> f64 {
        self.tick_at(Instant::now())
    }

    /// The first tick has nothing to compare against and reports 0.
    pub fn tick_at(&mut self, now: Instant) -> f64 {
        let fps = match self.previous {
            Some(previous) => {
                let elapsed = now.saturating_duration_since(previous).as_secs_f64();
                1.0 / elapsed.max(Self::MIN_ELAPSED_SECS)
            }
            None => 0.0,
        };
        self.previous = Some(now);
        fps
    }
}

#[cfg(test)]
pub(crate) fn blank_frame(width: i32, height: i32) -> CvImage {
    let mat = Mat::new_rows_cols_with_default(
        height,
        width,
        opencv::core::CV_8UC3,
        Scalar::all(0.0),
    )
    .unwrap();
    CvImage::new(mat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::detection;
    use opencv::core::Vec3b;
    use std::time::Duration;

    #[test]
    fn test_first_fps_tick_is_zero() {
        let mut counter = FpsCounter::new();
        let now = Instant::now();

        assert_eq!(counter.tick_at(now), 0.0);
        // Same instant again must not divide by zero.
        let fps = counter.tick_at(now);
        assert!(fps.is_finite());
        assert!((fps - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_fps_from_elapsed_time() {
        let mut counter = FpsCounter::new();
        let start = Instant::now();
        counter.tick_at(start);

        let fps = counter.tick_at(start + Duration::from_millis(50));
        assert!((fps - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_annotate_draws_box_edges() {
        let mut frame = blank_frame(640, 480);
        let detection = detection("cat", 0.9);

        frame.annotate(&[detection.clone()]).unwrap();

        let top_edge = frame
            .mat
            .at_2d::<Vec3b>(detection.y1, (detection.x1 + detection.x2) / 2)
            .unwrap();
        assert_eq!((top_edge[0], top_edge[1], top_edge[2]), (0, 255, 0));

        let inside = frame.mat.at_2d::<Vec3b>(100, 50).unwrap();
        assert_eq!((inside[0], inside[1], inside[2]), (0, 0, 0));
    }

    #[test]
    fn test_resize_and_encode() {
        let mut frame = blank_frame(1280, 720);
        frame.resize(640, 480).unwrap();

        assert_eq!((frame.width(), frame.height()), (640, 480));

        let jpg = frame.to_jpg().unwrap();
        assert_eq!(&jpg[..2], &[0xFF, 0xD8]);
    }
}
