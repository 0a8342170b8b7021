use crate::{
    camera::{CameraError, SourceOpener},
    config::Config,
    cv_utils::{CvImage, CvUtilsError, FpsCounter},
    detection::{primary_detection, retain_confident},
    detector::{Detector, DetectorError},
    speech::{SpeechNotifier, SpeechSession, SpeechWorker},
    stream::{encode_chunk, StreamError},
    telemetry::Metrics,
};
use bytes::Bytes;
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("Image error: {0}")]
    Image(#[from] CvUtilsError),
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub confidence_threshold: f32,
    pub frame_width: i32,
    pub frame_height: i32,
    pub channel_capacity: usize,
    pub max_consecutive_failures: u64,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            confidence_threshold: config.detector.confidence_threshold,
            frame_width: config.camera.frame_width,
            frame_height: config.camera.frame_height,
            channel_capacity: config.stream.channel_capacity.max(1),
            max_consecutive_failures: config.stream.max_consecutive_failures.max(1),
        }
    }
}

/// Per-stream state: FPS clock, speech edges and the label sent in part headers.
pub struct FrameProcessor {
    detector: Arc<dyn Detector>,
    metrics: Arc<Metrics>,
    notifier: SpeechNotifier,
    fps: FpsCounter,
    current_label: String,
    settings: PipelineSettings,
}

impl FrameProcessor {
    pub fn process(&mut self, mut frame: CvImage) -> Result<Bytes, PipelineError> {
        frame.resize(self.settings.frame_width, self.settings.frame_height)?;

        let started = Instant::now();
        let detections = self.detector.detect(&frame)?;
        self.metrics
            .record_inference_duration(started.elapsed().as_millis() as u64);

        let retained = retain_confident(detections, self.settings.confidence_threshold);
        frame.annotate(&retained)?;

        let fps = self.fps.tick();
        self.metrics.record_stream_fps(fps);
        frame.draw_fps(fps)?;

        let primary = primary_detection(&retained);
        if let Some(detection) = primary {
            if detection.class_label != self.current_label {
                tracing::debug!(
                    "Primary detection is now {:?} (class {})",
                    detection.class_label,
                    detection.class_id
                );
                self.current_label = detection.class_label.clone();
            }
        }
        let primary = primary.map(|d| d.class_label.as_str());
        let event = self.notifier.observe(primary);
        tracing::trace!("Speech event {:?}", event);

        let jpeg = frame.to_jpg()?;
        match encode_chunk(&self.current_label, &jpeg) {
            Ok(chunk) => Ok(chunk),
            Err(e) => {
                tracing::warn!("Sending frame without label: {}", e);
                Ok(encode_chunk("", &jpeg)?)
            }
        }
    }

    #[cfg(test)]
    pub fn current_label(&self) -> &str {
        &self.current_label
    }
}

pub struct FramePipeline {
    detector: Arc<dyn Detector>,
    opener: SourceOpener,
    session: Arc<SpeechSession>,
    speech: Option<Arc<SpeechWorker>>,
    metrics: Arc<Metrics>,
    settings: PipelineSettings,
    shutdown: broadcast::Sender<()>,
}

impl FramePipeline {
    pub fn new(
        detector: Arc<dyn Detector>,
        opener: SourceOpener,
        session: Arc<SpeechSession>,
        speech: Option<Arc<SpeechWorker>>,
        metrics: Arc<Metrics>,
        settings: PipelineSettings,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            detector,
            opener,
            session,
            speech,
            metrics,
            settings,
            shutdown,
        }
    }

    pub fn processor(&self) -> FrameProcessor {
        FrameProcessor {
            detector: self.detector.clone(),
            metrics: self.metrics.clone(),
            notifier: SpeechNotifier::new(self.session.clone(), self.speech.clone()),
            fps: FpsCounter::new(),
            current_label: String::new(),
            settings: self.settings.clone(),
        }
    }

    /// Starts a producer for one client. Dropping the returned stream or a
    /// shutdown broadcast stops it.
    pub fn spawn_stream(self: &Arc<Self>) -> ReceiverStream<Bytes> {
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity);
        let shutdown_rx = self.shutdown.subscribe();
        let pipeline = self.clone();
        tokio::task::spawn_blocking(move || pipeline.run(tx, shutdown_rx));
        ReceiverStream::new(rx)
    }

    #[tracing::instrument(skip_all, name = "frame_stream")]
    fn run(&self, tx: mpsc::Sender<Bytes>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut source = match (self.opener)() {
            Ok(source) => source,
            Err(e) => {
                tracing::error!("Failed to open frame source: {}", e);
                return;
            }
        };
        let mut processor = self.processor();
        let mut consecutive_failures = 0;

        while !tx.is_closed() {
            if !matches!(
                shutdown_rx.try_recv(),
                Err(broadcast::error::TryRecvError::Empty)
            ) {
                tracing::info!("Shutdown requested, ending stream");
                break;
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::warn!("Failed to grab frame, ending stream");
                    break;
                }
                Err(e) => {
                    tracing::error!("Camera read failed, ending stream: {}", e);
                    break;
                }
            };

            match processor.process(frame) {
                Ok(chunk) => {
                    consecutive_failures = 0;
                    if tx.blocking_send(chunk).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        "Skipping frame ({}/{} consecutive failures): {}",
                        consecutive_failures,
                        self.settings.max_consecutive_failures,
                        e
                    );
                    if consecutive_failures >= self.settings.max_consecutive_failures {
                        tracing::error!("Persistent failure detected, ending stream");
                        break;
                    }
                }
            }
        }

        if tx.is_closed() {
            tracing::info!("Stream client disconnected");
        }
        drop(source);
        tracing::info!("Stream stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        camera::FrameSource,
        cv_utils::blank_frame,
        detection::{detection, Detection},
        speech::{SpeechEngine, SpeechError},
        stream::parse_chunk,
    };
    use async_trait::async_trait;
    use opencv::{
        core::{Vec3b, Vector},
        imgcodecs,
        prelude::*,
    };
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::{runtime::Handle, sync::broadcast};
    use tokio_stream::StreamExt;

    pub(crate) struct ScriptedSource {
        remaining: Option<usize>,
        reads: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Option<CvImage>, CameraError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            match self.remaining.as_mut() {
                Some(0) => return Ok(None),
                Some(n) => *n -= 1,
                None => std::thread::sleep(Duration::from_millis(1)),
            }
            Ok(Some(blank_frame(640, 480)))
        }
    }

    impl Drop for ScriptedSource {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) struct SourceProbe {
        pub reads: Arc<AtomicUsize>,
        pub released: Arc<AtomicBool>,
    }

    /// `frames: None` never runs dry.
    pub(crate) fn scripted_opener(frames: Option<usize>) -> (SourceOpener, SourceProbe) {
        let reads = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicBool::new(false));
        let probe = SourceProbe {
            reads: reads.clone(),
            released: released.clone(),
        };
        let opener: SourceOpener = Arc::new(move || {
            Ok(Box::new(ScriptedSource {
                remaining: frames,
                reads: reads.clone(),
                released: released.clone(),
            }) as Box<dyn FrameSource>)
        });
        (opener, probe)
    }

    /// Replays scripted results, then reports nothing.
    pub(crate) struct MockDetector {
        script: Mutex<VecDeque<Result<Vec<Detection>, DetectorError>>>,
        always_fail: bool,
    }

    impl MockDetector {
        pub(crate) fn scripted(script: Vec<Result<Vec<Detection>, DetectorError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                always_fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                always_fail: true,
            }
        }
    }

    impl Detector for MockDetector {
        fn detect(&self, _frame: &CvImage) -> Result<Vec<Detection>, DetectorError> {
            if self.always_fail {
                return Err(DetectorError::Inference("model crashed".to_string()));
            }
            self.script.lock().pop_front().unwrap_or_else(|| Ok(vec![]))
        }
    }

    struct CountingEngine {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SpeechEngine for CountingEngine {
        async fn speak(&self, _text: &str) -> Result<(), SpeechError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    pub(crate) fn settings() -> PipelineSettings {
        PipelineSettings {
            confidence_threshold: 0.5,
            frame_width: 640,
            frame_height: 480,
            channel_capacity: 2,
            max_consecutive_failures: 3,
        }
    }

    pub(crate) fn pipeline(
        detector: MockDetector,
        opener: SourceOpener,
        speech: Option<Arc<SpeechWorker>>,
        session: Arc<SpeechSession>,
    ) -> Arc<FramePipeline> {
        let (shutdown, _) = broadcast::channel(1);
        pipeline_with_shutdown(detector, opener, speech, session, shutdown)
    }

    fn pipeline_with_shutdown(
        detector: MockDetector,
        opener: SourceOpener,
        speech: Option<Arc<SpeechWorker>>,
        session: Arc<SpeechSession>,
        shutdown: broadcast::Sender<()>,
    ) -> Arc<FramePipeline> {
        Arc::new(FramePipeline::new(
            Arc::new(detector),
            opener,
            session,
            speech,
            Arc::new(Metrics::new().unwrap()),
            settings(),
            shutdown,
        ))
    }

    fn boxed(label: &str, confidence: f32) -> Detection {
        Detection {
            x1: 200,
            y1: 200,
            x2: 400,
            y2: 400,
            ..detection(label, confidence)
        }
    }

    fn top_edge_pixel(chunk: &Bytes) -> Vec3b {
        let (_, jpeg) = parse_chunk(chunk).unwrap();
        let mat = imgcodecs::imdecode(&Vector::<u8>::from_slice(&jpeg), imgcodecs::IMREAD_COLOR)
            .unwrap();
        *mat.at_2d::<Vec3b>(200, 300).unwrap()
    }

    #[tokio::test]
    async fn test_low_confidence_is_not_drawn_and_not_spoken() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (shutdown, _) = broadcast::channel(1);
        let worker = Arc::new(SpeechWorker::new(
            Arc::new(CountingEngine {
                calls: calls.clone(),
            }),
            1,
            Handle::current(),
            shutdown,
            Arc::new(Metrics::new().unwrap()),
        ));
        let session = Arc::new(SpeechSession::new());
        let (opener, _) = scripted_opener(Some(0));
        let pipeline = pipeline(
            MockDetector::scripted(vec![
                Ok(vec![boxed("cat", 0.3)]),
                Ok(vec![boxed("cat", 0.9)]),
            ]),
            opener,
            Some(worker),
            session.clone(),
        );
        let mut processor = pipeline.processor();

        let ignored = processor.process(blank_frame(640, 480)).unwrap();
        let pixel = top_edge_pixel(&ignored);
        assert!(pixel[1] < 60, "low confidence box was drawn: {:?}", pixel);
        assert_eq!(processor.current_label(), "");
        assert!(!session.is_speaking());

        let drawn = processor.process(blank_frame(640, 480)).unwrap();
        let pixel = top_edge_pixel(&drawn);
        assert!(pixel[1] > 200 && pixel[0] < 60 && pixel[2] < 60, "{:?}", pixel);
        assert_eq!(processor.current_label(), "cat");
        assert!(session.is_speaking());

        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_label_header_follows_most_confident_and_persists() {
        let (opener, _) = scripted_opener(Some(0));
        let pipeline = pipeline(
            MockDetector::scripted(vec![
                Ok(vec![boxed("cat", 0.6), boxed("person", 0.95), boxed("dog", 0.7)]),
                Ok(vec![]),
                Ok(vec![boxed("bird", 0.2)]),
            ]),
            opener,
            None,
            Arc::new(SpeechSession::new()),
        );
        let mut processor = pipeline.processor();

        for _ in 0..3 {
            let chunk = processor.process(blank_frame(1280, 720)).unwrap();
            let (label, _) = parse_chunk(&chunk).unwrap();
            assert_eq!(label, "person");
        }
    }

    #[tokio::test]
    async fn test_failed_detection_skips_frame() {
        let (opener, probe) = scripted_opener(Some(3));
        let pipeline = pipeline(
            MockDetector::scripted(vec![
                Ok(vec![boxed("cat", 0.9)]),
                Err(DetectorError::Inference("timeout".to_string())),
                Ok(vec![]),
            ]),
            opener,
            None,
            Arc::new(SpeechSession::new()),
        );

        let chunks: Vec<Bytes> = pipeline.spawn_stream().collect().await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(probe.reads.load(Ordering::SeqCst), 4);
        assert!(probe.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_persistent_detector_failure_ends_stream() {
        let (opener, probe) = scripted_opener(None);
        let pipeline = pipeline(
            MockDetector::failing(),
            opener,
            None,
            Arc::new(SpeechSession::new()),
        );

        let chunks: Vec<Bytes> = pipeline.spawn_stream().collect().await;

        assert!(chunks.is_empty());
        assert_eq!(probe.reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_disconnect_releases_camera() {
        let (opener, probe) = scripted_opener(None);
        let pipeline = pipeline(
            MockDetector::scripted(vec![]),
            opener,
            None,
            Arc::new(SpeechSession::new()),
        );

        let mut stream = pipeline.spawn_stream();
        let first = stream.next().await.unwrap();
        assert!(first.starts_with(b"--frame\r\n"));
        drop(stream);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !probe.released.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_ends_stream_and_releases_camera() {
        let (opener, probe) = scripted_opener(None);
        let (shutdown, _) = broadcast::channel(1);
        let pipeline = pipeline_with_shutdown(
            MockDetector::scripted(vec![]),
            opener,
            None,
            Arc::new(SpeechSession::new()),
            shutdown.clone(),
        );

        let mut stream = pipeline.spawn_stream();
        assert!(stream.next().await.is_some());

        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while stream.next().await.is_some() {}
        })
        .await
        .expect("stream kept running after shutdown");

        assert!(probe.released.load(Ordering::SeqCst));
    }
}
