use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::collections::HashSet;

pub struct Metrics {
    stream_counter: Counter<u64>,
    inference_duration: Histogram<u64>,
    stream_fps: Gauge<f64>,
    utterance_counter: Counter<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build prometheus exporter: {:?}", e))?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("webcam_detection");
        global::set_meter_provider(provider);

        let stream_counter = meter
            .u64_counter("video_streams_total")
            .with_description("Total number of video streams opened")
            .build();

        let boundaries = generate_boundaries((15, 30, 60, 500, 1000));

        let inference_duration = meter
            .u64_histogram("inference_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of detector calls in milliseconds")
            .build();

        let stream_fps = meter
            .f64_gauge("stream_fps")
            .with_description("FPS of the annotated stream")
            .build();

        let utterance_counter = meter
            .u64_counter("utterances_total")
            .with_description("Speech utterances by outcome")
            .build();

        Ok(Metrics {
            stream_counter,
            inference_duration,
            stream_fps,
            utterance_counter,
            registry,
        })
    }

    pub fn record_stream_opened(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.stream_counter.add(1, &attributes);
    }

    pub fn record_inference_duration(&self, duration_ms: u64) {
        self.inference_duration.record(duration_ms, &[]);
    }

    pub fn record_stream_fps(&self, fps: f64) {
        self.stream_fps.record(fps, &[]);
    }

    pub fn record_utterance(&self, outcome: &'static str) {
        let attributes = vec![KeyValue::new("outcome", outcome)];
        self.utterance_counter.add(1, &attributes);
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_boundaries() {
        let parts = (2, 22, 26, 46, 146);
        let get = generate_boundaries(parts);
        let expected = vec![2.0, 12.0, 22.0, 24.0, 26.0, 46.0, 146.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_metrics_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_stream_opened("/video_feed");
        metrics.record_utterance("spoken");

        let exposition = metrics.encode().unwrap();

        assert!(exposition.contains("video_streams_total"));
        assert!(exposition.contains("utterances_total"));
    }
}
