use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub camera: CameraConfig,
    pub detector: DetectorConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    5000
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `PORT` wins over every other source, the way hosting platforms expect.
    fn apply_port_override(&mut self, port: Option<String>) -> Result<(), String> {
        if let Some(raw) = port {
            self.port = raw
                .trim()
                .parse()
                .map_err(|_| format!("PORT must be a valid port number, got `{}`", raw))?;
        }
        Ok(())
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct CameraConfig {
    #[serde(default)]
    pub device_index: i32,
    #[serde(default = "default_frame_width")]
    pub frame_width: i32,
    #[serde(default = "default_frame_height")]
    pub frame_height: i32,
}

fn default_frame_width() -> i32 {
    640
}

fn default_frame_height() -> i32 {
    480
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            frame_width: default_frame_width(),
            frame_height: default_frame_height(),
        }
    }
}

pub trait Validatable {
    fn get_path(&self) -> PathBuf;

    fn validate(&self) -> Result<(), String> {
        if !self.get_path().exists() {
            return Err(format!("File not found: {:?}", self.get_path()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    pub model: ModelConfig,
    pub labels: LabelsConfig,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

fn default_confidence_threshold() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub onnx_file: String,
    pub model_dir: PathBuf,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
    #[serde(default = "default_min_probability")]
    pub min_probability: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
}

fn default_model_instances() -> usize {
    1
}

fn default_min_probability() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.7
}

impl Validatable for ModelConfig {
    fn get_path(&self) -> PathBuf {
        self.model_dir.join(&self.onnx_file)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LabelsConfig {
    pub labels_file: String,
    pub labels_dir: PathBuf,
}

impl Validatable for LabelsConfig {
    fn get_path(&self) -> PathBuf {
        self.labels_dir.join(&self.labels_file)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u64,
}

fn default_channel_capacity() -> usize {
    2
}

fn default_max_consecutive_failures() -> u64 {
    10
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpeechConfig {
    #[serde(default = "default_speech_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_concurrent_utterances")]
    pub max_concurrent_utterances: usize,
    /// Overrides the platform TTS command; the text is passed as last argument.
    #[serde(default)]
    pub local_command: Option<Vec<String>>,
    /// Overrides the platform audio player used for rendered speech.
    #[serde(default)]
    pub player_command: Option<Vec<String>>,
    #[serde(default = "default_rendered_endpoint")]
    pub rendered_endpoint: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_audio_file")]
    pub audio_file: PathBuf,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_speech_enabled() -> bool {
    true
}

fn default_max_concurrent_utterances() -> usize {
    2
}

fn default_rendered_endpoint() -> String {
    "https://translate.google.com/translate_tts".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_audio_file() -> PathBuf {
    PathBuf::from("detected_label.mp3")
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: default_speech_enabled(),
            max_concurrent_utterances: default_max_concurrent_utterances(),
            local_command: None,
            player_command: None,
            rendered_endpoint: default_rendered_endpoint(),
            language: default_language(),
            audio_file: default_audio_file(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssetsConfig {
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    #[serde(default = "default_index_file")]
    pub index_file: PathBuf,
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

fn default_index_file() -> PathBuf {
    PathBuf::from("templates/index.html")
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            static_dir: default_static_dir(),
            index_file: default_index_file(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("No current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let mut config = load_configuration(&configuration_directory, &environment, None)?;
    config
        .server
        .apply_port_override(std::env::var("PORT").ok())
        .map_err(config::ConfigError::Message)?;

    Ok(config)
}

/// Layers `base.yaml`, the environment file and `WD_` variables. `env_vars`
/// replaces the process environment when given.
fn load_configuration(
    configuration_directory: &Path,
    environment: &Environment,
    env_vars: Option<config::Map<String, String>>,
) -> Result<Config, config::ConfigError> {
    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("WD")
                .prefix_separator("_")
                .separator("__")
                .source(env_vars),
        )
        .build()?;

    settings.try_deserialize::<Config>()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_YAML: &str = r#"
server:
  host: 0.0.0.0
log_level: info
detector:
  model:
    onnx_file: yolov8n.onnx
    model_dir: models
  labels:
    labels_file: labels.txt
    labels_dir: models
"#;

    fn parse(yaml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(BASE_YAML);

        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.get_address(), "0.0.0.0:5000");
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.camera.device_index, 0);
        assert_eq!(config.camera.frame_width, 640);
        assert_eq!(config.camera.frame_height, 480);
        assert_eq!(config.detector.confidence_threshold, 0.5);
        assert_eq!(config.detector.model.iou_threshold, 0.7);
        assert_eq!(config.stream.channel_capacity, 2);
        assert!(config.speech.enabled);
        assert_eq!(config.assets.static_dir, PathBuf::from("static"));
        assert_eq!(
            config.detector.model.get_path(),
            PathBuf::from("models/yolov8n.onnx")
        );
    }

    #[test]
    fn test_port_override() {
        let mut server = parse(BASE_YAML).server;

        server.apply_port_override(Some("8080".into())).unwrap();
        assert_eq!(server.port, 8080);

        server.apply_port_override(None).unwrap();
        assert_eq!(server.port, 8080);

        assert!(server.apply_port_override(Some("http".into())).is_err());
    }

    #[test]
    fn test_log_level_rejects_unknown() {
        let result: Result<LogLevel, String> = "trace".to_string().try_into();
        assert!(result.is_err());
    }

    #[test]
    fn test_environment_layers_override_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("base.yaml"), BASE_YAML).unwrap();
        std::fs::write(
            dir.path().join("production.yaml"),
            "log_level: debug\nspeech:\n  enabled: false\n",
        )
        .unwrap();

        let env_vars = config::Map::from([
            (
                "WD_DETECTOR__CONFIDENCE_THRESHOLD".to_string(),
                "0.8".to_string(),
            ),
            ("WD_SERVER__PORT".to_string(), "9000".to_string()),
        ]);
        let config =
            load_configuration(dir.path(), &Environment::Production, Some(env_vars)).unwrap();

        assert_eq!(config.detector.confidence_threshold, 0.8);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(!config.speech.enabled);

        let config =
            load_configuration(dir.path(), &Environment::Local, Some(config::Map::new())).unwrap();
        assert_eq!(config.detector.confidence_threshold, 0.5);
        assert_eq!(config.log_level, LogLevel::Info);
    }
}
