//! Speech backends. A local TTS command is preferred; rendered audio from a cloud
//! endpoint is the fallback.

use super::SpeechError;
use crate::config::SpeechConfig;
use async_trait::async_trait;
use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};
use tokio::process::Command;
use tracing::{debug, warn};

const TEXT_PLACEHOLDER: &str = "{text}";

#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Resolves once the utterance has been handed off or finished playing.
    async fn speak(&self, text: &str) -> Result<(), SpeechError>;

    fn name(&self) -> &str;
}

/// Drops control characters and anything a shell could interpret.
fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| {
            !c.is_control()
                && !matches!(
                    c,
                    ';' | '|' | '&' | '$' | '`' | '(' | ')' | '<' | '>' | '"' | '\''
                )
        })
        .take(256)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Substitutes `{text}` in the argument template, or appends the text when absent.
fn build_args(template: &[String], text: &str) -> Vec<String> {
    let mut substituted = false;
    let mut args: Vec<String> = template
        .iter()
        .map(|arg| {
            if arg.contains(TEXT_PLACEHOLDER) {
                substituted = true;
                arg.replace(TEXT_PLACEHOLDER, text)
            } else {
                arg.clone()
            }
        })
        .collect();
    if !substituted {
        args.push(text.to_string());
    }
    args
}

fn split_command(command: Vec<String>) -> Result<(String, Vec<String>), SpeechError> {
    let mut parts = command.into_iter();
    let program = parts
        .next()
        .filter(|program| !program.trim().is_empty())
        .ok_or_else(|| SpeechError::Unsupported("empty command".to_string()))?;
    Ok((program, parts.collect()))
}

fn default_tts_command() -> Option<Vec<String>> {
    if cfg!(target_os = "macos") {
        Some(vec!["say".to_string()])
    } else if cfg!(target_os = "linux") {
        Some(vec!["espeak-ng".to_string()])
    } else if cfg!(target_os = "windows") {
        Some(vec![
            "powershell".to_string(),
            "-NoProfile".to_string(),
            "-Command".to_string(),
            "Add-Type -AssemblyName System.Speech; \
             (New-Object System.Speech.Synthesis.SpeechSynthesizer).Speak('{text}')"
                .to_string(),
        ])
    } else {
        None
    }
}

fn default_player_command() -> Option<Vec<String>> {
    if cfg!(target_os = "macos") {
        Some(vec!["afplay".to_string()])
    } else if cfg!(target_os = "linux") {
        Some(vec!["mpg123".to_string(), "-q".to_string()])
    } else if cfg!(target_os = "windows") {
        Some(vec![
            "cmd".to_string(),
            "/C".to_string(),
            "start".to_string(),
            String::new(),
        ])
    } else {
        None
    }
}

/// Speaks through the platform TTS command and waits for it to finish.
pub struct LocalSynthesis {
    program: String,
    args: Vec<String>,
}

impl LocalSynthesis {
    pub fn new(command: Option<Vec<String>>) -> Result<Self, SpeechError> {
        let command = command
            .or_else(default_tts_command)
            .ok_or_else(|| SpeechError::Unsupported("no local TTS command".to_string()))?;
        let (program, args) = split_command(command)?;
        Ok(Self { program, args })
    }
}

#[async_trait]
impl SpeechEngine for LocalSynthesis {
    async fn speak(&self, text: &str) -> Result<(), SpeechError> {
        let text = sanitize(text);
        if text.is_empty() {
            return Err(SpeechError::EmptyText);
        }

        let output = Command::new(&self.program)
            .args(build_args(&self.args, &text))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(SpeechError::Process(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Downloads a spoken rendering, writes it next to the process and starts a player
/// without waiting for it. The audio file is overwritten on every utterance.
pub struct RenderedAudioSynthesis {
    client: reqwest::Client,
    endpoint: String,
    language: String,
    audio_file: PathBuf,
    player: Option<(String, Vec<String>)>,
}

impl RenderedAudioSynthesis {
    pub fn new(config: &SpeechConfig) -> Result<Self, SpeechError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let player = config
            .player_command
            .clone()
            .or_else(default_player_command)
            .map(split_command)
            .transpose()?;

        Ok(Self {
            client,
            endpoint: config.rendered_endpoint.clone(),
            language: config.language.clone(),
            audio_file: config.audio_file.clone(),
            player,
        })
    }

    fn play(&self) -> Result<(), SpeechError> {
        let Some((program, args)) = &self.player else {
            warn!("No audio player available, rendered speech saved to {:?}", self.audio_file);
            return Ok(());
        };

        let audio_file = self.audio_file.to_string_lossy();
        Command::new(program)
            .args(build_args(args, &audio_file))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }
}

#[async_trait]
impl SpeechEngine for RenderedAudioSynthesis {
    async fn speak(&self, text: &str) -> Result<(), SpeechError> {
        let text = sanitize(text);
        if text.is_empty() {
            return Err(SpeechError::EmptyText);
        }

        let audio = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("ie", "UTF-8"),
                ("client", "tw-ob"),
                ("tl", self.language.as_str()),
                ("q", text.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        tokio::fs::write(&self.audio_file, &audio).await?;
        debug!("Wrote {} bytes of speech to {:?}", audio.len(), self.audio_file);

        self.play()
    }

    fn name(&self) -> &str {
        "rendered"
    }
}

pub struct FallbackSynthesis {
    primary: Box<dyn SpeechEngine>,
    fallback: Box<dyn SpeechEngine>,
}

impl FallbackSynthesis {
    pub fn new(primary: Box<dyn SpeechEngine>, fallback: Box<dyn SpeechEngine>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl SpeechEngine for FallbackSynthesis {
    async fn speak(&self, text: &str) -> Result<(), SpeechError> {
        let primary = match self.primary.speak(text).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!(
            "{} speech failed, falling back to {}: {}",
            self.primary.name(),
            self.fallback.name(),
            primary
        );

        self.fallback
            .speak(text)
            .await
            .map_err(|fallback| SpeechError::AllEnginesFailed {
                primary: Box::new(primary),
                fallback: Box::new(fallback),
            })
    }

    fn name(&self) -> &str {
        "fallback"
    }
}

pub fn engine_from_config(config: &SpeechConfig) -> Result<Arc<dyn SpeechEngine>, SpeechError> {
    let rendered = RenderedAudioSynthesis::new(config)?;

    match LocalSynthesis::new(config.local_command.clone()) {
        Ok(local) => Ok(Arc::new(FallbackSynthesis::new(
            Box::new(local),
            Box::new(rendered),
        ))),
        Err(e) => {
            warn!("Local speech unavailable ({}), using rendered audio only", e);
            Ok(Arc::new(rendered))
        }
    }
}
