//! Configuration management
//!
//! Settings resolve in order: environment variable, then
//! `~/.config/parley/config.toml`, then the built-in default.

pub mod file;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::control::ControlConfig;
use crate::voice::{CaptureConfig, WavSpec, activity};
use crate::{Error, Result};

pub use file::{ParleyConfigFile, config_file_path, load_config_file};

/// Default control channel URL
pub const DEFAULT_CONTROL_URL: &str = "ws://127.0.0.1:8765";

/// Default reconnect delay in milliseconds
pub const DEFAULT_RECONNECT_MS: u64 = 5000;

/// Default delay before the first connection in milliseconds
pub const DEFAULT_CONNECT_DELAY_MS: u64 = 1000;

/// Default recordings directory
pub const DEFAULT_RECORDINGS_DIR: &str = "./recorded";

/// Default voice-channel capture silence in milliseconds
pub const DEFAULT_SILENCE_MS: u64 = 100;

/// Default local trailing silence in milliseconds
pub const DEFAULT_LOCAL_SILENCE_MS: u64 = 800;

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Discord bot token
    pub discord_token: Option<String>,
    /// Control channel settings
    pub control: ControlConfig,
    /// Directory artifacts are written to
    pub recordings_dir: PathBuf,
    /// Continuous silence that ends a voice-channel segment
    pub silence: Duration,
    /// RMS level above which the local microphone counts as speech
    pub energy_threshold: f32,
    /// Trailing silence that ends a local utterance
    pub local_silence: Duration,
}

impl Config {
    /// Load configuration from the environment and config file
    ///
    /// # Errors
    ///
    /// Returns error if a resolved value is invalid
    pub fn load() -> Result<Self> {
        Self::resolve(|key| std::env::var(key).ok(), load_config_file())
    }

    /// Resolve configuration from an environment lookup and a parsed file
    ///
    /// # Errors
    ///
    /// Returns error if a resolved value is invalid
    pub fn resolve<F>(env: F, fc: ParleyConfigFile) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = env("PARLEY_CONTROL_URL")
            .or(fc.control.url)
            .unwrap_or_else(|| DEFAULT_CONTROL_URL.to_string());

        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::Config(format!(
                "control url must be ws:// or wss://, got {url}"
            )));
        }

        let energy_threshold = parse_env(&env, "PARLEY_ENERGY_THRESHOLD")
            .or(fc.local.energy_threshold)
            .unwrap_or(activity::DEFAULT_THRESHOLD);

        if !(0.0..=1.0).contains(&energy_threshold) {
            return Err(Error::Config(format!(
                "energy threshold must be within 0.0..=1.0, got {energy_threshold}"
            )));
        }

        Ok(Self {
            discord_token: env("DISCORD_TOKEN").or(fc.discord.token),
            control: ControlConfig {
                url,
                reconnect_delay: millis(
                    parse_env(&env, "PARLEY_RECONNECT_MS").or(fc.control.reconnect_ms),
                    DEFAULT_RECONNECT_MS,
                ),
                initial_delay: millis(
                    parse_env(&env, "PARLEY_CONNECT_DELAY_MS").or(fc.control.connect_delay_ms),
                    DEFAULT_CONNECT_DELAY_MS,
                ),
            },
            recordings_dir: env("PARLEY_RECORDINGS_DIR")
                .or(fc.capture.recordings_dir)
                .map_or_else(|| PathBuf::from(DEFAULT_RECORDINGS_DIR), PathBuf::from),
            silence: millis(
                parse_env(&env, "PARLEY_SILENCE_MS").or(fc.capture.silence_ms),
                DEFAULT_SILENCE_MS,
            ),
            energy_threshold,
            local_silence: millis(
                parse_env(&env, "PARLEY_LOCAL_SILENCE_MS").or(fc.local.silence_ms),
                DEFAULT_LOCAL_SILENCE_MS,
            ),
        })
    }

    /// Discord token, required for the voice bot
    ///
    /// # Errors
    ///
    /// Returns error if no token is configured
    pub fn require_discord_token(&self) -> Result<&str> {
        self.discord_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Config("DISCORD_TOKEN is not set".to_string()))
    }

    /// Capture settings for voice-channel audio
    #[must_use]
    pub fn voice_capture(&self) -> CaptureConfig {
        CaptureConfig {
            dir: self.recordings_dir.clone(),
            spec: WavSpec::VOICE,
            silence: self.silence,
        }
    }

    /// Capture settings for the local microphone
    ///
    /// The segment timeout only backs up the speech gate, which ends
    /// utterances itself after the local silence.
    #[must_use]
    pub fn local_capture(&self) -> CaptureConfig {
        CaptureConfig {
            dir: self.recordings_dir.clone(),
            spec: WavSpec::MICROPHONE,
            silence: self.local_silence,
        }
    }
}

fn parse_env<F, T>(env: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}

const fn millis(value: Option<u64>, default: u64) -> Duration {
    match value {
        Some(ms) => Duration::from_millis(ms),
        None => Duration::from_millis(default),
    }
}
