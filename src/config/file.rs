//! TOML configuration file loading
//!
//! Supports `~/.config/parley/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ParleyConfigFile {
    /// Discord bot settings
    #[serde(default)]
    pub discord: DiscordFileConfig,

    /// Speech service control channel
    #[serde(default)]
    pub control: ControlFileConfig,

    /// Capture settings
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Local microphone settings
    #[serde(default)]
    pub local: LocalFileConfig,
}

/// Discord bot configuration
#[derive(Debug, Default, Deserialize)]
pub struct DiscordFileConfig {
    /// Bot token
    pub token: Option<String>,
}

/// Control channel configuration
#[derive(Debug, Default, Deserialize)]
pub struct ControlFileConfig {
    /// WebSocket URL of the speech service
    pub url: Option<String>,

    /// Delay before every reconnect attempt, in milliseconds
    pub reconnect_ms: Option<u64>,

    /// Delay before the first connection attempt, in milliseconds
    pub connect_delay_ms: Option<u64>,
}

/// Capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    /// Directory artifacts are written to
    pub recordings_dir: Option<String>,

    /// Continuous silence that ends a voice-channel segment, in milliseconds
    pub silence_ms: Option<u64>,
}

/// Local microphone configuration
#[derive(Debug, Default, Deserialize)]
pub struct LocalFileConfig {
    /// RMS level above which the microphone counts as speech
    pub energy_threshold: Option<f32>,

    /// Trailing silence that ends a local utterance, in milliseconds
    pub silence_ms: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ParleyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ParleyConfigFile {
    let Some(path) = config_file_path() else {
        return ParleyConfigFile::default();
    };

    if !path.exists() {
        return ParleyConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ParleyConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ParleyConfigFile::default()
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the contents are not valid TOML for the schema
pub fn parse_config(content: &str) -> crate::Result<ParleyConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/parley/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("parley").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = parse_config("").unwrap();
        assert!(config.discord.token.is_none());
        assert!(config.control.url.is_none());
        assert!(config.local.energy_threshold.is_none());
    }

    #[test]
    fn partial_sections_parse() {
        let config = parse_config(
            r#"
            [control]
            url = "ws://speech.local:9000"
            reconnect_ms = 2500

            [capture]
            recordings_dir = "/var/lib/parley"
            "#,
        )
        .unwrap();

        assert_eq!(config.control.url.as_deref(), Some("ws://speech.local:9000"));
        assert_eq!(config.control.reconnect_ms, Some(2500));
        assert!(config.control.connect_delay_ms.is_none());
        assert_eq!(config.capture.recordings_dir.as_deref(), Some("/var/lib/parley"));
    }

    #[test]
    fn wrong_types_are_rejected() {
        let err = parse_config("[capture]\nsilence_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, crate::Error::Toml(_)));
    }
}
