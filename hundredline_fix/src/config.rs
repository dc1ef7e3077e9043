use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

pub const CONFIG_FILE: &str = "HundredLineFix.toml";

/// `HundredLineFix.toml` as written by the user. Missing sections and keys take defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "Custom Resolution")]
    pub custom_resolution: CustomResolution,
    #[serde(rename = "Framerate Limit")]
    pub framerate_limit: FramerateLimit,
    #[serde(rename = "Fix Aspect Ratio")]
    pub fix_aspect_ratio: FixAspectRatio,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CustomResolution {
    pub enabled: bool,
    pub width: i32,
    pub height: i32,
}

/// A missing `FPS` is 0, which lifts the limit entirely
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FramerateLimit {
    #[serde(rename = "FPS")]
    pub fps: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct FixAspectRatio {
    pub enabled: bool,
}

/// What the game limits itself to when left alone
pub const GAME_FRAMERATE: i32 = 60;
const MAX_FRAMERATE: i32 = 1000;

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("could not parse {}", path.display()))
    }
}

/// Validated settings the fixes run with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub custom_resolution: bool,
    pub custom_width: i32,
    pub custom_height: i32,
    pub framerate_limit: i32,
    pub fix_aspect: bool,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        let settings = Self {
            custom_resolution: config.custom_resolution.enabled,
            custom_width: config.custom_resolution.width,
            custom_height: config.custom_resolution.height,
            framerate_limit: config.framerate_limit.fps.clamp(0, MAX_FRAMERATE),
            fix_aspect: config.fix_aspect_ratio.enabled,
        };

        info!("----------");
        info!("Config Parse: custom_resolution: {}", settings.custom_resolution);
        info!("Config Parse: custom_width: {}", settings.custom_width);
        info!("Config Parse: custom_height: {}", settings.custom_height);
        info!("Config Parse: framerate_limit: {}", settings.framerate_limit);
        info!("Config Parse: fix_aspect: {}", settings.fix_aspect);
        info!("----------");

        settings
    }

    /// An enabled custom resolution that was left at 0 (or is otherwise invalid) becomes
    /// the desktop resolution.
    pub fn with_desktop_fallback(mut self, desktop: Option<(i32, i32)>) -> Self {
        if self.custom_resolution && (self.custom_width <= 0 || self.custom_height <= 0) {
            if let Some((width, height)) = desktop {
                info!("Custom Resolution: Using desktop resolution {width}x{height}");
                self.custom_width = width;
                self.custom_height = height;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let config = Config::parse(
            r#"
            ["Custom Resolution"]
            Enabled = true
            Width = 3440
            Height = 1440

            ["Framerate Limit"]
            FPS = 144

            ["Fix Aspect Ratio"]
            Enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(
            Settings {
                custom_resolution: true,
                custom_width: 3440,
                custom_height: 1440,
                framerate_limit: 144,
                fix_aspect: true,
            },
            Settings::from_config(&config)
        );
    }

    #[test]
    fn missing_keys_take_defaults() {
        let config = Config::parse("[\"Custom Resolution\"]\nEnabled = true\n").unwrap();
        assert_eq!(
            Settings {
                custom_resolution: true,
                custom_width: 0,
                custom_height: 0,
                framerate_limit: 0,
                fix_aspect: false,
            },
            Settings::from_config(&config)
        );
        assert_eq!(
            Settings::from_config(&Config::default()),
            Settings::from_config(&Config::parse("").unwrap())
        );
    }

    #[test]
    fn framerate_limit_is_clamped() {
        for (fps, expected) in [(-5, 0), (0, 0), (144, 144), (1000, 1000), (5000, 1000)] {
            let config = Config::parse(&format!("[\"Framerate Limit\"]\nFPS = {fps}\n")).unwrap();
            assert_eq!(expected, Settings::from_config(&config).framerate_limit);
        }
    }

    #[test]
    fn malformed_config_is_an_error() {
        assert!(Config::parse("[\"Framerate Limit\"]\nFPS = \"fast\"\n").is_err());
        assert!(Config::parse("[\"Custom Resolution\"\n").is_err());
        assert!(Config::load(Path::new("does/not/exist.toml")).is_err());
    }

    #[test]
    fn desktop_fallback() {
        let settings = Settings {
            custom_resolution: true,
            custom_width: 0,
            custom_height: 1080,
            framerate_limit: 60,
            fix_aspect: false,
        };
        let resolved = settings.clone().with_desktop_fallback(Some((2560, 1440)));
        assert_eq!((2560, 1440), (resolved.custom_width, resolved.custom_height));

        // nothing to fall back to
        assert_eq!(settings, settings.clone().with_desktop_fallback(None));

        let disabled = Settings {
            custom_resolution: false,
            ..settings.clone()
        };
        assert_eq!(disabled, disabled.clone().with_desktop_fallback(Some((2560, 1440))));

        let valid = Settings {
            custom_width: 1920,
            ..settings
        };
        assert_eq!(valid, valid.clone().with_desktop_fallback(Some((2560, 1440))));
    }
}
