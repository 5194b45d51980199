use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between display updates.
    pub interval: f64,

    /// Override the detected terminal width/height.
    pub width: Option<u16>,
    pub height: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: 1.0,
            width: None,
            height: None,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let paths = [
            dirs::config_dir().map(|p| p.join("pipeflow/config.toml")),
            dirs::home_dir().map(|p| p.join(".pipeflow.toml")),
            Some(PathBuf::from("pipeflow.toml")),
        ];

        for path in paths.into_iter().flatten() {
            if path.exists() {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    if let Ok(config) = toml::from_str(&content) {
                        return config;
                    }
                }
            }
        }

        Config::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.interval, 1.0);
        assert!(config.width.is_none());
        assert!(config.height.is_none());
    }

    #[test]
    fn parses_partial_config() {
        let config: Config = toml::from_str("interval = 0.5\nwidth = 132\n").unwrap();
        assert_eq!(config.interval, 0.5);
        assert_eq!(config.width, Some(132));
        assert_eq!(config.height, None);
    }
}
