use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

use crate::session::MediaDirections;

fn default_receive_video() -> bool {
    true
}

fn default_log_dir() -> String {
    "./".to_owned()
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ViewerConfig {
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub receive_audio: bool,
    #[serde(default = "default_receive_video")]
    pub receive_video: bool,
    #[serde(default)]
    pub ice_failed_timeout_secs: Option<u64>,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl ViewerConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse config")
    }

    /// Reads the file and applies `VIEWLINK_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config = Self::from_toml(&text)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup("VIEWLINK_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(token) = lookup("VIEWLINK_TOKEN") {
            self.token = Some(token);
        }
        if let Some(device_id) = lookup("VIEWLINK_DEVICE_ID") {
            self.device_id = Some(device_id);
        }
    }

    /// Broker endpoint with `token` and `device_id` appended as query
    /// parameters.
    pub fn endpoint_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)
            .with_context(|| format!("Invalid endpoint: {}", self.endpoint))?;
        if self.token.is_some() || self.device_id.is_some() {
            let mut query = url.query_pairs_mut();
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
            if let Some(device_id) = &self.device_id {
                query.append_pair("device_id", device_id);
            }
        }
        Ok(url)
    }

    pub fn media_directions(&self) -> MediaDirections {
        MediaDirections::new(self.receive_video, self.receive_audio)
    }

    pub fn ice_failed_timeout(&self) -> Option<Duration> {
        self.ice_failed_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = ViewerConfig::from_toml(r#"endpoint = "wss://broker.example.com/ws""#).unwrap();
        assert_eq!(config.token, None);
        assert_eq!(config.device_id, None);
        assert_eq!(config.media_directions(), MediaDirections::default());
        assert_eq!(config.ice_failed_timeout(), None);
        assert_eq!(config.log_dir, "./");
    }

    #[test]
    fn test_full_config() {
        let config = ViewerConfig::from_toml(
            r#"
endpoint = "wss://broker.example.com/ws"
token = "secret"
device_id = "cam-1"
receive_audio = true
receive_video = false
ice_failed_timeout_secs = 15
log_dir = "/var/log/viewlink"
"#,
        )
        .unwrap();
        assert_eq!(config.media_directions(), MediaDirections::new(false, true));
        assert_eq!(config.ice_failed_timeout(), Some(Duration::from_secs(15)));
        assert_eq!(config.log_dir, "/var/log/viewlink");
    }

    #[test]
    fn test_missing_endpoint_is_rejected() {
        assert!(ViewerConfig::from_toml("token = \"secret\"").is_err());
    }

    #[test]
    fn test_endpoint_url_appends_credentials() {
        let mut config = ViewerConfig::from_toml(r#"endpoint = "wss://broker.example.com/ws?v=2""#).unwrap();
        assert_eq!(
            config.endpoint_url().unwrap().as_str(),
            "wss://broker.example.com/ws?v=2"
        );

        config.token = Some("a b&c".to_owned());
        config.device_id = Some("cam-1".to_owned());
        assert_eq!(
            config.endpoint_url().unwrap().as_str(),
            "wss://broker.example.com/ws?v=2&token=a+b%26c&device_id=cam-1"
        );
    }

    #[test]
    fn test_invalid_endpoint() {
        let config = ViewerConfig::from_toml(r#"endpoint = "not a url""#).unwrap();
        assert!(config.endpoint_url().is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = ViewerConfig::from_toml(
            r#"
endpoint = "ws://localhost:8080"
token = "file-token"
"#,
        )
        .unwrap();
        let env: HashMap<_, _> = [
            ("VIEWLINK_ENDPOINT", "ws://broker:9000"),
            ("VIEWLINK_DEVICE_ID", "cam-2"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.endpoint, "ws://broker:9000");
        assert_eq!(config.token.as_deref(), Some("file-token"));
        assert_eq!(config.device_id.as_deref(), Some("cam-2"));
    }
}
