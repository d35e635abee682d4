use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Bootstrap configuration, read from `config.json` next to the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Node identity assigned by the panel.
    pub uuid: String,
    /// Control-plane HTTP port.
    pub port: u16,
    /// SFTP listener port.
    pub sftp: u16,
    /// Panel base URL.
    pub remote: String,
    /// Shared token every control request must present.
    pub token: String,
    /// Base directory holding one sandbox per server.
    pub path: String,
    #[serde(default)]
    pub ssl: bool,
    /// Consulted only when `ssl` is set; TLS termination itself is the
    /// embedding process' job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

pub fn config_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join("config.json")))
        .unwrap_or_else(|| PathBuf::from("config.json"))
}

pub fn load() -> anyhow::Result<AgentConfig> {
    let path = config_path();
    let raw = std::fs::read(&path)
        .with_context(|| format!("read configuration {}", path.display()))?;
    let config: AgentConfig = serde_json::from_slice(&raw)
        .with_context(|| format!("parse configuration {}", path.display()))?;
    Ok(config)
}

pub fn save(config: &AgentConfig) -> anyhow::Result<()> {
    let path = config_path();
    let data = serde_json::to_vec_pretty(config).context("serialize configuration")?;
    std::fs::write(&path, data)
        .with_context(|| format!("write configuration {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_panel_shape() {
        let raw = r#"{
            "uuid": "6f1a",
            "port": 8080,
            "sftp": 2022,
            "remote": "https://panel.example",
            "token": "secret",
            "path": "/srv/hightd",
            "ssl": false
        }"#;
        let config: AgentConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.sftp, 2022);
        assert!(config.cert_path.is_none());
    }

    #[test]
    fn tls_paths_are_optional_unless_ssl() {
        let raw = r#"{
            "uuid": "6f1a",
            "port": 8080,
            "sftp": 2022,
            "remote": "https://panel.example",
            "token": "secret",
            "path": "/srv/hightd",
            "ssl": true,
            "certPath": "/etc/ssl/agent.crt",
            "keyPath": "/etc/ssl/agent.key"
        }"#;
        let config: AgentConfig = serde_json::from_str(raw).unwrap();
        assert!(config.ssl);
        assert_eq!(config.cert_path.as_deref(), Some("/etc/ssl/agent.crt"));
    }
}
