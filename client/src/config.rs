//! Configuration file parser for NTunnel
//!
//! Supports ntunnel.yml with relay endpoints, key material and
//! per-role (agent / client) settings, plus key file handling.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use ntunnel_shared::crypto::{Identity, Keypair};

pub const DEFAULT_RELAY: &str = "ws://localhost:7447";
pub const DEFAULT_TARGET: &str = "http://localhost:8080";
pub const DEFAULT_PROXY_PORT: u16 = 3000;
pub const KEY_FILE_NAME: &str = "ntunnel.key";

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NTunnelConfig {
    /// Relay endpoint URLs
    #[serde(default)]
    pub relays: Vec<String>,

    /// Private key, hex
    pub key: Option<String>,

    /// Private key file
    pub key_path: Option<PathBuf>,

    /// How long a publish waits for the first relay acknowledgement
    pub publish_timeout_ms: Option<u64>,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

/// Settings for `ntunnel agent`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Local service base URL
    pub target: Option<String>,

    /// Largest response body relayed, in bytes
    pub max_response_size: Option<usize>,

    /// Timeout for the call to the local service
    pub upstream_timeout_ms: Option<u64>,
}

/// Settings for `ntunnel proxy` and `ntunnel fetch`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Agent identity, hex
    pub agent: Option<String>,

    /// Per-request timeout
    pub timeout_ms: Option<u64>,

    /// Local proxy port
    pub port: Option<u16>,

    /// Extra request headers, `Name: value`
    #[serde(default)]
    pub set_headers: Vec<String>,
}

impl NTunnelConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: NTunnelConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        for relay in &self.relays {
            if !(relay.starts_with("ws://") || relay.starts_with("wss://")) {
                anyhow::bail!("Invalid relay URL '{}': expected ws:// or wss://", relay);
            }
        }

        if let Some(key) = &self.key {
            Keypair::from_hex(key).map_err(|e| anyhow!("Invalid key: {}", e))?;
        }

        if let Some(target) = &self.agent.target {
            let url = reqwest::Url::parse(target)
                .with_context(|| format!("Invalid agent target '{}'", target))?;
            match url.scheme() {
                "http" | "https" => {}
                other => anyhow::bail!("Unsupported target scheme '{}'", other),
            }
        }

        if self.agent.max_response_size == Some(0) {
            anyhow::bail!("max_response_size must be greater than 0");
        }

        if let Some(agent) = &self.client.agent {
            agent
                .parse::<Identity>()
                .map_err(|e| anyhow!("Invalid agent identity '{}': {}", agent, e))?;
        }

        if self.client.port == Some(0) {
            anyhow::bail!("Invalid proxy port 0");
        }

        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "ntunnel.yml",
            "ntunnel.yaml",
            ".ntunnel.yml",
            ".ntunnel.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

/// `$DATA_DIR/ntunnel.key`, or `./ntunnel.key` without DATA_DIR
pub fn default_key_path() -> PathBuf {
    std::env::var_os("DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(KEY_FILE_NAME)
}

/// Read a hex secret from `path`, creating one if the file does not exist.
pub fn load_or_generate_key(path: &Path) -> Result<Keypair> {
    match std::fs::read_to_string(path) {
        Ok(text) => Keypair::from_hex(text.trim())
            .map_err(|e| anyhow!("Invalid key in {}: {}", path.display(), e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            write_secret(path, &keypair.secret_hex())
                .with_context(|| format!("Failed to write key file: {}", path.display()))?;
            info!("Generated new key at {}", path.display());
            Ok(keypair)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read key file: {}", path.display())),
    }
}

/// Agents keep a stable identity: inline key, else the key file (created on first run).
pub fn agent_keypair(key: Option<&str>, key_path: Option<&Path>) -> Result<Keypair> {
    match key {
        Some(hex) => Keypair::from_hex(hex).map_err(|e| anyhow!("Invalid key: {}", e)),
        None => match key_path {
            Some(path) => load_or_generate_key(path),
            None => load_or_generate_key(&default_key_path()),
        },
    }
}

/// Clients use an ephemeral identity unless a key is configured.
pub fn client_keypair(key: Option<&str>, key_path: Option<&Path>) -> Result<Keypair> {
    match (key, key_path) {
        (Some(hex), _) => Keypair::from_hex(hex).map_err(|e| anyhow!("Invalid key: {}", e)),
        (None, Some(path)) => load_or_generate_key(path),
        (None, None) => Ok(Keypair::generate()),
    }
}

#[cfg(unix)]
fn write_secret(path: &Path, secret: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(secret.as_bytes())
}

#[cfg(not(unix))]
fn write_secret(path: &Path, secret: &str) -> std::io::Result<()> {
    std::fs::write(path, secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
relays:
  - wss://relay-one.example.com
  - ws://localhost:7447
publish_timeout_ms: 5000
agent:
  target: http://localhost:3000
  max_response_size: 1048576
client:
  timeout_ms: 10000
  port: 8000
  set_headers:
    - "x-tunnel: yes"
"#;
        let config: NTunnelConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.relays.len(), 2);
        assert_eq!(config.publish_timeout_ms, Some(5000));
        assert_eq!(config.agent.target.as_deref(), Some("http://localhost:3000"));
        assert_eq!(config.agent.max_response_size, Some(1048576));
        assert_eq!(config.client.port, Some(8000));
        assert_eq!(config.client.set_headers, vec!["x-tunnel: yes".to_string()]);
        assert!(config.key.is_none());
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config: NTunnelConfig = serde_yaml::from_str("{}").unwrap();
        config.validate().unwrap();
        assert!(config.relays.is_empty());
    }

    #[test]
    fn test_validation_errors() {
        let bad_relay: NTunnelConfig = serde_yaml::from_str("relays: [\"http://nope\"]").unwrap();
        assert!(bad_relay.validate().is_err());

        let bad_target: NTunnelConfig =
            serde_yaml::from_str("agent:\n  target: ftp://files").unwrap();
        assert!(bad_target.validate().is_err());

        let bad_agent: NTunnelConfig =
            serde_yaml::from_str("client:\n  agent: not-an-identity").unwrap();
        assert!(bad_agent.validate().is_err());

        let zero_size: NTunnelConfig =
            serde_yaml::from_str("agent:\n  max_response_size: 0").unwrap();
        assert!(zero_size.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ntunnel.yml");
        let agent = Keypair::generate().identity();
        std::fs::write(&path, format!("client:\n  agent: \"{}\"\n", agent)).unwrap();

        let config = NTunnelConfig::load(&path).unwrap();
        assert_eq!(config.client.agent, Some(agent.to_string()));

        assert!(NTunnelConfig::load(&dir.path().join("missing.yml")).is_err());
    }

    #[test]
    fn test_key_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(KEY_FILE_NAME);

        let first = load_or_generate_key(&path).unwrap();
        assert!(path.exists());
        let second = load_or_generate_key(&path).unwrap();
        assert_eq!(first.identity(), second.identity());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_corrupt_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KEY_FILE_NAME);
        std::fs::write(&path, "definitely not hex").unwrap();
        assert!(load_or_generate_key(&path).is_err());
    }

    #[test]
    fn test_key_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KEY_FILE_NAME);
        let inline = Keypair::generate();

        let chosen = agent_keypair(Some(&inline.secret_hex()), Some(&path)).unwrap();
        assert_eq!(chosen.identity(), inline.identity());
        assert!(!path.exists());

        let from_file = agent_keypair(None, Some(&path)).unwrap();
        assert_eq!(client_keypair(None, Some(&path)).unwrap().identity(), from_file.identity());

        let a = client_keypair(None, None).unwrap();
        let b = client_keypair(None, None).unwrap();
        assert_ne!(a.identity(), b.identity());
    }
}
