#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

use crate::util::secret::SecretString;

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub preview: PreviewSettings,
	pub dev: DevSettings,
}

/// Core server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for connection tokens. Required to start.
	pub auth_hmac_secret: Option<SecretString>,
	/// Maximum protocol frame size in bytes.
	pub max_frame_bytes: u32,
	/// Per-connection outbound event queue capacity.
	pub event_queue_capacity: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			health_bind: None,
			auth_hmac_secret: None,
			max_frame_bytes: parley_protocol::DEFAULT_MAX_FRAME_SIZE as u32,
			event_queue_capacity: 1024,
		}
	}
}

/// Persistence settings.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable the SQL store; otherwise an empty in-memory store is used
	/// (dev only).
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

/// Link-preview enrichment settings.
#[derive(Debug, Clone)]
pub struct PreviewSettings {
	pub enabled: bool,
	pub timeout: Duration,
	pub max_redirects: usize,
	pub max_body_bytes: usize,
	pub user_agent: Option<String>,
}

impl Default for PreviewSettings {
	fn default() -> Self {
		Self {
			enabled: true,
			timeout: Duration::from_secs(5),
			max_redirects: 3,
			max_body_bytes: 256 * 1024,
			user_agent: None,
		}
	}
}

/// Dev-only seed data, applied only when persistence is disabled.
#[derive(Debug, Clone, Default)]
pub struct DevSettings {
	pub seed_users: Vec<DevUser>,
	pub seed_rooms: Vec<DevRoom>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevUser {
	pub id: String,
	pub email: String,
	#[serde(default)]
	pub display_name: Option<String>,
	#[serde(default)]
	pub avatar_ref: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevRoom {
	pub id: String,
	#[serde(default)]
	pub participants: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	preview: FilePreviewSettings,

	#[serde(default)]
	dev: FileDevSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	max_frame_bytes: Option<u32>,
	event_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePreviewSettings {
	enabled: Option<bool>,
	timeout_ms: Option<u64>,
	max_redirects: Option<usize>,
	max_body_bytes: Option<usize>,
	user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDevSettings {
	#[serde(default)]
	seed_users: Vec<DevUser>,
	#[serde(default)]
	seed_rooms: Vec<DevRoom>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();
		let preview_defaults = PreviewSettings::default();

		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				max_frame_bytes: file.server.max_frame_bytes.unwrap_or(defaults.max_frame_bytes),
				event_queue_capacity: file.server.event_queue_capacity.unwrap_or(defaults.event_queue_capacity),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			preview: PreviewSettings {
				enabled: file.preview.enabled.unwrap_or(preview_defaults.enabled),
				timeout: file
					.preview
					.timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(preview_defaults.timeout),
				max_redirects: file.preview.max_redirects.unwrap_or(preview_defaults.max_redirects),
				max_body_bytes: file.preview.max_body_bytes.unwrap_or(preview_defaults.max_body_bytes),
				user_agent: file.preview.user_agent.filter(|s| !s.trim().is_empty()),
			},
			dev: DevSettings {
				seed_users: file.dev.seed_users,
				seed_rooms: file.dev.seed_rooms,
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("PARLEY_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.trim().parse::<u32>()
	{
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_EVENT_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.server.event_queue_capacity = capacity;
		info!(capacity, "server config: event_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_PREVIEW_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.preview.enabled = enabled;
		info!(enabled, "preview: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_PREVIEW_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.preview.timeout = Duration::from_millis(ms);
		info!(ms, "preview: timeout overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_file_applies_defaults_and_filters_blanks() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			auth_hmac_secret = "  "
			metrics_bind = "127.0.0.1:9300"

			[persistence]
			enabled = true
			database_url = "sqlite::memory:"

			[preview]
			timeout_ms = 1500
			"#,
		)
		.unwrap();

		let cfg = ServerConfig::from_file(file);
		assert!(cfg.server.auth_hmac_secret.is_none());
		assert_eq!(cfg.server.metrics_bind.as_deref(), Some("127.0.0.1:9300"));
		assert_eq!(cfg.server.max_frame_bytes, parley_protocol::DEFAULT_MAX_FRAME_SIZE as u32);
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite::memory:"));
		assert!(cfg.preview.enabled);
		assert_eq!(cfg.preview.timeout, Duration::from_millis(1500));
	}

	#[test]
	fn dev_seed_sections_parse() {
		let file: FileConfig = toml::from_str(
			r#"
			[[dev.seed_users]]
			id = "alice"
			email = "alice@example.com"
			display_name = "Alice"

			[[dev.seed_rooms]]
			id = "s-1"
			participants = ["alice"]
			"#,
		)
		.unwrap();

		let cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.dev.seed_users.len(), 1);
		assert_eq!(cfg.dev.seed_users[0].id, "alice");
		assert_eq!(cfg.dev.seed_rooms[0].participants, vec!["alice".to_string()]);
	}
}
