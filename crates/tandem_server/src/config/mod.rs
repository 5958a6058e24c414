#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tandem_domain::DevicePlatform;
use tandem_platform::{DeviceProps, ReconnectPolicy};
use tandem_platform::update::DEFAULT_UPDATE_CHECK_URL;
use tracing::{info, warn};

/// Default config path: `~/.tandem/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".tandem").join("config.toml"))
}

/// Load the bridge config from TOML and env overrides.
pub fn load_bridge_config_from_path(path: &Path) -> anyhow::Result<BridgeConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = BridgeConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);
	cfg.remote.reconnect = normalize_reconnect(cfg.remote.reconnect);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
	pub server: ServerSettings,
	pub database: DatabaseSettings,
	pub limits: LimitSettings,
	pub remote: RemoteSettings,
	pub supervisor: SupervisorSettings,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Health/metrics/status HTTP bind address (host:port).
	pub http_bind: Option<String>,
	/// Install the Prometheus recorder and serve `/metrics`.
	pub metrics_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
	/// Database URL (sqlite: or postgres:).
	pub url: String,
	pub max_connections: u32,
}

impl Default for DatabaseSettings {
	fn default() -> Self {
		Self {
			url: "sqlite:tandem.db?mode=rwc".to_string(),
			max_connections: 5,
		}
	}
}

/// Activity-based admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitSettings {
	/// Activity span a puppet must exceed before it counts.
	pub min_puppet_active: Duration,
	/// Silence after which a puppet stops counting.
	pub puppet_inactivity: Duration,
	pub max_puppet_limit: u32,
	/// Refuse new logins once the active count exceeds the limit.
	pub block_on_limit_reached: bool,
}

const DAY: u64 = 24 * 60 * 60;

impl Default for LimitSettings {
	fn default() -> Self {
		Self {
			min_puppet_active: Duration::from_secs(3 * DAY),
			puppet_inactivity: Duration::from_secs(30 * DAY),
			max_puppet_limit: 0,
			block_on_limit_reached: false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
	/// Device name shown on the primary device's linked-devices list.
	pub os_name: String,
	pub browser_name: String,
	pub reconnect: ReconnectPolicy,
	pub update_check_url: String,
}

impl RemoteSettings {
	pub fn device_platform(&self) -> DevicePlatform {
		DevicePlatform::lookup(&self.browser_name)
	}

	pub fn device(&self) -> DeviceProps {
		DeviceProps {
			os_name: self.os_name.clone(),
			platform: self.device_platform(),
		}
	}
}

impl Default for RemoteSettings {
	fn default() -> Self {
		Self {
			os_name: "Tandem bridge".to_string(),
			browser_name: "unknown".to_string(),
			reconnect: ReconnectPolicy::default(),
			update_check_url: DEFAULT_UPDATE_CHECK_URL.to_string(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
	pub interval: Duration,
	/// Grace period before a silent phone triggers a warning.
	pub phone_offline_warning: Duration,
	/// Silence after which the phone is pinged.
	pub phone_ping_interval: Duration,
}

impl Default for SupervisorSettings {
	fn default() -> Self {
		Self {
			interval: Duration::from_secs(60 * 60),
			phone_offline_warning: Duration::from_secs(12 * 60 * 60),
			phone_ping_interval: Duration::from_secs(24 * 60 * 60),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	database: FileDatabaseSettings,

	#[serde(default)]
	limits: FileLimitSettings,

	#[serde(default)]
	remote: FileRemoteSettings,

	#[serde(default)]
	supervisor: FileSupervisorSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	http_bind: Option<String>,
	metrics_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDatabaseSettings {
	url: Option<String>,
	max_connections: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLimitSettings {
	min_puppet_active_days: Option<u64>,
	puppet_inactivity_days: Option<u64>,
	max_puppet_limit: Option<u32>,
	block_on_limit_reached: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRemoteSettings {
	os_name: Option<String>,
	browser_name: Option<String>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
	reconnect_max_attempts: Option<u32>,
	update_check_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSupervisorSettings {
	interval_secs: Option<u64>,
	phone_offline_warning_hours: Option<u64>,
	phone_ping_interval_hours: Option<u64>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl BridgeConfig {
	fn from_file(file: FileConfig) -> Self {
		let db_default = DatabaseSettings::default();
		let limits_default = LimitSettings::default();
		let remote_default = RemoteSettings::default();
		let sup_default = SupervisorSettings::default();

		let reconnect = ReconnectPolicy {
			min_delay: file
				.remote
				.reconnect_min_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(remote_default.reconnect.min_delay),
			max_delay: file
				.remote
				.reconnect_max_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(remote_default.reconnect.max_delay),
			max_attempts: file
				.remote
				.reconnect_max_attempts
				.unwrap_or(remote_default.reconnect.max_attempts),
		};

		Self {
			server: ServerSettings {
				http_bind: non_empty(file.server.http_bind),
				metrics_enabled: file.server.metrics_enabled.unwrap_or(true),
			},
			database: DatabaseSettings {
				url: non_empty(file.database.url).unwrap_or(db_default.url),
				max_connections: file
					.database
					.max_connections
					.filter(|n| *n > 0)
					.unwrap_or(db_default.max_connections),
			},
			limits: LimitSettings {
				min_puppet_active: file
					.limits
					.min_puppet_active_days
					.map(|d| Duration::from_secs(d * DAY))
					.unwrap_or(limits_default.min_puppet_active),
				puppet_inactivity: file
					.limits
					.puppet_inactivity_days
					.map(|d| Duration::from_secs(d * DAY))
					.unwrap_or(limits_default.puppet_inactivity),
				max_puppet_limit: file.limits.max_puppet_limit.unwrap_or(limits_default.max_puppet_limit),
				block_on_limit_reached: file
					.limits
					.block_on_limit_reached
					.unwrap_or(limits_default.block_on_limit_reached),
			},
			remote: RemoteSettings {
				os_name: non_empty(file.remote.os_name).unwrap_or(remote_default.os_name),
				browser_name: non_empty(file.remote.browser_name).unwrap_or(remote_default.browser_name),
				reconnect,
				update_check_url: non_empty(file.remote.update_check_url).unwrap_or(remote_default.update_check_url),
			},
			supervisor: SupervisorSettings {
				interval: file
					.supervisor
					.interval_secs
					.filter(|s| *s > 0)
					.map(Duration::from_secs)
					.unwrap_or(sup_default.interval),
				phone_offline_warning: file
					.supervisor
					.phone_offline_warning_hours
					.map(|h| Duration::from_secs(h * 60 * 60))
					.unwrap_or(sup_default.phone_offline_warning),
				phone_ping_interval: file
					.supervisor
					.phone_ping_interval_hours
					.map(|h| Duration::from_secs(h * 60 * 60))
					.unwrap_or(sup_default.phone_ping_interval),
			},
		}
	}
}

fn normalize_reconnect(mut policy: ReconnectPolicy) -> ReconnectPolicy {
	if policy.min_delay > policy.max_delay {
		warn!(
			min_ms = policy.min_delay.as_millis() as u64,
			max_ms = policy.max_delay.as_millis() as u64,
			"remote config: reconnect min delay exceeds max; swapping"
		);
		std::mem::swap(&mut policy.min_delay, &mut policy.max_delay);
	}
	policy
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
		Ok(s) => Ok(Some(parse_toml(&s)?)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(cfg: &mut BridgeConfig) {
	if let Ok(v) = std::env::var("TANDEM_HTTP_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.http_bind = Some(v);
			info!("server config: http_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TANDEM_METRICS_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.server.metrics_enabled = enabled;
		info!(enabled, "server config: metrics_enabled overridden by env");
	}

	if let Ok(v) = std::env::var("TANDEM_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.database.url = v;
			info!("database config: url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TANDEM_DATABASE_MAX_CONNECTIONS")
		&& let Ok(max) = v.trim().parse::<u32>()
		&& max > 0
	{
		cfg.database.max_connections = max;
		info!(max, "database config: max_connections overridden by env");
	}

	if let Ok(v) = std::env::var("TANDEM_MAX_PUPPET_LIMIT")
		&& let Ok(limit) = v.trim().parse::<u32>()
	{
		cfg.limits.max_puppet_limit = limit;
		info!(limit, "limits config: max_puppet_limit overridden by env");
	}

	if let Ok(v) = std::env::var("TANDEM_BLOCK_ON_LIMIT_REACHED")
		&& let Some(block) = parse_env_bool(&v)
	{
		cfg.limits.block_on_limit_reached = block;
		info!(block, "limits config: block_on_limit_reached overridden by env");
	}

	if let Ok(v) = std::env::var("TANDEM_RECONNECT_MIN_DELAY_MS")
		&& let Ok(min_ms) = v.trim().parse::<u64>()
	{
		cfg.remote.reconnect.min_delay = Duration::from_millis(min_ms);
		info!(min_ms, "remote config: reconnect_min_delay overridden by env");
	}

	if let Ok(v) = std::env::var("TANDEM_RECONNECT_MAX_DELAY_MS")
		&& let Ok(max_ms) = v.trim().parse::<u64>()
	{
		cfg.remote.reconnect.max_delay = Duration::from_millis(max_ms);
		info!(max_ms, "remote config: reconnect_max_delay overridden by env");
	}

	if let Ok(v) = std::env::var("TANDEM_RECONNECT_MAX_ATTEMPTS")
		&& let Ok(attempts) = v.trim().parse::<u32>()
	{
		cfg.remote.reconnect.max_attempts = attempts;
		info!(attempts, "remote config: reconnect_max_attempts overridden by env");
	}

	if let Ok(v) = std::env::var("TANDEM_UPDATE_CHECK_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.remote.update_check_url = v;
			info!("remote config: update_check_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TANDEM_SUPERVISOR_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.supervisor.interval = Duration::from_secs(secs);
		info!(secs, "supervisor config: interval overridden by env");
	}
}
