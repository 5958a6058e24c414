#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;
use tandem_domain::ProtocolVersion;

/// Upstream protocol version report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
	pub version: ProtocolVersion,
	pub is_below_soft: bool,
	pub is_below_hard: bool,
	pub is_broken: bool,
}

/// How the compiled protocol version compares to upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStatus {
	Current,
	/// Running something newer than upstream advertises.
	Ahead,
	/// Behind, but upstream does not care yet.
	Outdated,
	SoftOutdated,
	HardOutdated,
	Broken,
}

impl VersionStatus {
	pub fn classify(current: ProtocolVersion, info: &UpdateInfo) -> Self {
		if current == info.version {
			VersionStatus::Current
		} else if current > info.version {
			VersionStatus::Ahead
		} else if info.is_broken {
			VersionStatus::Broken
		} else if info.is_below_hard {
			VersionStatus::HardOutdated
		} else if info.is_below_soft {
			VersionStatus::SoftOutdated
		} else {
			VersionStatus::Outdated
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			VersionStatus::Current => "current",
			VersionStatus::Ahead => "ahead",
			VersionStatus::Outdated => "outdated",
			VersionStatus::SoftOutdated => "soft_outdated",
			VersionStatus::HardOutdated => "hard_outdated",
			VersionStatus::Broken => "broken",
		}
	}
}

impl fmt::Display for VersionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Source of upstream protocol version information.
#[async_trait::async_trait]
pub trait UpdateChecker: Send + Sync + 'static {
	async fn check_update(&self, current: ProtocolVersion) -> anyhow::Result<UpdateInfo>;
}

pub const DEFAULT_UPDATE_CHECK_URL: &str = "https://web.whatsapp.com/check-update";

/// `UpdateChecker` backed by the upstream check-update endpoint.
#[derive(Debug, Clone)]
pub struct HttpUpdateChecker {
	client: reqwest::Client,
	url: url::Url,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckUpdateResponse {
	#[serde(default)]
	is_broken: bool,
	#[serde(default)]
	is_below_soft: bool,
	#[serde(default)]
	is_below_hard: bool,
	current_version: String,
}

impl HttpUpdateChecker {
	pub fn new(url: &str) -> anyhow::Result<Self> {
		let url = url::Url::parse(url).with_context(|| format!("parse update check url {url}"))?;
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(15))
			.build()
			.context("build http client")?;
		Ok(Self { client, url })
	}
}

#[async_trait::async_trait]
impl UpdateChecker for HttpUpdateChecker {
	async fn check_update(&self, current: ProtocolVersion) -> anyhow::Result<UpdateInfo> {
		let mut url = self.url.clone();
		url.query_pairs_mut()
			.append_pair("version", &current.to_string())
			.append_pair("platform", "web");

		let resp: CheckUpdateResponse = self
			.client
			.get(url)
			.send()
			.await
			.context("request check-update")?
			.error_for_status()
			.context("check-update status")?
			.json()
			.await
			.context("decode check-update response")?;

		let version = ProtocolVersion::parse(&resp.current_version)
			.with_context(|| format!("parse upstream version {}", resp.current_version))?;

		Ok(UpdateInfo {
			version,
			is_below_soft: resp.is_below_soft,
			is_below_hard: resp.is_below_hard,
			is_broken: resp.is_broken,
		})
	}
}
