#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("invalid version: {0}")]
	InvalidVersion(String),
}

/// Remote network address namespace (the part after `@`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Server {
	/// Standard contacts. The only namespace puppets may live in.
	User,
	Group,
	Broadcast,
	Newsletter,
	HiddenUser,
	Other(String),
}

impl Server {
	pub const USER: &'static str = "s.whatsapp.net";
	pub const GROUP: &'static str = "g.us";
	pub const BROADCAST: &'static str = "broadcast";
	pub const NEWSLETTER: &'static str = "newsletter";
	pub const HIDDEN_USER: &'static str = "lid";

	pub fn as_str(&self) -> &str {
		match self {
			Server::User => Self::USER,
			Server::Group => Self::GROUP,
			Server::Broadcast => Self::BROADCAST,
			Server::Newsletter => Self::NEWSLETTER,
			Server::HiddenUser => Self::HIDDEN_USER,
			Server::Other(s) => s,
		}
	}

	fn from_raw(s: &str) -> Self {
		match s {
			Self::USER => Server::User,
			Self::GROUP => Server::Group,
			Self::BROADCAST => Server::Broadcast,
			Self::NEWSLETTER => Server::Newsletter,
			Self::HIDDEN_USER => Server::HiddenUser,
			other => Server::Other(other.to_string()),
		}
	}
}

impl fmt::Display for Server {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Remote network address: `user[.agent][:device]@server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteId {
	pub user: String,
	pub agent: u8,
	pub device: u16,
	pub server: Server,
}

impl RemoteId {
	/// Construct a device-less id.
	pub fn new(user: impl Into<String>, server: Server) -> Self {
		Self {
			user: user.into(),
			agent: 0,
			device: 0,
			server,
		}
	}

	/// Shorthand for a standard contact id.
	pub fn user(user: impl Into<String>) -> Self {
		Self::new(user, Server::User)
	}

	/// Parse `user[.agent][:device]@server`.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (local, server) = s
			.split_once('@')
			.ok_or_else(|| ParseIdError::InvalidFormat(format!("expected user@server: {s}")))?;
		if local.is_empty() || server.is_empty() {
			return Err(ParseIdError::InvalidFormat(format!("expected user@server: {s}")));
		}

		let (user_agent, device) = match local.split_once(':') {
			Some((ua, d)) => {
				let device = d
					.parse::<u16>()
					.map_err(|_| ParseIdError::InvalidFormat(format!("invalid device: {s}")))?;
				(ua, device)
			}
			None => (local, 0),
		};

		let (user, agent) = match user_agent.split_once('.') {
			Some((u, a)) => {
				let agent = a
					.parse::<u8>()
					.map_err(|_| ParseIdError::InvalidFormat(format!("invalid agent: {s}")))?;
				(u, agent)
			}
			None => (user_agent, 0),
		};

		if user.is_empty() {
			return Err(ParseIdError::InvalidFormat(format!("empty user part: {s}")));
		}

		Ok(Self {
			user: user.to_string(),
			agent,
			device,
			server: Server::from_raw(server),
		})
	}

	/// Strip agent and device.
	pub fn to_non_ad(&self) -> Self {
		Self::new(self.user.clone(), self.server.clone())
	}

	/// Whether this id addresses a standard contact.
	pub fn is_standard_user(&self) -> bool {
		self.server == Server::User
	}

	/// Whether the chat is group-like (shared by every participant).
	pub fn is_shared_chat(&self) -> bool {
		matches!(self.server, Server::Group | Server::Broadcast | Server::Newsletter)
	}
}

impl fmt::Display for RemoteId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.user)?;
		if self.agent != 0 {
			write!(f, ".{}", self.agent)?;
		}
		if self.device != 0 {
			write!(f, ":{}", self.device)?;
		}
		write!(f, "@{}", self.server)
	}
}

impl FromStr for RemoteId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RemoteId::parse(s)
	}
}

impl TryFrom<String> for RemoteId {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		RemoteId::parse(&value)
	}
}

impl From<RemoteId> for String {
	fn from(value: RemoteId) -> Self {
		value.to_string()
	}
}

/// Local network account id: `@localpart:server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LocalUserId(String);

impl LocalUserId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		let rest = trimmed
			.strip_prefix('@')
			.ok_or_else(|| ParseIdError::InvalidFormat(format!("expected @localpart:server: {trimmed}")))?;
		match rest.split_once(':') {
			Some((local, server)) if !local.is_empty() && !server.is_empty() => Ok(Self(trimmed.to_string())),
			_ => Err(ParseIdError::InvalidFormat(format!("expected @localpart:server: {trimmed}"))),
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn localpart(&self) -> &str {
		self.0[1..].split_once(':').map(|(l, _)| l).unwrap_or_default()
	}

	pub fn server(&self) -> &str {
		self.0[1..].split_once(':').map(|(_, s)| s).unwrap_or_default()
	}
}

impl fmt::Display for LocalUserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for LocalUserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		LocalUserId::new(s)
	}
}

impl TryFrom<String> for LocalUserId {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		LocalUserId::new(value)
	}
}

impl From<LocalUserId> for String {
	fn from(value: LocalUserId) -> Self {
		value.0
	}
}

/// Local network room id: `!opaque:server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LocalRoomId(String);

impl LocalRoomId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if !trimmed.starts_with('!') || !trimmed.contains(':') {
			return Err(ParseIdError::InvalidFormat(format!("expected !opaque:server: {trimmed}")));
		}
		Ok(Self(trimmed.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for LocalRoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl TryFrom<String> for LocalRoomId {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		LocalRoomId::new(value)
	}
}

impl From<LocalRoomId> for String {
	fn from(value: LocalRoomId) -> Self {
		value.0
	}
}

/// Unique conversation key: `(chat, receiver)`.
///
/// Shared chats are keyed by the chat alone, so their receiver is the chat id.
/// Direct chats are keyed per bridged account, with the receiver set to that
/// account's remote id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortalKey {
	pub chat: RemoteId,
	pub receiver: RemoteId,
}

impl PortalKey {
	pub fn new(chat: RemoteId, receiver: RemoteId) -> Self {
		let chat = chat.to_non_ad();
		let receiver = if chat.is_shared_chat() {
			chat.clone()
		} else {
			receiver.to_non_ad()
		};
		Self { chat, receiver }
	}
}

impl fmt::Display for PortalKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.chat == self.receiver {
			write!(f, "{}", self.chat)
		} else {
			write!(f, "{}-{}", self.chat, self.receiver)
		}
	}
}

/// Device platform advertised to the remote network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePlatform {
	Unknown,
	Chrome,
	Firefox,
	Ie,
	Opera,
	Safari,
	Edge,
	Desktop,
	Ipad,
	AndroidTablet,
	Ohana,
	Aloha,
	Catalina,
	TclTv,
}

impl DevicePlatform {
	const TABLE: &'static [(&'static str, DevicePlatform)] = &[
		("UNKNOWN", DevicePlatform::Unknown),
		("CHROME", DevicePlatform::Chrome),
		("FIREFOX", DevicePlatform::Firefox),
		("IE", DevicePlatform::Ie),
		("OPERA", DevicePlatform::Opera),
		("SAFARI", DevicePlatform::Safari),
		("EDGE", DevicePlatform::Edge),
		("DESKTOP", DevicePlatform::Desktop),
		("IPAD", DevicePlatform::Ipad),
		("ANDROID_TABLET", DevicePlatform::AndroidTablet),
		("OHANA", DevicePlatform::Ohana),
		("ALOHA", DevicePlatform::Aloha),
		("CATALINA", DevicePlatform::Catalina),
		("TCL_TV", DevicePlatform::TclTv),
	];

	/// Wire code of this platform.
	pub fn code(self) -> u8 {
		Self::TABLE
			.iter()
			.position(|(_, p)| *p == self)
			.map(|idx| idx as u8)
			.unwrap_or(0)
	}

	/// Case-insensitive lookup; unknown names map to `Unknown`.
	pub fn lookup(name: &str) -> Self {
		let upper = name.trim().to_ascii_uppercase();
		Self::TABLE
			.iter()
			.find(|(n, _)| *n == upper)
			.map(|(_, p)| *p)
			.unwrap_or(DevicePlatform::Unknown)
	}
}

/// Remote protocol version `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion {
	pub major: u32,
	pub minor: u32,
	pub patch: u32,
}

impl ProtocolVersion {
	pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
		Self { major, minor, patch }
	}

	/// Parse a version, ignoring any `-pre` or `+build` suffix.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let core = s.split(['-', '+']).next().unwrap_or_default();
		let mut parts = core.split('.');
		let mut next = || -> Result<u32, ParseIdError> {
			parts
				.next()
				.ok_or_else(|| ParseIdError::InvalidVersion(s.to_string()))?
				.parse::<u32>()
				.map_err(|_| ParseIdError::InvalidVersion(s.to_string()))
		};

		let major = next()?;
		let minor = next()?;
		let patch = next()?;
		Ok(Self { major, minor, patch })
	}
}

impl fmt::Display for ProtocolVersion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
	}
}

impl FromStr for ProtocolVersion {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ProtocolVersion::parse(s)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn remote_id_parse_and_display() {
		let id = RemoteId::parse("4915123456789@s.whatsapp.net").unwrap();
		assert_eq!(id.user, "4915123456789");
		assert_eq!(id.server, Server::User);
		assert!(id.is_standard_user());
		assert_eq!(id.to_string(), "4915123456789@s.whatsapp.net");

		let dev = RemoteId::parse("123.1:7@s.whatsapp.net").unwrap();
		assert_eq!(dev.agent, 1);
		assert_eq!(dev.device, 7);
		assert_eq!(dev.to_string(), "123.1:7@s.whatsapp.net");
		assert_eq!(dev.to_non_ad(), RemoteId::user("123"));
	}

	#[test]
	fn remote_id_rejects_garbage() {
		assert!(RemoteId::parse("").is_err());
		assert!(RemoteId::parse("no-server").is_err());
		assert!(RemoteId::parse("@s.whatsapp.net").is_err());
		assert!(RemoteId::parse("1:x@s.whatsapp.net").is_err());
	}

	#[test]
	fn broadcast_ids_are_not_standard_users() {
		let id = RemoteId::parse("status@broadcast").unwrap();
		assert_eq!(id.server, Server::Broadcast);
		assert!(!id.is_standard_user());

		let other = RemoteId::parse("x@example.org").unwrap();
		assert_eq!(other.server, Server::Other("example.org".to_string()));
	}

	#[test]
	fn remote_id_serde_as_string() {
		let id = RemoteId::user("42");
		let json = serde_json::to_string(&id).unwrap();
		assert_eq!(json, "\"42@s.whatsapp.net\"");
		let back: RemoteId = serde_json::from_str(&json).unwrap();
		assert_eq!(back, id);
	}

	#[test]
	fn local_ids_validate_shape() {
		let u = LocalUserId::new("@alice:example.org").unwrap();
		assert_eq!(u.localpart(), "alice");
		assert_eq!(u.server(), "example.org");
		assert!(LocalUserId::new("alice:example.org").is_err());
		assert!(LocalUserId::new("@alice").is_err());
		assert!(LocalUserId::new("  ").is_err());

		assert!(LocalRoomId::new("!abc:example.org").is_ok());
		assert!(LocalRoomId::new("#abc:example.org").is_err());
	}

	#[test]
	fn portal_key_normalizes_shared_chats() {
		let group = RemoteId::parse("1203630@g.us").unwrap();
		let me = RemoteId::parse("111:3@s.whatsapp.net").unwrap();
		let key = PortalKey::new(group.clone(), me.clone());
		assert_eq!(key.receiver, group);

		let contact = RemoteId::user("222");
		let dm = PortalKey::new(contact.clone(), me);
		assert_eq!(dm.chat, contact);
		assert_eq!(dm.receiver, RemoteId::user("111"));
		assert_eq!(dm.to_string(), "222@s.whatsapp.net-111@s.whatsapp.net");
	}

	#[test]
	fn device_platform_lookup_is_case_insensitive() {
		assert_eq!(DevicePlatform::lookup("chrome"), DevicePlatform::Chrome);
		assert_eq!(DevicePlatform::lookup("Android_Tablet"), DevicePlatform::AndroidTablet);
		assert_eq!(DevicePlatform::lookup("netscape"), DevicePlatform::Unknown);
		assert_eq!(DevicePlatform::Chrome.code(), 1);
	}

	#[test]
	fn protocol_version_drops_suffixes() {
		let v = ProtocolVersion::parse("2.3000.1015901307-mod-1+dirty").unwrap();
		assert_eq!(v, ProtocolVersion::new(2, 3000, 1015901307));
		assert_eq!(v.to_string(), "2.3000.1015901307");
		assert!(ProtocolVersion::parse("2.3000").is_err());
		assert!(ProtocolVersion::new(2, 3000, 1) < ProtocolVersion::new(2, 3001, 0));
	}
}
