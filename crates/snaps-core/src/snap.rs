use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::permissions::PermissionSet;

const NPM_PREFIX: &str = "npm:";
const LOCAL_PREFIX: &str = "local:";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SnapIdError {
    #[error("invalid snap id `{0}`: expected an `npm:` or `local:` prefix")]
    UnknownPrefix(String),
    #[error("invalid snap id `{0}`: name is empty")]
    EmptyName(String),
}

/// Stable module identity, e.g. `npm:@acme/snap` or `local:http://localhost:8080`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapId(String);

impl SnapId {
    pub fn parse(raw: &str) -> Result<Self, SnapIdError> {
        let name = raw
            .strip_prefix(NPM_PREFIX)
            .or_else(|| raw.strip_prefix(LOCAL_PREFIX))
            .ok_or_else(|| SnapIdError::UnknownPrefix(raw.to_string()))?;
        if name.trim().is_empty() {
            return Err(SnapIdError::EmptyName(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_PREFIX)
    }

    /// The id without its location prefix.
    pub fn name(&self) -> &str {
        self.0
            .strip_prefix(NPM_PREFIX)
            .or_else(|| self.0.strip_prefix(LOCAL_PREFIX))
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for SnapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SnapId {
    type Err = SnapIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SnapId {
    type Error = SnapIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SnapId> for String {
    fn from(value: SnapId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapStatus {
    Installing,
    Updating,
    Running,
    Stopped,
    Crashed,
}

impl SnapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapStatus::Installing => "installing",
            SnapStatus::Updating => "updating",
            SnapStatus::Running => "running",
            SnapStatus::Stopped => "stopped",
            SnapStatus::Crashed => "crashed",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            SnapStatus::Installing => "Installing",
            SnapStatus::Updating => "Updating",
            SnapStatus::Running => "Running",
            SnapStatus::Stopped => "Stopped",
            SnapStatus::Crashed => "Crashed",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug.trim().to_ascii_lowercase().as_str() {
            "installing" => Some(SnapStatus::Installing),
            "updating" => Some(SnapStatus::Updating),
            "running" => Some(SnapStatus::Running),
            "stopped" => Some(SnapStatus::Stopped),
            "crashed" => Some(SnapStatus::Crashed),
            _ => None,
        }
    }
}

impl fmt::Display for SnapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusEvent {
    Start,
    Stop,
    Crash,
    Update,
}

impl StatusEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusEvent::Start => "start",
            StatusEvent::Stop => "stop",
            StatusEvent::Crash => "crash",
            StatusEvent::Update => "update",
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSource {
    pub shasum: String,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapManifest {
    pub version: Version,
    pub proposed_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source: ManifestSource,
    #[serde(default)]
    pub initial_permissions: PermissionSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockReason {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionHistoryEntry {
    pub version: Version,
    pub origin: String,
    pub date: DateTime<Utc>,
}

/// Persisted module record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snap {
    pub id: SnapId,
    pub version: Version,
    pub manifest: SnapManifest,
    pub enabled: bool,
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_information: Option<BlockReason>,
    pub status: SnapStatus,
    #[serde(default)]
    pub version_history: Vec<VersionHistoryEntry>,
    pub source_code: String,
    #[serde(default)]
    pub initial_permissions: PermissionSet,
}

impl Snap {
    /// A freshly added record: enabled, unblocked and `Installing`.
    pub fn new(id: SnapId, manifest: SnapManifest, source_code: String, origin: &str) -> Self {
        let version = manifest.version.clone();
        Self {
            id,
            version: version.clone(),
            initial_permissions: manifest.initial_permissions.clone(),
            manifest,
            enabled: true,
            blocked: false,
            block_information: None,
            status: SnapStatus::Installing,
            version_history: vec![VersionHistoryEntry {
                version,
                origin: origin.to_string(),
                date: Utc::now(),
            }],
            source_code,
        }
    }

    /// Replace the manifest and code with a newer release, appending to the version history.
    /// Status, enablement and block state are left untouched.
    pub fn apply_release(&mut self, manifest: SnapManifest, source_code: String, origin: &str) {
        self.version = manifest.version.clone();
        self.initial_permissions = manifest.initial_permissions.clone();
        self.version_history.push(VersionHistoryEntry {
            version: manifest.version.clone(),
            origin: origin.to_string(),
            date: Utc::now(),
        });
        self.manifest = manifest;
        self.source_code = source_code;
    }

    pub fn block(&mut self, reason: Option<BlockReason>) {
        self.blocked = true;
        self.enabled = false;
        self.block_information = reason;
    }

    pub fn unblock(&mut self) {
        self.blocked = false;
        self.block_information = None;
    }

    /// Returns `false` and leaves the record disabled when it is blocked.
    pub fn enable(&mut self) -> bool {
        if self.blocked {
            return false;
        }
        self.enabled = true;
        true
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn summary(&self) -> SnapSummary {
        SnapSummary {
            id: self.id.clone(),
            version: self.version.clone(),
            enabled: self.enabled,
            blocked: self.blocked,
            status: self.status,
            initial_permissions: self.initial_permissions.clone(),
        }
    }
}

/// What callers get back from install/update and `get_summary`: the record minus its code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapSummary {
    pub id: SnapId,
    pub version: Version,
    pub enabled: bool,
    pub blocked: bool,
    pub status: SnapStatus,
    pub initial_permissions: PermissionSet,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(version: &str) -> SnapManifest {
        SnapManifest {
            version: Version::parse(version).expect("version"),
            proposed_name: "Example".into(),
            description: None,
            source: ManifestSource {
                shasum: "abc".into(),
                file_path: "dist/bundle.js".into(),
            },
            initial_permissions: [("endowment:rpc".to_string(), json!({}))]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn snap_id_requires_known_prefix() {
        assert!(SnapId::parse("npm:example").is_ok());
        let local = SnapId::parse("local:http://localhost:8080").expect("local id");
        assert!(local.is_local());
        assert_eq!(local.name(), "http://localhost:8080");
        assert!(matches!(
            SnapId::parse("example"),
            Err(SnapIdError::UnknownPrefix(_))
        ));
        assert!(matches!(
            SnapId::parse("npm: "),
            Err(SnapIdError::EmptyName(_))
        ));
    }

    #[test]
    fn snap_id_deserialization_validates() {
        let ok: SnapId = serde_json::from_value(json!("npm:a")).expect("id");
        assert_eq!(ok.as_str(), "npm:a");
        assert!(serde_json::from_value::<SnapId>(json!("bogus")).is_err());
    }

    #[test]
    fn status_slugs_round_trip() {
        for status in [
            SnapStatus::Installing,
            SnapStatus::Updating,
            SnapStatus::Running,
            SnapStatus::Stopped,
            SnapStatus::Crashed,
        ] {
            assert_eq!(SnapStatus::from_slug(status.as_str()), Some(status));
            assert_eq!(
                serde_json::to_value(status).expect("ser"),
                json!(status.as_str())
            );
        }
        assert_eq!(SnapStatus::from_slug(" Running "), Some(SnapStatus::Running));
        assert_eq!(SnapStatus::from_slug("paused"), None);
    }

    #[test]
    fn blocking_forces_disabled_and_enable_refuses() {
        let id = SnapId::parse("npm:a").expect("id");
        let mut snap = Snap::new(id, manifest("1.0.0"), "code".into(), "origin");
        assert!(snap.enabled);
        snap.block(Some(BlockReason {
            explanation: Some("malware".into()),
            info_url: None,
        }));
        assert!(snap.blocked && !snap.enabled);
        assert!(!snap.enable());
        assert!(!snap.enabled);
        snap.unblock();
        assert!(snap.block_information.is_none());
        assert!(snap.enable());
    }

    #[test]
    fn apply_release_appends_history() {
        let id = SnapId::parse("npm:a").expect("id");
        let mut snap = Snap::new(id, manifest("1.0.0"), "v1".into(), "origin");
        snap.status = SnapStatus::Stopped;
        snap.apply_release(manifest("1.1.0"), "v2".into(), "other");
        assert_eq!(snap.version, Version::new(1, 1, 0));
        assert_eq!(snap.source_code, "v2");
        assert_eq!(snap.status, SnapStatus::Stopped);
        let versions: Vec<_> = snap
            .version_history
            .iter()
            .map(|h| h.version.to_string())
            .collect();
        assert_eq!(versions, vec!["1.0.0", "1.1.0"]);
        assert_eq!(snap.version_history[1].origin, "other");
    }

    #[test]
    fn record_serializes_camel_case() {
        let id = SnapId::parse("npm:a").expect("id");
        let snap = Snap::new(id, manifest("1.0.0"), "code".into(), "origin");
        let value = serde_json::to_value(&snap).expect("ser");
        assert_eq!(value["sourceCode"], json!("code"));
        assert_eq!(value["status"], json!("installing"));
        assert!(value.get("blockInformation").is_none());
        let back: Snap = serde_json::from_value(value).expect("de");
        assert_eq!(back, snap);
    }
}
