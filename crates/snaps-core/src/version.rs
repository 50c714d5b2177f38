//! Version-range helpers for install and update requests.

use semver::{Version, VersionReq};

pub const DEFAULT_REQUESTED_VERSION: &str = "*";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("the requested version range `{range}` is invalid: {reason}")]
pub struct VersionRangeError {
    pub range: String,
    pub reason: String,
}

/// `None`, the empty string and `latest` all mean "any version".
pub fn resolve_version_range(requested: Option<&str>) -> Result<VersionReq, VersionRangeError> {
    let raw = requested.map(str::trim).unwrap_or(DEFAULT_REQUESTED_VERSION);
    let raw = match raw {
        "" | "latest" => DEFAULT_REQUESTED_VERSION,
        other => other,
    };
    VersionReq::parse(raw).map_err(|err| VersionRangeError {
        range: raw.to_string(),
        reason: err.to_string(),
    })
}

pub fn satisfies(version: &Version, range: &VersionReq) -> bool {
    range.matches(version)
}

/// An update target must be strictly newer and inside the requested range.
pub fn is_valid_update(installed: &Version, candidate: &Version, range: &VersionReq) -> bool {
    candidate > installed && satisfies(candidate, range)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(raw: &str) -> Version {
        Version::parse(raw).expect("version")
    }

    #[test]
    fn latest_and_missing_mean_any() {
        for input in [None, Some("latest"), Some(""), Some("*")] {
            let range = resolve_version_range(input).expect("range");
            assert!(satisfies(&v("0.0.1"), &range));
            assert!(satisfies(&v("99.1.0"), &range));
        }
    }

    #[test]
    fn caret_ranges_match_minor_bumps() {
        let range = resolve_version_range(Some("^1.0.0")).expect("range");
        assert!(satisfies(&v("1.2.0"), &range));
        assert!(!satisfies(&v("2.0.0"), &range));
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        let err = resolve_version_range(Some("not-a-range")).expect_err("invalid");
        assert_eq!(err.range, "not-a-range");
    }

    #[test]
    fn update_must_be_newer_and_in_range() {
        let range = resolve_version_range(Some("^1.0.0")).expect("range");
        assert!(is_valid_update(&v("1.0.0"), &v("1.1.0"), &range));
        assert!(!is_valid_update(&v("1.1.0"), &v("1.1.0"), &range));
        assert!(!is_valid_update(&v("1.1.0"), &v("1.0.5"), &range));
        assert!(!is_valid_update(&v("1.1.0"), &v("2.0.0"), &range));
    }
}
