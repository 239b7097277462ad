//! Bundle identity and deployment descriptor.

use crate::actions::ValidationError;
use std::fmt;
use url::Url;

/// Longest accepted bundle id.
const MAX_ID_LEN: usize = 100;

/// Names inside the bundle store that an id must never shadow.
const RESERVED_IDS: &[&str] = &["active"];

/// Fleet-safe bundle name: ASCII letters, digits and single interior dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleId(String);

impl BundleId {
    /// Validate `raw` against the safe-name format.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidBundleId`] for empty, oversized,
    /// reserved, dot-leading or dot-trailing names, `..` sequences, and any
    /// character outside `[A-Za-z0-9.]`.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidBundleId(raw.to_owned());
        let ok = !raw.is_empty()
            && raw.len() <= MAX_ID_LEN
            && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
            && !raw.starts_with('.')
            && !raw.ends_with('.')
            && !raw.contains("..")
            && !RESERVED_IDS.contains(&raw);
        if ok { Ok(Self(raw.to_owned())) } else { Err(invalid()) }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What `bundle.apply` deploys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleDescriptor {
    pub bundle_id: BundleId,
    pub source_url: Url,
    /// Lowercase SHA-256 hex digest, if supplied.
    pub checksum: Option<String>,
}

impl BundleDescriptor {
    /// Validate the raw `bundle.apply` arguments.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] naming the offending argument.
    pub fn parse(bundle_id: &str, source_url: &str, checksum: Option<&str>) -> Result<Self, ValidationError> {
        let bundle_id = BundleId::parse(bundle_id)?;
        let source_url = Url::parse(source_url)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .ok_or_else(|| ValidationError::MalformedArgument {
                action: "bundle.apply",
                arg: "url".to_owned(),
                expected: "http(s) URL".to_owned(),
            })?;
        let checksum = match checksum {
            None => None,
            Some(raw) => Some(normalize_checksum(raw).ok_or_else(|| {
                ValidationError::MalformedArgument {
                    action: "bundle.apply",
                    arg: "checksum".to_owned(),
                    expected: "64 hex chars, optionally prefixed sha256:".to_owned(),
                }
            })?),
        };
        Ok(Self {
            bundle_id,
            source_url,
            checksum,
        })
    }
}

/// Lowercase a SHA-256 hex digest, accepting an optional `sha256:` prefix.
#[must_use]
pub fn normalize_checksum(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let hex = raw
        .get(..7)
        .filter(|p| p.eq_ignore_ascii_case("sha256:"))
        .map_or(raw, |_| &raw[7..]);
    (hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit())).then(|| hex.to_ascii_lowercase())
}
