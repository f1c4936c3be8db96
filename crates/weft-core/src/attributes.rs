//! Channel attributes and package paths.
//!
//! Every channel subtree in a snapshot carries an `.attributes` JSON blob
//! describing how to rebuild it:
//!
//! ```text
//! { "pkg": "[\"Comp\",\"Sub\"]", "snapshotFormatVersion": "0.1",
//!   "type": "Sub", "sequenceNumber": 12, "minimumSequenceNumber": 9 }
//! ```
//!
//! The oldest format stored `pkg` as a bare identifier and had no version.
//! [`ChannelAttributes::parse`] normalizes both forms to the current one.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Name of the attributes blob inside a channel subtree.
pub const ATTRIBUTES_BLOB: &str = ".attributes";

/// Snapshot format written by this crate, and assumed when none is stored.
pub const SNAPSHOT_FORMAT_VERSION: &str = "0.1";

/// Errors reading or building channel attributes.
#[derive(Error, Debug)]
pub enum AttributesError {
    #[error("package path is empty")]
    EmptyPackagePath,

    #[error("malformed package value: {0}")]
    MalformedPackage(String),

    #[error("unsupported snapshot format version: {0}")]
    UnsupportedVersion(String),

    #[error("invalid attributes blob: {0}")]
    Json(#[from] serde_json::Error),
}

/// Ordered, non-empty list of type identifiers.
///
/// All but the last element name nested registries; the last one names the
/// channel type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct PackagePath(Vec<String>);

impl PackagePath {
    pub fn new<I, S>(segments: I) -> Result<Self, AttributesError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(AttributesError::EmptyPackagePath);
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// The channel type, i.e. the last segment.
    pub fn channel_type(&self) -> &str {
        // Non-empty by construction.
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// JSON-encoded form stored in `pkg`.
    pub fn to_pkg(&self) -> Result<String, AttributesError> {
        Ok(serde_json::to_string(&self.0)?)
    }

    /// Parse a JSON-encoded `pkg` value.
    pub fn from_pkg(pkg: &str) -> Result<Self, AttributesError> {
        let segments: Vec<String> = serde_json::from_str(pkg)
            .map_err(|_| AttributesError::MalformedPackage(pkg.to_string()))?;
        Self::new(segments)
    }
}

impl TryFrom<Vec<String>> for PackagePath {
    type Error = AttributesError;

    fn try_from(segments: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(segments)
    }
}

impl From<PackagePath> for Vec<String> {
    fn from(path: PackagePath) -> Self {
        path.0
    }
}

impl From<&str> for PackagePath {
    fn from(channel_type: &str) -> Self {
        Self(vec![channel_type.to_string()])
    }
}

impl From<String> for PackagePath {
    fn from(channel_type: String) -> Self {
        Self(vec![channel_type])
    }
}

impl fmt::Display for PackagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Contents of the `.attributes` blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAttributes {
    pub pkg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_format_version: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub channel_type: Option<String>,
    /// Channel-local sequence number at snapshot time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    /// Channel-local minimum sequence number at snapshot time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_sequence_number: Option<u64>,
    /// Document sequence number `sequenceNumber` corresponds to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_sequence_number: Option<u64>,
}

impl ChannelAttributes {
    /// Attributes in the current format for `package`.
    pub fn new(package: &PackagePath) -> Result<Self, AttributesError> {
        Ok(Self {
            pkg: package.to_pkg()?,
            snapshot_format_version: Some(SNAPSHOT_FORMAT_VERSION.to_string()),
            channel_type: Some(package.channel_type().to_string()),
            sequence_number: None,
            minimum_sequence_number: None,
            document_sequence_number: None,
        })
    }

    pub fn with_sequence_numbers(mut self, sequence_number: u64, minimum: u64) -> Self {
        self.sequence_number = Some(sequence_number);
        self.minimum_sequence_number = Some(minimum);
        self
    }

    /// Record the document sequence number the local numbers were taken at.
    pub fn at_document_sequence_number(mut self, document: u64) -> Self {
        self.document_sequence_number = Some(document);
        self
    }

    /// Parse a stored blob and normalize it to the current format.
    pub fn parse(bytes: &[u8]) -> Result<Self, AttributesError> {
        let raw: ChannelAttributes = serde_json::from_slice(bytes)?;
        raw.normalize()
    }

    /// Rewrite the oldest format (bare `pkg`, no version) into the current one.
    pub fn normalize(mut self) -> Result<Self, AttributesError> {
        match self.snapshot_format_version.as_deref() {
            None => {
                self.pkg = PackagePath::new([self.pkg.clone()])?.to_pkg()?;
                self.snapshot_format_version = Some(SNAPSHOT_FORMAT_VERSION.to_string());
            }
            Some(SNAPSHOT_FORMAT_VERSION) => {}
            Some(other) => return Err(AttributesError::UnsupportedVersion(other.to_string())),
        }
        let package = self.package()?;
        if self.channel_type.is_none() {
            self.channel_type = Some(package.channel_type().to_string());
        }
        Ok(self)
    }

    /// The package path stored in `pkg`. Expects the current format.
    pub fn package(&self) -> Result<PackagePath, AttributesError> {
        PackagePath::from_pkg(&self.pkg)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AttributesError> {
        Ok(serde_json::to_vec(self)?)
    }
}
