use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identity of a single volume: the storage domain it lives on, the image
/// (group of volumes) it belongs to, and the volume itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeKey {
    pub storage_domain_id: Uuid,
    pub image_id: Uuid,
    pub volume_id: Uuid,
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.storage_domain_id, self.image_id, self.volume_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeFormat {
    Raw,
    /// qcow2 copy-on-write volume. Only these support attribute amendment.
    Cow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Legality {
    Legal,
    /// The volume is being mutated, or was left corrupted by a failed
    /// mutation. Consumers (e.g. VM start) must not use it.
    Illegal,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid value {value:?} for {what}")]
pub struct ParseValueError {
    pub what: &'static str,
    pub value: String,
}

impl VolumeFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeFormat::Raw => "RAW",
            VolumeFormat::Cow => "COW",
        }
    }
}

impl FromStr for VolumeFormat {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RAW" => Ok(VolumeFormat::Raw),
            "COW" => Ok(VolumeFormat::Cow),
            _ => Err(ParseValueError {
                what: "volume format",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for VolumeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Legality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Legality::Legal => "LEGAL",
            Legality::Illegal => "ILLEGAL",
        }
    }
}

impl FromStr for Legality {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LEGAL" => Ok(Legality::Legal),
            "ILLEGAL" => Ok(Legality::Illegal),
            _ => Err(ParseValueError {
                what: "legality",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Legality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted volume metadata fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKey {
    Format,
    Legality,
    Generation,
    Capacity,
    Description,
    Ctime,
}

impl MetaKey {
    /// Key name as written to the metadata file.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetaKey::Format => "FORMAT",
            MetaKey::Legality => "LEGALITY",
            MetaKey::Generation => "GENERATION",
            MetaKey::Capacity => "CAP",
            MetaKey::Description => "DESCRIPTION",
            MetaKey::Ctime => "CTIME",
        }
    }
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const METADATA_END: &str = "EOF";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetadataParseError {
    #[error("line {line}: expected KEY=VALUE, got {content:?}")]
    MalformedLine { line: usize, content: String },
    #[error("missing EOF terminator")]
    MissingTerminator,
}

/// Ordered `KEY=VALUE` metadata block, terminated by an `EOF` line.
///
/// Keys this crate doesn't know about are kept in place, so that rewriting a
/// block never drops fields written by other tools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self, MetadataParseError> {
        let mut entries = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line == METADATA_END {
                return Ok(Metadata { entries });
            }
            if line.is_empty() {
                continue;
            }
            let (key, value) =
                line.split_once('=')
                    .ok_or_else(|| MetadataParseError::MalformedLine {
                        line: idx + 1,
                        content: line.to_string(),
                    })?;
            entries.push((key.to_string(), value.to_string()));
        }
        Err(MetadataParseError::MissingTerminator)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out.push_str(METADATA_END);
        out.push('\n');
        out
    }
}
