//! Disk image vocabulary and the boundary to the external image utility.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::volume::ParseValueError;

/// On-disk image format, as spelled by the image utility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Qcow2,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// qcow2 compatibility level (on-disk format revision).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Qcow2Compat {
    #[serde(rename = "0.10")]
    V0_10,
    #[serde(rename = "1.1")]
    V1_1,
}

impl Qcow2Compat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Qcow2Compat::V0_10 => "0.10",
            Qcow2Compat::V1_1 => "1.1",
        }
    }
}

impl fmt::Display for Qcow2Compat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Qcow2Compat {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0.10" => Ok(Qcow2Compat::V0_10),
            "1.1" => Ok(Qcow2Compat::V1_1),
            _ => Err(ParseValueError {
                what: "qcow2 compat level",
                value: s.to_string(),
            }),
        }
    }
}

/// Attributes that may be changed in place on a qcow2 image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qcow2Attributes {
    pub compat: Qcow2Compat,
}

/// Format parameters reported by inspecting an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub virtual_size: u64,
    /// Only present for qcow2 images.
    pub compat: Option<Qcow2Compat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preallocation {
    Off,
    Metadata,
    Falloc,
    Full,
}

impl Preallocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Preallocation::Off => "off",
            Preallocation::Metadata => "metadata",
            Preallocation::Falloc => "falloc",
            Preallocation::Full => "full",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertOptions {
    pub src_format: ImageFormat,
    pub dst_format: ImageFormat,
    /// Compat level of the destination, qcow2 destinations only.
    pub dst_compat: Option<Qcow2Compat>,
    pub preallocation: Option<Preallocation>,
}

#[derive(Debug, Error)]
pub enum ImageToolError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} failed with exit code {exit_code:?}: {stderr}")]
    Failed {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("unexpected image tool output: {0}")]
    Parse(String),
}

/// External image utility, e.g. `qemu-img`.
///
/// Implementations only run the tool and interpret its result. They neither
/// take locks nor touch volume metadata.
#[async_trait]
pub trait ImageTool: Send + Sync + fmt::Debug + 'static {
    /// Inspect an image and report its format parameters.
    async fn info(&self, path: &Path) -> Result<ImageInfo, ImageToolError>;

    /// Change attributes of a qcow2 image in place.
    async fn amend(&self, path: &Path, attrs: &Qcow2Attributes) -> Result<(), ImageToolError>;

    /// Copy (and possibly convert) image data from `src` into `dst`.
    async fn convert(
        &self,
        src: &Path,
        dst: &Path,
        options: &ConvertOptions,
    ) -> Result<(), ImageToolError>;
}
