//! [`ImageTool`] implementation running the `qemu-img` utility.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{event, instrument, Level};

use sdm_rs::image::{
    ConvertOptions, ImageFormat, ImageInfo, ImageTool, ImageToolError, Qcow2Attributes,
};
use sdm_rs::volume::ParseValueError;

use crate::config::QemuImgConfig;

// Subset of `qemu-img info --output=json`. Example (abridged):
//
// {
//     "virtual-size": 1073741824,
//     "filename": "/path/to/volume",
//     "format": "qcow2",
//     "format-specific": {
//         "type": "qcow2",
//         "data": { "compat": "1.1", "lazy-refcounts": false }
//     }
// }
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
struct QemuImgInfo {
    format: String,
    virtual_size: u64,
    format_specific: Option<QemuImgFormatSpecific>,
}

#[derive(Deserialize, Debug, Clone)]
struct QemuImgFormatSpecific {
    data: QemuImgFormatSpecificData,
}

#[derive(Deserialize, Debug, Clone)]
struct QemuImgFormatSpecificData {
    compat: Option<String>,
}

fn parse_info(output: &[u8]) -> Result<ImageInfo, ImageToolError> {
    let info: QemuImgInfo = serde_json::from_slice(output).map_err(|e| {
        ImageToolError::Parse(format!(
            "cannot parse `qemu-img info` output {:?}: {e}",
            String::from_utf8_lossy(output)
        ))
    })?;

    let format = match info.format.as_str() {
        "raw" => ImageFormat::Raw,
        "qcow2" => ImageFormat::Qcow2,
        other => {
            return Err(ImageToolError::Parse(format!(
                "unsupported image format {other:?}"
            )))
        }
    };

    let compat = match (format, info.format_specific) {
        (ImageFormat::Qcow2, Some(specific)) => match specific.data.compat {
            Some(compat) => Some(
                compat
                    .parse()
                    .map_err(|e: ParseValueError| ImageToolError::Parse(e.to_string()))?,
            ),
            None => None,
        },
        _ => None,
    };

    Ok(ImageInfo {
        format,
        virtual_size: info.virtual_size,
        compat,
    })
}

fn info_args(path: &Path) -> Vec<OsString> {
    vec![
        "info".into(),
        "--output=json".into(),
        "--".into(),
        path.into(),
    ]
}

fn amend_args(path: &Path, attrs: &Qcow2Attributes) -> Vec<OsString> {
    vec![
        "amend".into(),
        "-f".into(),
        "qcow2".into(),
        "-o".into(),
        format!("compat={}", attrs.compat).into(),
        path.into(),
    ]
}

fn convert_args(src: &Path, dst: &Path, options: &ConvertOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "convert".into(),
        "-p".into(),
        // Bypass the host page cache, both for reading and writing:
        "-t".into(),
        "none".into(),
        "-T".into(),
        "none".into(),
        "-f".into(),
        options.src_format.as_str().into(),
        "-O".into(),
        options.dst_format.as_str().into(),
    ];

    let mut create_opts = Vec::new();
    if options.dst_format == ImageFormat::Qcow2 {
        if let Some(compat) = options.dst_compat {
            create_opts.push(format!("compat={compat}"));
        }
    }
    if let Some(preallocation) = options.preallocation {
        create_opts.push(format!("preallocation={}", preallocation.as_str()));
    }
    if !create_opts.is_empty() {
        args.push("-o".into());
        args.push(create_opts.join(",").into());
    }

    args.push(src.into());
    args.push(dst.into());
    args
}

#[derive(Debug, Clone)]
pub struct QemuImg {
    binary: PathBuf,
}

impl QemuImg {
    pub fn new(config: &QemuImgConfig) -> Self {
        QemuImg {
            binary: config.binary.clone(),
        }
    }

    /// Run `qemu-img` with `args`, returning its stdout on a zero exit code.
    async fn run(&self, args: Vec<OsString>) -> Result<Vec<u8>, ImageToolError> {
        let command = format!(
            "{} {}",
            self.binary.display(),
            args.first()
                .map(|a| a.to_string_lossy().into_owned())
                .unwrap_or_default()
        );

        event!(Level::DEBUG, binary = ?self.binary, ?args, "Running qemu-img");
        let output = tokio::process::Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|source| ImageToolError::Spawn {
                command: command.clone(),
                source,
            })?;

        // Ideally we'd want to use the nightly `exit_ok()` here:
        if !output.status.success() {
            return Err(ImageToolError::Failed {
                command,
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl ImageTool for QemuImg {
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    async fn info(&self, path: &Path) -> Result<ImageInfo, ImageToolError> {
        let stdout = self.run(info_args(path)).await?;
        parse_info(&stdout)
    }

    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    async fn amend(&self, path: &Path, attrs: &Qcow2Attributes) -> Result<(), ImageToolError> {
        self.run(amend_args(path, attrs)).await?;
        Ok(())
    }

    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    async fn convert(
        &self,
        src: &Path,
        dst: &Path,
        options: &ConvertOptions,
    ) -> Result<(), ImageToolError> {
        // Progress output on stdout is not interesting once we're done:
        self.run(convert_args(src, dst, options)).await?;
        Ok(())
    }
}
