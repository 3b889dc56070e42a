//! Pipeline package unpacking
//!
//! A source may serve a single compiled pipeline YAML or a zip archive of
//! them. Archives are unpacked in memory; only `.yaml`/`.yml` entries with a
//! relative path that stays inside the archive are kept.

use std::io::{Cursor, Read};
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::pipeline::PipelinePackage;

fn is_yaml(name: &str) -> bool {
    name.ends_with(".yaml") || name.ends_with(".yml")
}

fn is_zip(package: &PipelinePackage) -> bool {
    package.file_name.ends_with(".zip")
}

/// Entry names that start at the root or climb out of the archive are skipped
fn is_safe_entry(name: &str) -> bool {
    !name.starts_with('/') && !name.starts_with('\\') && !name.contains("..")
}

/// Split a package into the pipeline files it contains
///
/// Non-archive packages are returned unchanged. The unpacked size of an
/// archive is capped at `max_size`.
pub fn pipeline_files(
    package: PipelinePackage,
    max_size: u64,
) -> Result<Vec<PipelinePackage>, SourceError> {
    if !is_zip(&package) {
        return Ok(vec![package]);
    }

    let invalid = |message: String| SourceError::InvalidArchive {
        file: package.file_name.clone(),
        message,
    };
    let mut archive =
        zip::ZipArchive::new(Cursor::new(&package.content)).map_err(|e| invalid(e.to_string()))?;

    let mut files = Vec::new();
    let mut unpacked = 0u64;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| invalid(e.to_string()))?;
        let name = entry.name().to_string();
        if entry.is_dir() || !is_yaml(&name) {
            continue;
        }
        if !is_safe_entry(&name) || entry.enclosed_name().is_none() {
            warn!(file = %package.file_name, entry = %name, "skipping unsafe archive entry");
            continue;
        }

        unpacked = unpacked.saturating_add(entry.size());
        if unpacked > max_size {
            return Err(invalid(format!("unpacked size exceeds {max_size} bytes")));
        }
        let mut content = Vec::with_capacity(entry.size() as usize);
        entry
            .by_ref()
            .take(max_size)
            .read_to_end(&mut content)
            .map_err(|e| invalid(e.to_string()))?;

        debug!(file = %package.file_name, entry = %name, "unpacked pipeline file");
        files.push(PipelinePackage {
            file_name: file_name(&name),
            content,
        });
    }
    Ok(files)
}

fn file_name(entry: &str) -> String {
    Path::new(entry)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(entry)
        .to_string()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompiledPipeline {
    pipeline_info: PipelineInfo,
}

#[derive(Deserialize)]
struct PipelineInfo {
    name: String,
}

/// Pipeline name for an uploaded file
///
/// Read from `pipelineInfo.name` of the first YAML document. Falls back to
/// the file name without its extension.
pub fn pipeline_name(package: &PipelinePackage) -> String {
    let parsed = serde_yaml::Deserializer::from_slice(&package.content)
        .next()
        .map(CompiledPipeline::deserialize);
    match parsed {
        Some(Ok(compiled)) if !compiled.pipeline_info.name.trim().is_empty() => {
            compiled.pipeline_info.name
        }
        other => {
            let fallback = package
                .file_name
                .trim_end_matches(".yaml")
                .trim_end_matches(".yml")
                .to_string();
            let error = match other {
                Some(Err(e)) => e.to_string(),
                _ => "pipelineInfo.name missing".to_string(),
            };
            warn!(file = %package.file_name, %fallback, %error, "could not read pipeline name");
            fallback
        }
    }
}
