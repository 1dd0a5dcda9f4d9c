//! Gzipped tar chart archives.
//!
//! Layout: every entry lives below one base directory (`<chart>/`), which
//! holds `Chart.yaml`, optional `values.yaml`, CRDs under `crds/` and bundled
//! sub-packages under `charts/`, either unpacked (`charts/<dir>/...`) or as
//! nested archives (`charts/*.tgz`).

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use keel_core::parse_yaml;

use crate::{Dependency, LoadError, PackageDescriptor, SchemaManifest};

const MAX_NESTING: usize = 8;

fn max_entry_bytes() -> u64 {
    std::env::var("KEEL_MAX_CHART_ENTRY_BYTES")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(20 * 1024 * 1024) // 20 MiB default
}

fn max_entries() -> usize {
    std::env::var("KEEL_MAX_CHART_ENTRIES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(10_000)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    app_version: Option<String>,
    #[serde(default)]
    dependencies: Vec<Dependency>,
}

/// Files of one chart, keyed by path relative to the chart base directory.
type Files = BTreeMap<String, Vec<u8>>;

pub(crate) fn read(bytes: &[u8]) -> Result<PackageDescriptor, LoadError> { read_nested(bytes, 0) }

fn read_nested(bytes: &[u8], depth: usize) -> Result<PackageDescriptor, LoadError> {
    if depth > MAX_NESTING {
        return Err(LoadError::malformed("sub-packages nested too deeply"));
    }
    if bytes.len() < 2 || bytes[..2] != [0x1f, 0x8b] {
        return Err(LoadError::malformed("not a gzip archive"));
    }
    let files = unpack(bytes)?;
    build(files, depth)
}

fn unpack(bytes: &[u8]) -> Result<Files, LoadError> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let entries = archive.entries().map_err(|e| LoadError::malformed(format!("bad archive: {}", e)))?;
    let (max_bytes, max_count) = (max_entry_bytes(), max_entries());
    let mut base: Option<String> = None;
    let mut files = Files::new();
    for entry in entries {
        let mut entry = entry.map_err(|e| LoadError::malformed(format!("bad archive entry: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        if files.len() >= max_count {
            return Err(LoadError::malformed(format!("archive has more than {} files", max_count)));
        }
        if entry.size() > max_bytes {
            return Err(LoadError::malformed(format!("archive entry too large ({} bytes, max {})", entry.size(), max_bytes)));
        }
        let path = entry.path().map_err(|e| LoadError::malformed(format!("bad entry path: {}", e)))?.into_owned();
        let mut parts = normal_components(&path)?;
        if parts.len() < 2 {
            return Err(LoadError::malformed(format!("{} is outside the chart base directory", path.display())));
        }
        let top = parts.remove(0);
        match &base {
            None => base = Some(top),
            Some(b) if *b != top => {
                return Err(LoadError::malformed(format!("{} is outside the chart base directory {}", path.display(), b)));
            }
            Some(_) => {}
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .by_ref()
            .take(max_bytes)
            .read_to_end(&mut data)
            .map_err(|e| LoadError::malformed(format!("reading {}: {}", path.display(), e)))?;
        files.insert(parts.join("/"), data);
    }
    Ok(files)
}

fn normal_components(path: &Path) -> Result<Vec<String>, LoadError> {
    let mut out = Vec::new();
    for c in path.components() {
        match c {
            Component::Normal(s) => out.push(s.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(LoadError::malformed(format!("illegal path in archive: {}", path.display()))),
        }
    }
    Ok(out)
}

fn build(mut files: Files, depth: usize) -> Result<PackageDescriptor, LoadError> {
    let chart_yaml = files.remove("Chart.yaml").ok_or_else(|| LoadError::malformed("missing Chart.yaml"))?;
    let meta: ChartMeta = serde_yaml::from_slice(&chart_yaml).map_err(|e| LoadError::malformed(format!("Chart.yaml: {}", e)))?;
    if meta.name.trim().is_empty() {
        return Err(LoadError::malformed("Chart.yaml: missing name"));
    }

    let defaults = match files.remove("values.yaml") {
        Some(raw) => parse_yaml(&utf8("values.yaml", raw)?).map_err(|e| LoadError::malformed(format!("values.yaml: {}", e)))?,
        None => Value::Object(Map::new()),
    };

    let mut schemas = Vec::new();
    let mut nested_dirs: BTreeMap<String, Files> = BTreeMap::new();
    let mut subpackages = Vec::new();
    for (path, data) in files {
        if let Some(rest) = path.strip_prefix("crds/") {
            if is_manifest(rest) {
                schemas.push(SchemaManifest { data: utf8(&path, data)?, path });
            }
        } else if let Some(rest) = path.strip_prefix("charts/") {
            match rest.split_once('/') {
                Some((dir, inner)) => {
                    nested_dirs.entry(dir.to_string()).or_default().insert(inner.to_string(), data);
                }
                None if rest.ends_with(".tgz") || rest.ends_with(".tar.gz") => {
                    debug!(archive = %path, "loading embedded sub-package");
                    subpackages.push(read_nested(&data, depth + 1)?);
                }
                None => debug!(path = %path, "ignoring non-archive file under charts/"),
            }
        }
    }
    for (dir, inner) in nested_dirs {
        if depth + 1 > MAX_NESTING {
            return Err(LoadError::malformed("sub-packages nested too deeply"));
        }
        let sub = build(inner, depth + 1).map_err(|LoadError::Malformed(reason)| LoadError::malformed(format!("charts/{}: {}", dir, reason)))?;
        subpackages.push(sub);
    }

    Ok(PackageDescriptor {
        name: meta.name,
        version: meta.version,
        app_version: meta.app_version,
        dependencies: meta.dependencies,
        schemas,
        defaults,
        subpackages,
    })
}

fn is_manifest(name: &str) -> bool { [".yaml", ".yml", ".json"].iter().any(|ext| name.ends_with(ext)) }

fn utf8(path: &str, data: Vec<u8>) -> Result<String, LoadError> {
    String::from_utf8(data).map_err(|_| LoadError::malformed(format!("{} is not valid UTF-8", path)))
}

/// Build a gzipped tar from `(path, contents)` pairs, e.g. chart fixtures.
pub fn pack<P, D>(files: &[(P, D)]) -> io::Result<Vec<u8>>
where
    P: AsRef<str>,
    D: AsRef<[u8]>,
{
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let data = data.as_ref();
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path.as_ref(), data)?;
    }
    let tar_bytes = builder.into_inner()?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes)?;
    encoder.finish()
}
