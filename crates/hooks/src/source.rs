//! Chart of a published extension version: fetched from `spec.chartURL`, or
//! read from the ConfigMap named by `spec.chartDataRef`.

use k8s_openapi::api::core::v1::ConfigMap;
use keel_chart::{LoadError, PackageDescriptor};
use keel_fetch::{ArtifactResolver, FetchError};
use keel_kubehub::{ChartDataRef, ClusterStore, ExtensionVersion, ObjectRef, ResourceKind, StoreError};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PackageSourceError {
    #[error("ExtensionVersion {0} not found")]
    VersionNotFound(String),
    #[error("ExtensionVersion {0} has neither chartURL nor chartDataRef")]
    NoChartSource(String),
    #[error("ConfigMap {namespace}/{name} has no binaryData key {key:?}")]
    MissingChartData { namespace: String, name: String, key: String },
    #[error("decoding ConfigMap {0}: {1}")]
    BadConfigMap(String, String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Load(#[from] LoadError),
}

pub async fn package_for_version(
    store: &dyn ClusterStore,
    resolver: &ArtifactResolver,
    extension: &str,
    version: &str,
) -> Result<PackageDescriptor, PackageSourceError> {
    let r = ExtensionVersion::object_ref(extension, version);
    let raw = store.get(&r).await?.ok_or_else(|| PackageSourceError::VersionNotFound(r.name.clone()))?;
    let ev = ExtensionVersion::from_raw(raw);
    let bytes = if let Some(url) = ev.chart_url() {
        debug!(extension, version, url, "chart from URL");
        resolver.resolve(url).await?
    } else if let Some(data_ref) = ev.chart_data_ref() {
        debug!(extension, version, configmap = %data_ref.name, key = %data_ref.key, "chart from ConfigMap");
        chart_from_config_map(store, &data_ref).await?
    } else {
        return Err(PackageSourceError::NoChartSource(r.name));
    };
    Ok(PackageDescriptor::load(&bytes, None)?)
}

async fn chart_from_config_map(store: &dyn ClusterStore, data_ref: &ChartDataRef) -> Result<Vec<u8>, PackageSourceError> {
    let r = ObjectRef::namespaced(ResourceKind::CONFIG_MAP, &data_ref.namespace, &data_ref.name);
    let raw = store.get(&r).await?.ok_or_else(|| StoreError::NotFound(r.to_string()))?;
    let cm: ConfigMap = serde_json::from_value(raw).map_err(|e| PackageSourceError::BadConfigMap(r.to_string(), e.to_string()))?;
    cm.binary_data
        .and_then(|mut data| data.remove(&data_ref.key))
        .map(|bytes| bytes.0)
        .ok_or_else(|| PackageSourceError::MissingChartData {
            namespace: data_ref.namespace.clone(),
            name: data_ref.name.clone(),
            key: data_ref.key.clone(),
        })
}
