//! Per-node config files and the shared node registry file.
use std::{io::ErrorKind, path::Path};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::{BridgeError, Result},
    node::{NodeRecord, record_name},
    privileged::PrivilegedWriter,
};

/// One `write_config_files` request.
#[derive(Debug, Clone, Copy)]
pub struct ConfigWrite<'a> {
    pub worker_config_path: &'a Path,
    pub worker_config: &'a str,
    pub descriptor_path: &'a Path,
    pub descriptor: &'a str,
    pub registry_path: &'a Path,
    /// JSON array of node records to merge into the registry file.
    pub entries: &'a str,
}

/// Serializes read-merge-write cycles on the registry file.
#[derive(Debug, Default)]
pub struct ConfigStore {
    registry_guard: Mutex<()>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write both per-node files, then merge `entries` into the registry.
    /// Returns the number of records now in the registry.
    ///
    /// The new entries are validated before anything touches the disk. A
    /// failing step stops the sequence; files already written stay written.
    pub async fn write_node_configs(
        &self,
        request: &ConfigWrite<'_>,
        writer: &dyn PrivilegedWriter,
    ) -> Result<usize> {
        let incoming = parse_entries(request.entries)?;

        writer
            .write(request.worker_config_path, request.worker_config.as_bytes())
            .await?;
        writer
            .write(request.descriptor_path, request.descriptor.as_bytes())
            .await?;

        let _guard = self.registry_guard.lock().await;
        let mut records = read_registry(request.registry_path).await?;
        merge(&mut records, incoming);
        let rendered = serde_json::to_string_pretty(&records)?;
        writer
            .write(request.registry_path, rendered.as_bytes())
            .await?;
        info!(
            registry = %request.registry_path.display(),
            records = records.len(),
            "node registry updated"
        );
        Ok(records.len())
    }

    pub async fn load(&self, path: &Path) -> Result<Vec<NodeRecord>> {
        let _guard = self.registry_guard.lock().await;
        read_registry(path).await
    }

    pub async fn remove_registry(&self, path: &Path, writer: &dyn PrivilegedWriter) -> Result<()> {
        let _guard = self.registry_guard.lock().await;
        writer.remove(path).await
    }
}

/// Entries must be a JSON array of objects. They are not checked further.
pub fn parse_entries(raw: &str) -> Result<Vec<NodeRecord>> {
    serde_json::from_str(raw)
        .map_err(|e| BridgeError::InvalidRegistry(format!("invalid node entries: {e}")))
}

/// Missing or blank file reads as an empty registry. Anything that is not a
/// JSON array is refused rather than overwritten.
async fn read_registry(path: &Path) -> Result<Vec<NodeRecord>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no node registry yet");
            return Ok(Vec::new());
        }
        Err(e) => return Err(BridgeError::read(path, e)),
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Value>(&raw)? {
        value @ Value::Array(_) => Ok(serde_json::from_value(value)?),
        _ => Err(BridgeError::InvalidRegistry(format!(
            "{} is not a JSON array",
            path.display()
        ))),
    }
}

/// Append `incoming` in order; a record whose name is already present
/// replaces the existing one in place. Unnamed records are always appended.
/// Records are never rewritten field by field.
pub fn merge(records: &mut Vec<NodeRecord>, incoming: Vec<NodeRecord>) {
    for entry in incoming {
        let slot = record_name(&entry)
            .and_then(|name| records.iter_mut().find(|r| record_name(r) == Some(name)));
        match slot {
            Some(existing) => *existing = entry,
            None => records.push(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privileged::DirectWriter;
    use serde_json::json;
    use std::path::PathBuf;

    fn node(name: &str, country: &str) -> NodeRecord {
        match json!({
            "name": name,
            "serviceName": format!("xray-node-{country}"),
            "configPath": format!("/etc/xray-vpn-node-{country}.json"),
            "enabled": true,
            "countryCode": country.to_uppercase(),
        }) {
            Value::Object(record) => record,
            _ => unreachable!(),
        }
    }

    struct Paths {
        _dir: tempfile::TempDir,
        worker: PathBuf,
        descriptor: PathBuf,
        registry: PathBuf,
    }

    fn paths() -> Paths {
        let dir = tempfile::tempdir().unwrap();
        Paths {
            worker: dir.path().join("etc/xray-vpn-node-jp.json"),
            descriptor: dir.path().join("units/xray-node-jp.service"),
            registry: dir.path().join("etc/vpn_nodes.json"),
            _dir: dir,
        }
    }

    fn request<'a>(p: &'a Paths, entries: &'a str) -> ConfigWrite<'a> {
        ConfigWrite {
            worker_config_path: &p.worker,
            worker_config: r#"{"inbounds":[]}"#,
            descriptor_path: &p.descriptor,
            descriptor: "[Unit]\nDescription=jp\n",
            registry_path: &p.registry,
            entries,
        }
    }

    #[test]
    fn merge_replaces_by_name_and_appends_the_rest() {
        let mut records = vec![node("Tokyo", "jp"), node("Toronto", "ca")];
        let mut updated = node("Tokyo", "jp");
        updated.insert("enabled".into(), json!(false));
        merge(&mut records, vec![updated, node("Dallas", "us")]);

        let names: Vec<_> = records.iter().filter_map(record_name).collect();
        assert_eq!(names, ["Tokyo", "Toronto", "Dallas"]);
        assert_eq!(records[0]["enabled"], json!(false));
    }

    #[tokio::test]
    async fn registry_grows_two_plus_one() {
        let p = paths();
        std::fs::create_dir_all(p.registry.parent().unwrap()).unwrap();
        std::fs::write(
            &p.registry,
            serde_json::to_string_pretty(&vec![node("Tokyo", "jp"), node("Toronto", "ca")]).unwrap(),
        )
        .unwrap();

        let entries = serde_json::to_string(&vec![node("Dallas", "us")]).unwrap();
        let store = ConfigStore::new();
        let count = store
            .write_node_configs(&request(&p, &entries), &DirectWriter)
            .await
            .unwrap();
        assert_eq!(count, 3);

        let written = std::fs::read_to_string(&p.registry).unwrap();
        assert!(written.contains("\n  {\n    \"name\""), "2-space pretty output:\n{written}");
        let records = store.load(&p.registry).await.unwrap();
        assert_eq!(records[2]["name"], "Dallas");
        assert_eq!(std::fs::read_to_string(&p.worker).unwrap(), r#"{"inbounds":[]}"#);
        assert!(p.descriptor.is_file());
    }

    #[tokio::test]
    async fn resubmitting_a_node_does_not_duplicate_it() {
        let p = paths();
        let entries = serde_json::to_string(&vec![node("Tokyo", "jp")]).unwrap();
        let store = ConfigStore::new();
        store.write_node_configs(&request(&p, &entries), &DirectWriter).await.unwrap();
        let count = store.write_node_configs(&request(&p, &entries), &DirectWriter).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn invalid_entries_touch_nothing() {
        let p = paths();
        let err = ConfigStore::new()
            .write_node_configs(&request(&p, "{not json"), &DirectWriter)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("invalid node registry content: invalid node entries"));
        assert!(!p.worker.exists());
        assert!(!p.registry.exists());
    }

    #[tokio::test]
    async fn blank_registry_counts_as_empty() {
        let p = paths();
        std::fs::create_dir_all(p.registry.parent().unwrap()).unwrap();
        std::fs::write(&p.registry, "  \n").unwrap();
        let entries = serde_json::to_string(&vec![node("Tokyo", "jp")]).unwrap();
        let count = ConfigStore::new()
            .write_node_configs(&request(&p, &entries), &DirectWriter)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn non_array_registry_is_not_clobbered() {
        let p = paths();
        std::fs::create_dir_all(p.registry.parent().unwrap()).unwrap();
        std::fs::write(&p.registry, r#"{"nodes":[]}"#).unwrap();
        let entries = serde_json::to_string(&vec![node("Tokyo", "jp")]).unwrap();

        let err = ConfigStore::new()
            .write_node_configs(&request(&p, &entries), &DirectWriter)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRegistry(_)));
        assert_eq!(std::fs::read_to_string(&p.registry).unwrap(), r#"{"nodes":[]}"#);
    }

    #[tokio::test]
    async fn existing_records_are_kept_verbatim() {
        let p = paths();
        std::fs::create_dir_all(p.registry.parent().unwrap()).unwrap();
        let existing = json!([{"name": "legacy"}, {"name": "nullcc", "countryCode": null}]);
        std::fs::write(&p.registry, existing.to_string()).unwrap();

        let entries = json!([{"name": "Dallas", "protocol": "vless"}]).to_string();
        let count = ConfigStore::new()
            .write_node_configs(&request(&p, &entries), &DirectWriter)
            .await
            .unwrap();
        assert_eq!(count, 3);

        let written: Value = serde_json::from_str(&std::fs::read_to_string(&p.registry).unwrap()).unwrap();
        assert_eq!(
            written,
            json!([
                {"name": "legacy"},
                {"name": "nullcc", "countryCode": null},
                {"name": "Dallas", "protocol": "vless"}
            ])
        );
    }

    #[tokio::test]
    async fn entries_that_are_not_objects_are_refused() {
        let p = paths();
        let err = ConfigStore::new()
            .write_node_configs(&request(&p, r#"["Tokyo"]"#), &DirectWriter)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRegistry(_)));
        assert!(!p.worker.exists());
    }
}
