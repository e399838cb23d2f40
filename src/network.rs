//! Network backup/restore (spec.md §6 "Network-backup format"), grounded
//! on `original_source/network_manager.py`'s `backup_network`/
//! `restore_network`: a single JSON file per network rather than a tar, and
//! the same five reserved default network names refused on both sides.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::docker::{DockerTransport, is_reserved_network};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    #[serde(flatten)]
    pub inspect: Value,
    pub server_name: String,
}

/// Writes `network_<name>_<YYYYMMDD_HHMMSS>.json` under `output_dir`,
/// refusing any of the five default networks.
pub async fn backup_network(
    transport: &dyn DockerTransport,
    network_name: &str,
    output_dir: &Path,
    server_name: &str,
) -> CoreResult<PathBuf> {
    if is_reserved_network(network_name) {
        return Err(CoreError::Other(format!(
            "cannot back up default network \"{network_name}\""
        )));
    }

    let inspect = transport.inspect_network(network_name).await?;
    let snapshot = NetworkSnapshot {
        inspect,
        server_name: server_name.to_string(),
    };

    let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let filename = format!("network_{network_name}_{timestamp}.json");
    let path = output_dir.join(&filename);
    tokio::fs::write(&path, serde_json::to_vec_pretty(&snapshot)?).await?;
    Ok(path)
}

/// Restores a network from a previously written snapshot file, deriving a
/// subnet/gateway the same way the Restore Engine does for a container's
/// referenced networks (spec.md §4.5 step 7), falling back to an
/// auto-assigned subnet on failure.
pub async fn restore_network(transport: &dyn DockerTransport, snapshot_path: &Path) -> CoreResult<String> {
    let content = tokio::fs::read_to_string(snapshot_path).await?;
    let snapshot: NetworkSnapshot = serde_json::from_str(&content)
        .map_err(|e| CoreError::MalformedBackup(format!("invalid network snapshot: {e}")))?;

    let name = snapshot
        .inspect
        .get("Name")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::MalformedBackup("network snapshot has no Name".into()))?
        .to_string();

    if is_reserved_network(&name) {
        return Err(CoreError::Other(format!(
            "cannot restore default network \"{name}\""
        )));
    }

    if transport.network_exists(&name).await? {
        return Err(CoreError::NameConflict(name));
    }

    let (subnet, gateway) = extract_subnet_gateway(&snapshot.inspect);
    if transport
        .create_network(&name, subnet.as_deref(), gateway.as_deref())
        .await
        .is_err()
    {
        transport.create_network(&name, None, None).await?;
    }

    Ok(name)
}

fn extract_subnet_gateway(inspect: &Value) -> (Option<String>, Option<String>) {
    let config = inspect
        .get("IPAM")
        .and_then(|i| i.get("Config"))
        .and_then(Value::as_array)
        .and_then(|arr| arr.first());

    let Some(config) = config else {
        return (None, None);
    };
    let subnet = config.get("Subnet").and_then(Value::as_str).map(str::to_string);
    let gateway = config.get("Gateway").and_then(Value::as_str).map(str::to_string);
    (subnet, gateway)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::MockDockerTransport;
    use serde_json::json;

    #[tokio::test]
    async fn refuses_to_back_up_default_network() {
        let mock = MockDockerTransport::new();
        let tmp = tempfile::tempdir().unwrap();
        let result = backup_network(&mock, "bridge", tmp.path(), "host-1").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn backup_writes_timestamped_snapshot_file() {
        let mut mock = MockDockerTransport::new();
        mock.expect_inspect_network()
            .returning(|_| Ok(json!({"Name": "app-net", "Driver": "bridge"})));
        let tmp = tempfile::tempdir().unwrap();
        let path = backup_network(&mock, "app-net", tmp.path(), "host-1")
            .await
            .unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("network_app-net_"));
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("\"server_name\": \"host-1\""));
    }

    #[test]
    fn extracts_subnet_and_gateway_from_ipam_config() {
        let inspect = json!({
            "IPAM": {"Config": [{"Subnet": "172.20.0.0/16", "Gateway": "172.20.0.1"}]}
        });
        let (subnet, gateway) = extract_subnet_gateway(&inspect);
        assert_eq!(subnet.as_deref(), Some("172.20.0.0/16"));
        assert_eq!(gateway.as_deref(), Some("172.20.0.1"));
    }

    #[tokio::test]
    async fn restore_rejects_existing_network_as_name_conflict() {
        let mut mock = MockDockerTransport::new();
        mock.expect_network_exists().returning(|_| Ok(true));

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("network_app-net_20240101_000000.json");
        tokio::fs::write(
            &path,
            serde_json::to_vec(&NetworkSnapshot {
                inspect: json!({"Name": "app-net"}),
                server_name: "host-1".into(),
            })
            .unwrap(),
        )
        .await
        .unwrap();

        let result = restore_network(&mock, &path).await;
        assert!(matches!(result, Err(CoreError::NameConflict(_))));
    }
}
