//! Defensive accessors over a raw Docker inspect document.
//!
//! The inspect document is effectively untyped JSON (spec.md §9 "Dynamic
//! inspect shape"): mounts, labels, and network entries are all optional in
//! practice even where the Docker API schema calls them required. Rather
//! than modeling this with a `bollard::models::ContainerInspectResponse`
//! (which panics-by-absence in all the ways §9 warns against when a field
//! the local daemon's version doesn't populate is accessed), we keep the
//! document as `serde_json::Value` and look everything up through these
//! helpers, all of which return `None`/empty rather than erroring.

use serde_json::Value;

/// A raw inspect document, stored and round-tripped as-is so the bytes that
/// end up in `container_config.json` are bit-for-bit what the daemon
/// returned (spec.md §3 "Container Config" invariant).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InspectDocument(pub Value);

impl InspectDocument {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    fn get_path<'a>(&'a self, path: &[&str]) -> Option<&'a Value> {
        let mut cur = &self.0;
        for key in path {
            cur = cur.get(key)?;
        }
        Some(cur)
    }

    pub fn id(&self) -> Option<&str> {
        self.get_path(&["Id"]).and_then(Value::as_str)
    }

    /// Container name with the leading `/` Docker always prefixes stripped.
    pub fn name(&self) -> Option<String> {
        self.get_path(&["Name"])
            .and_then(Value::as_str)
            .map(|s| s.trim_start_matches('/').to_string())
    }

    /// Image reference, falling back from `Config.Image` to the top-level
    /// `Image` field per spec.md §4.4 step 3.
    pub fn image_ref(&self) -> Option<&str> {
        self.get_path(&["Config", "Image"])
            .and_then(Value::as_str)
            .or_else(|| self.get_path(&["Image"]).and_then(Value::as_str))
    }

    pub fn is_running(&self) -> bool {
        self.get_path(&["State", "Running"])
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn attach_stdin(&self) -> bool {
        self.get_path(&["Config", "AttachStdin"])
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn attach_stdout(&self) -> bool {
        self.get_path(&["Config", "AttachStdout"])
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn tty(&self) -> bool {
        self.get_path(&["Config", "Tty"])
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn open_stdin(&self) -> bool {
        self.get_path(&["Config", "OpenStdin"])
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn env(&self) -> Vec<String> {
        self.get_path(&["Config", "Env"])
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn binds(&self) -> Vec<String> {
        self.get_path(&["HostConfig", "Binds"])
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn network_mode(&self) -> Option<&str> {
        self.get_path(&["HostConfig", "NetworkMode"])
            .and_then(Value::as_str)
    }

    /// Static IP for a named user-defined network, if present.
    pub fn static_ip(&self, network: &str) -> Option<String> {
        self.get_path(&["NetworkSettings", "Networks", network, "IPAddress"])
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn networks(&self) -> Vec<String> {
        self.get_path(&["NetworkSettings", "Networks"])
            .and_then(Value::as_object)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn restart_policy_name(&self) -> Option<&str> {
        self.get_path(&["HostConfig", "RestartPolicy", "Name"])
            .and_then(Value::as_str)
    }

    pub fn privileged(&self) -> bool {
        self.get_path(&["HostConfig", "Privileged"])
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn cap_add(&self) -> Vec<String> {
        self.string_array(&["HostConfig", "CapAdd"])
    }

    pub fn cap_drop(&self) -> Vec<String> {
        self.string_array(&["HostConfig", "CapDrop"])
    }

    pub fn working_dir(&self) -> Option<&str> {
        self.get_path(&["Config", "WorkingDir"])
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn user(&self) -> Option<&str> {
        self.get_path(&["Config", "User"])
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn labels(&self) -> Vec<(String, String)> {
        self.get_path(&["Config", "Labels"])
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn entrypoint(&self) -> Vec<String> {
        self.string_array(&["Config", "Entrypoint"])
    }

    pub fn cmd(&self) -> Vec<String> {
        self.string_array(&["Config", "Cmd"])
    }

    /// Published port bindings as `(container_port_with_proto, host_port)`.
    pub fn port_bindings(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(map) = self
            .get_path(&["HostConfig", "PortBindings"])
            .and_then(Value::as_object)
        {
            for (container_port, bindings) in map {
                if let Some(arr) = bindings.as_array() {
                    for binding in arr {
                        if let Some(host_port) =
                            binding.get("HostPort").and_then(Value::as_str)
                        {
                            if !host_port.is_empty() {
                                out.push((container_port.clone(), host_port.to_string()));
                            }
                        }
                    }
                }
            }
        }
        out
    }

    /// `Mounts` entries: `(name_opt, destination, mount_type, driver_opt)`.
    pub fn mounts(&self) -> Vec<MountEntry> {
        self.get_path(&["Mounts"])
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| {
                        let destination = m.get("Destination")?.as_str()?.to_string();
                        Some(MountEntry {
                            name: m.get("Name").and_then(Value::as_str).map(str::to_string),
                            destination,
                            mount_type: m
                                .get("Type")
                                .and_then(Value::as_str)
                                .unwrap_or("volume")
                                .to_string(),
                            driver: m.get("Driver").and_then(Value::as_str).map(str::to_string),
                            source: m.get("Source").and_then(Value::as_str).map(str::to_string),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn string_array(&self, path: &[&str]) -> Vec<String> {
        self.get_path(path)
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn compose_project_label(&self) -> Option<String> {
        self.labels()
            .into_iter()
            .find(|(k, _)| k == "com.docker.compose.project")
            .map(|(_, v)| v)
    }

    pub fn swarm_namespace_label(&self) -> Option<String> {
        self.labels()
            .into_iter()
            .find(|(k, _)| k == "com.docker.stack.namespace")
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone)]
pub struct MountEntry {
    pub name: Option<String>,
    pub destination: String,
    pub mount_type: String,
    pub driver: Option<String>,
    pub source: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> InspectDocument {
        InspectDocument::new(json!({
            "Id": "abc123",
            "Name": "/web",
            "Config": {
                "Image": "nginx:1.25",
                "Env": ["FOO=bar"],
                "Labels": {"com.docker.compose.project": "stack1"},
                "Entrypoint": null,
                "Cmd": ["nginx", "-g", "daemon off;"]
            },
            "HostConfig": {
                "Binds": ["webdata:/usr/share/nginx/html"],
                "PortBindings": {"80/tcp": [{"HostPort": "8080"}]},
                "NetworkMode": "bridge",
                "RestartPolicy": {"Name": "no"}
            },
            "NetworkSettings": {"Networks": {"bridge": {"IPAddress": "172.17.0.2"}}},
            "Mounts": [{"Name": "webdata", "Destination": "/usr/share/nginx/html", "Type": "volume"}]
        }))
    }

    #[test]
    fn name_strips_leading_slash() {
        assert_eq!(sample().name().as_deref(), Some("web"));
    }

    #[test]
    fn image_ref_reads_config_image() {
        assert_eq!(sample().image_ref(), Some("nginx:1.25"));
    }

    #[test]
    fn port_bindings_reads_host_port() {
        let bindings = sample().port_bindings();
        assert_eq!(bindings, vec![("80/tcp".to_string(), "8080".to_string())]);
    }

    #[test]
    fn missing_fields_return_empty_not_panic() {
        let doc = InspectDocument::new(json!({}));
        assert!(doc.env().is_empty());
        assert!(doc.binds().is_empty());
        assert!(doc.mounts().is_empty());
        assert_eq!(doc.name(), None);
        assert!(!doc.privileged());
    }

    #[test]
    fn compose_project_label_reads_known_key() {
        assert_eq!(sample().compose_project_label().as_deref(), Some("stack1"));
    }
}
