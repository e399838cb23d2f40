//! Run-Spec Reconstructor (spec.md §4.2).
//!
//! Given an inspect document, deterministically re-derives the argument
//! list that would reproduce the container and an advisory compose
//! document. This is the single source of truth Restore re-invokes on
//! every restore (spec.md §4.5 step 4) — the text files written into the
//! archive at backup time are legacy/debug aids only, never read back.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::docker::ContainerCreateSpec;
use crate::docker::inspect::InspectDocument;

/// One emitted `docker create` flag, kept structured until the final
/// render so callers (Restore Engine) can post-process specific flags
/// (e.g. strip `--ip`) without re-parsing text.
#[derive(Debug, Clone)]
pub enum Arg {
    Name(String),
    Detach,
    Tty,
    Interactive,
    Port { host: String, container: String },
    Env(String),
    Bind(String),
    Network(String),
    Ip(String),
    RestartPolicy(String),
    Privileged,
    CapAdd(String),
    CapDrop(String),
    WorkingDir(String),
    User(String),
    Label(String, String),
    Entrypoint(Vec<String>),
    Image(String),
    Cmd(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub args: Vec<Arg>,
}

impl RunSpec {
    /// Reconstructs the ordered argument list following spec.md §4.2's
    /// nine emission rules. `port_overrides` maps a `container_port/proto`
    /// string to a replacement host port; an override suppresses the
    /// original binding for that same container port and is emitted first.
    pub fn reconstruct(doc: &InspectDocument, port_overrides: &HashMap<String, String>) -> Self {
        let mut args = Vec::new();

        if let Some(name) = doc.name() {
            args.push(Arg::Name(name));
        }

        if !doc.attach_stdin() && !doc.attach_stdout() {
            args.push(Arg::Detach);
        }
        if doc.tty() {
            args.push(Arg::Tty);
        }
        if doc.open_stdin() {
            args.push(Arg::Interactive);
        }

        let mut emitted_container_ports: Vec<String> = Vec::new();
        for (container_port, host_port) in port_overrides {
            args.push(Arg::Port {
                host: host_port.clone(),
                container: container_port.clone(),
            });
            emitted_container_ports.push(container_port.clone());
        }
        for (container_port, host_port) in doc.port_bindings() {
            if emitted_container_ports.contains(&container_port) {
                continue;
            }
            args.push(Arg::Port {
                host: host_port,
                container: container_port,
            });
        }

        for env in doc.env() {
            args.push(Arg::Env(env));
        }

        for bind in doc.binds() {
            args.push(Arg::Bind(bind));
        }

        let network_mode = doc.network_mode();
        let is_default_network = matches!(network_mode, None | Some("default") | Some("bridge"));
        if let Some(mode) = network_mode {
            if mode != "default" {
                args.push(Arg::Network(mode.to_string()));
            }
        }
        if !is_default_network {
            if let Some(mode) = network_mode {
                if let Some(ip) = doc.static_ip(mode) {
                    args.push(Arg::Ip(ip));
                }
            }
        }

        if let Some(policy) = doc.restart_policy_name() {
            if policy != "no" {
                args.push(Arg::RestartPolicy(policy.to_string()));
            }
        }
        if doc.privileged() {
            args.push(Arg::Privileged);
        }
        for cap in doc.cap_add() {
            args.push(Arg::CapAdd(cap));
        }
        for cap in doc.cap_drop() {
            args.push(Arg::CapDrop(cap));
        }
        if let Some(dir) = doc.working_dir() {
            args.push(Arg::WorkingDir(dir.to_string()));
        }
        if let Some(user) = doc.user() {
            args.push(Arg::User(user.to_string()));
        }
        for (k, v) in doc.labels() {
            args.push(Arg::Label(k, v));
        }

        let entrypoint = doc.entrypoint();
        if !entrypoint.is_empty() {
            args.push(Arg::Entrypoint(entrypoint));
        }
        if let Some(image) = doc.image_ref() {
            args.push(Arg::Image(image.to_string()));
        }
        let cmd = doc.cmd();
        if !cmd.is_empty() {
            args.push(Arg::Cmd(cmd));
        }

        RunSpec { args }
    }

    /// Renames the `--name` argument, used for restore's `new_name` option.
    pub fn rename(&mut self, new_name: &str) {
        for arg in &mut self.args {
            if let Arg::Name(n) = arg {
                *n = new_name.to_string();
            }
        }
    }

    /// Strips `-d`/`--detach` and, if the effective network is the default
    /// bridge or unspecified, strips `--ip` too (spec.md §4.5 step 8).
    pub fn normalise_for_restore(&mut self) {
        self.args.retain(|a| !matches!(a, Arg::Detach));

        let targets_default_bridge = !self
            .args
            .iter()
            .any(|a| matches!(a, Arg::Network(mode) if mode != "bridge" && mode != "default"));
        if targets_default_bridge {
            self.args.retain(|a| !matches!(a, Arg::Ip(_)));
        }
    }

    pub fn name(&self) -> Option<String> {
        self.args.iter().find_map(|a| match a {
            Arg::Name(n) => Some(n.clone()),
            _ => None,
        })
    }

    pub fn image(&self) -> Option<String> {
        self.args.iter().find_map(|a| match a {
            Arg::Image(i) => Some(i.clone()),
            _ => None,
        })
    }

    /// Flattens into a [`ContainerCreateSpec`] for `DockerTransport::create_container`.
    pub fn to_create_spec(&self) -> ContainerCreateSpec {
        let mut spec = ContainerCreateSpec::default();
        for arg in &self.args {
            match arg {
                Arg::Detach => spec.attached = false,
                Arg::Tty => spec.tty = true,
                Arg::Interactive => spec.open_stdin = true,
                Arg::Port { host, container } => {
                    spec.port_bindings.push((container.clone(), host.clone()))
                }
                Arg::Env(e) => spec.env.push(e.clone()),
                Arg::Bind(b) => spec.binds.push(b.clone()),
                Arg::Network(n) => spec.network_mode = Some(n.clone()),
                Arg::Ip(ip) => spec.ip_address = Some(ip.clone()),
                Arg::RestartPolicy(p) => spec.restart_policy = Some(p.clone()),
                Arg::Privileged => spec.privileged = true,
                Arg::CapAdd(c) => spec.cap_add.push(c.clone()),
                Arg::CapDrop(c) => spec.cap_drop.push(c.clone()),
                Arg::WorkingDir(d) => spec.working_dir = Some(d.clone()),
                Arg::User(u) => spec.user = Some(u.clone()),
                Arg::Label(k, v) => {
                    spec.labels.insert(k.clone(), v.clone());
                }
                Arg::Entrypoint(e) => spec.entrypoint = e.clone(),
                Arg::Cmd(c) => spec.cmd = c.clone(),
                Arg::Name(_) | Arg::Image(_) => {}
            }
        }
        spec
    }

    /// Renders as a `docker create` command line, quoting per spec.md §4.2
    /// rule 9: elements containing whitespace or `$ \ " '` are wrapped in
    /// double quotes with embedded double quotes escaped.
    pub fn render_command_line(&self) -> String {
        let mut out = String::from("docker create");
        for arg in &self.args {
            match arg {
                Arg::Name(n) => write!(out, " --name {}", quote(n)).unwrap(),
                Arg::Detach => out.push_str(" -d"),
                Arg::Tty => out.push_str(" -t"),
                Arg::Interactive => out.push_str(" -i"),
                Arg::Port { host, container } => {
                    write!(out, " -p {host}:{container}").unwrap()
                }
                Arg::Env(e) => write!(out, " -e {}", quote(e)).unwrap(),
                Arg::Bind(b) => write!(out, " -v {}", quote(b)).unwrap(),
                Arg::Network(n) => write!(out, " --network {n}").unwrap(),
                Arg::Ip(ip) => write!(out, " --ip {ip}").unwrap(),
                Arg::RestartPolicy(p) => write!(out, " --restart {p}").unwrap(),
                Arg::Privileged => out.push_str(" --privileged"),
                Arg::CapAdd(c) => write!(out, " --cap-add {c}").unwrap(),
                Arg::CapDrop(c) => write!(out, " --cap-drop {c}").unwrap(),
                Arg::WorkingDir(d) => write!(out, " -w {}", quote(d)).unwrap(),
                Arg::User(u) => write!(out, " -u {}", quote(u)).unwrap(),
                Arg::Label(k, v) => write!(out, " -l {}={}", k, quote(v)).unwrap(),
                Arg::Entrypoint(e) => {
                    let joined = e.iter().map(|s| quote(s)).collect::<Vec<_>>().join(" ");
                    write!(out, " --entrypoint {joined}").unwrap();
                }
                Arg::Image(i) => write!(out, " {i}").unwrap(),
                Arg::Cmd(c) => {
                    let joined = c.iter().map(|s| quote(s)).collect::<Vec<_>>().join(" ");
                    write!(out, " {joined}").unwrap();
                }
            }
        }
        out
    }

    /// Renders an advisory `docker-compose.yml` equivalent. Both this and
    /// [`Self::render_command_line`] are advisory only (spec.md §4.2):
    /// restore re-derives the spec from the inspect document, never from
    /// these rendered texts.
    pub fn render_compose(&self, service_name: &str) -> String {
        #[derive(serde::Serialize)]
        struct Service {
            image: String,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            ports: Vec<String>,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            environment: Vec<String>,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            volumes: Vec<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            restart: Option<String>,
            #[serde(skip_serializing_if = "std::collections::HashMap::is_empty")]
            labels: HashMap<String, String>,
        }
        #[derive(serde::Serialize)]
        struct Compose {
            version: String,
            services: HashMap<String, Service>,
        }

        let mut ports = Vec::new();
        let mut environment = Vec::new();
        let mut volumes = Vec::new();
        let mut labels = HashMap::new();
        let mut restart = None;
        let mut image = String::new();

        for arg in &self.args {
            match arg {
                Arg::Port { host, container } => ports.push(format!("{host}:{container}")),
                Arg::Env(e) => environment.push(e.clone()),
                Arg::Bind(b) => volumes.push(b.clone()),
                Arg::RestartPolicy(p) => restart = Some(p.clone()),
                Arg::Label(k, v) => {
                    labels.insert(k.clone(), v.clone());
                }
                Arg::Image(i) => image = i.clone(),
                _ => {}
            }
        }

        let compose = Compose {
            version: "3.8".to_string(),
            services: HashMap::from([(
                service_name.to_string(),
                Service {
                    image,
                    ports,
                    environment,
                    volumes,
                    restart,
                    labels,
                },
            )]),
        };

        serde_yaml::to_string(&compose).unwrap_or_default()
    }
}

fn needs_quoting(s: &str) -> bool {
    s.chars()
        .any(|c| c.is_whitespace() || "$\\\"'".contains(c))
}

fn quote(s: &str) -> String {
    if needs_quoting(s) {
        format!("\"{}\"", s.replace('"', "\\\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> InspectDocument {
        InspectDocument::new(json!({
            "Name": "/web",
            "Config": {
                "Image": "nginx:1.25",
                "Env": ["FOO=bar baz"],
                "AttachStdin": false,
                "AttachStdout": false,
                "Tty": false,
                "Cmd": ["nginx", "-g", "daemon off;"]
            },
            "HostConfig": {
                "Binds": ["webdata:/usr/share/nginx/html"],
                "PortBindings": {"80/tcp": [{"HostPort": "8080"}]},
                "NetworkMode": "bridge",
                "RestartPolicy": {"Name": "unless-stopped"}
            },
            "NetworkSettings": {"Networks": {"bridge": {"IPAddress": "172.17.0.2"}}}
        }))
    }

    #[test]
    fn reconstruct_emits_name_and_detach() {
        let spec = RunSpec::reconstruct(&doc(), &HashMap::new());
        assert_eq!(spec.name().as_deref(), Some("web"));
        assert!(matches!(spec.args[1], Arg::Detach));
    }

    #[test]
    fn bridge_network_does_not_emit_ip() {
        let spec = RunSpec::reconstruct(&doc(), &HashMap::new());
        assert!(!spec.args.iter().any(|a| matches!(a, Arg::Ip(_))));
    }

    #[test]
    fn port_override_suppresses_original_and_is_emitted_first() {
        let mut overrides = HashMap::new();
        overrides.insert("80/tcp".to_string(), "9090".to_string());
        let spec = RunSpec::reconstruct(&doc(), &overrides);
        let ports: Vec<_> = spec
            .args
            .iter()
            .filter_map(|a| match a {
                Arg::Port { host, container } => Some((host.clone(), container.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(ports, vec![("9090".to_string(), "80/tcp".to_string())]);
    }

    #[test]
    fn normalise_strips_detach_and_ip_on_default_bridge() {
        let mut spec = RunSpec::reconstruct(&doc(), &HashMap::new());
        spec.args.push(Arg::Ip("172.17.0.2".into()));
        spec.normalise_for_restore();
        assert!(!spec.args.iter().any(|a| matches!(a, Arg::Detach)));
        assert!(!spec.args.iter().any(|a| matches!(a, Arg::Ip(_))));
    }

    #[test]
    fn quoting_wraps_whitespace_and_escapes_quotes() {
        assert_eq!(quote("FOO=bar baz"), "\"FOO=bar baz\"");
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("has\"quote"), "\"has\\\"quote\"");
    }

    #[test]
    fn rename_replaces_name_argument() {
        let mut spec = RunSpec::reconstruct(&doc(), &HashMap::new());
        spec.rename("web-restored");
        assert_eq!(spec.name().as_deref(), Some("web-restored"));
    }
}
