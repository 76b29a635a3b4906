//! OCI runtime-spec synthesis.
//!
//! Merges three configuration sources into one validated runtime spec,
//! per field and in strict precedence order:
//!
//! 1. the YAML declaration (wins whenever the field is present, even empty),
//! 2. the fragment the image author embedded under the
//!    [`CONFIG_LABEL`] image label,
//! 3. the image config itself (entrypoint/cmd/env/workdir) or a built-in
//!    default.
//!
//! List-valued fields replace wholesale - a YAML capability list discards
//! the label's list entirely, it is never unioned with it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{ImageConfig, MountSpec};
use crate::engine::ImageMetadata;
use crate::error::BuildError;

/// Label key under which an image carries its default configuration as a
/// JSON-encoded [`ImageConfig`] fragment.
pub const CONFIG_LABEL: &str = "org.mobyproject.config";

/// Version stamped into every synthesized spec.
pub const SPEC_VERSION: &str = "1.0.0";

/// The full OCI capability set. Every capability string in a synthesized
/// spec must be drawn from this list.
pub const CAPABILITIES: &[&str] = &[
    "CAP_AUDIT_CONTROL",
    "CAP_AUDIT_READ",
    "CAP_AUDIT_WRITE",
    "CAP_BLOCK_SUSPEND",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_KILL",
    "CAP_LEASE",
    "CAP_LINUX_IMMUTABLE",
    "CAP_MAC_ADMIN",
    "CAP_MAC_OVERRIDE",
    "CAP_MKNOD",
    "CAP_NET_ADMIN",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_RAW",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYSLOG",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_CHROOT",
    "CAP_SYS_MODULE",
    "CAP_SYS_NICE",
    "CAP_SYS_PACCT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_WAKE_ALARM",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub oci_version: String,
    pub process: Process,
    pub root: Root,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    pub mounts: Vec<Mount>,
    pub linux: Linux,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub user: User,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    pub cwd: String,
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rlimits: Vec<Rlimit>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_new_privileges: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oom_score_adj: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub bounding: Vec<String>,
    pub effective: Vec<String>,
    pub inheritable: Vec<String>,
    pub permitted: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Root {
    pub path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rlimit {
    #[serde(rename = "type")]
    pub kind: String,
    pub hard: u64,
    pub soft: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readonly_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sysctl: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_propagation: Option<String>,
    pub namespaces: Vec<Namespace>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Memory {
    #[serde(rename = "disableOOMKiller", skip_serializing_if = "Option::is_none")]
    pub disable_oom_killer: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Decode the configuration fragment embedded in image metadata.
///
/// An absent label is an empty fragment, not an error; a label that is
/// present but not valid JSON is fatal for this image.
pub fn label_fragment(image: &str, metadata: &ImageMetadata) -> Result<ImageConfig, BuildError> {
    match metadata.labels.get(CONFIG_LABEL) {
        None => Ok(ImageConfig::default()),
        Some(raw) => serde_json::from_str(raw).map_err(|e| BuildError::LabelDecode {
            image: image.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// YAML wins over the label fragment, field by field.
fn pick<T: Clone>(yaml: &Option<T>, label: &Option<T>) -> Option<T> {
    yaml.clone().or_else(|| label.clone())
}

/// Merge a YAML image declaration with the metadata of its resolved
/// image into a validated runtime spec. No partial spec is returned on
/// validation failure.
pub fn synthesize(yaml: &ImageConfig, metadata: &ImageMetadata) -> Result<RuntimeSpec, BuildError> {
    let label = label_fragment(&yaml.image, metadata)?;

    let capabilities = pick(&yaml.capabilities, &label.capabilities)
        .unwrap_or_else(|| CAPABILITIES.iter().map(|c| c.to_string()).collect());
    for capability in &capabilities {
        if !CAPABILITIES.contains(&capability.as_str()) {
            return Err(BuildError::InvalidCapability {
                image: yaml.name.clone(),
                capability: capability.clone(),
            });
        }
    }

    let args = pick(&yaml.command, &label.command).unwrap_or_else(|| {
        let mut args = metadata.entrypoint.clone();
        args.extend(metadata.cmd.iter().cloned());
        args
    });
    let env = pick(&yaml.env, &label.env).unwrap_or_else(|| metadata.env.clone());
    let cwd = pick(&yaml.cwd, &label.cwd)
        .filter(|c| !c.is_empty())
        .or_else(|| {
            if metadata.working_dir.is_empty() {
                None
            } else {
                Some(metadata.working_dir.clone())
            }
        })
        .unwrap_or_else(|| "/".to_string());

    let mounts = merge_mounts(yaml, &label)?;
    let namespaces = namespaces(yaml, &label);
    let sysctl = parse_sysctl(yaml, &label)?;
    let rlimits = parse_rlimits(yaml, &label)?;

    let disable_oom_killer = pick(&yaml.disable_oom_killer, &label.disable_oom_killer);
    let resources = disable_oom_killer.map(|disable| Resources {
        memory: Some(Memory {
            disable_oom_killer: Some(disable),
        }),
    });

    Ok(RuntimeSpec {
        oci_version: SPEC_VERSION.to_string(),
        process: Process {
            user: User {
                uid: pick(&yaml.uid, &label.uid).unwrap_or(0),
                gid: pick(&yaml.gid, &label.gid).unwrap_or(0),
                additional_gids: pick(&yaml.additional_gids, &label.additional_gids)
                    .unwrap_or_default(),
            },
            args,
            env,
            cwd,
            capabilities: Capabilities {
                bounding: capabilities.clone(),
                effective: capabilities.clone(),
                inheritable: capabilities.clone(),
                permitted: capabilities,
            },
            rlimits,
            no_new_privileges: pick(&yaml.no_new_privileges, &label.no_new_privileges)
                .unwrap_or(false),
            oom_score_adj: pick(&yaml.oom_score_adj, &label.oom_score_adj),
        },
        root: Root {
            path: "rootfs".to_string(),
            readonly: pick(&yaml.readonly, &label.readonly).unwrap_or(false),
        },
        hostname: pick(&yaml.hostname, &label.hostname).unwrap_or_default(),
        mounts,
        linux: Linux {
            masked_paths: pick(&yaml.masked_paths, &label.masked_paths).unwrap_or_default(),
            readonly_paths: pick(&yaml.readonly_paths, &label.readonly_paths).unwrap_or_default(),
            sysctl,
            resources,
            cgroups_path: pick(&yaml.cgroups_path, &label.cgroups_path),
            rootfs_propagation: pick(&yaml.rootfs_propagation, &label.rootfs_propagation),
            namespaces,
        },
    })
}

fn default_mounts() -> BTreeMap<String, Mount> {
    let mount = |destination: &str, kind: &str, source: &str, options: &[&str]| Mount {
        destination: destination.to_string(),
        kind: kind.to_string(),
        source: source.to_string(),
        options: options.iter().map(|o| o.to_string()).collect(),
    };
    let mut mounts = BTreeMap::new();
    for m in [
        mount("/proc", "proc", "proc", &[]),
        mount(
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        mount(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
        ),
        mount(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        mount("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        mount("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
        mount(
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        ),
    ] {
        mounts.insert(m.destination.clone(), m);
    }
    mounts
}

fn merge_mounts(yaml: &ImageConfig, label: &ImageConfig) -> Result<Vec<Mount>, BuildError> {
    let mut by_destination = default_mounts();

    let declared: Vec<MountSpec> = pick(&yaml.mounts, &label.mounts).unwrap_or_default();
    for spec in declared {
        let destination = spec.destination.clone().ok_or_else(|| {
            BuildError::Schema(format!("image {:?}: mount without destination", yaml.name))
        })?;
        by_destination.insert(
            destination.clone(),
            Mount {
                destination,
                kind: spec.kind.unwrap_or_default(),
                source: spec.source.unwrap_or_default(),
                options: spec.options.unwrap_or_default(),
            },
        );
    }

    for bind in pick(&yaml.binds, &label.binds).unwrap_or_default() {
        let mut parts = bind.splitn(3, ':');
        let source = parts.next().unwrap_or_default().to_string();
        let destination = parts.next().map(str::to_string).ok_or_else(|| {
            BuildError::Schema(format!(
                "image {:?}: bind {:?} is not src:dst[:opts]",
                yaml.name, bind
            ))
        })?;
        let mut options: Vec<String> = match parts.next() {
            Some(opts) => opts.split(',').map(str::to_string).collect(),
            None => vec!["rw".to_string()],
        };
        if !options.iter().any(|o| o == "bind" || o == "rbind") {
            options.push("bind".to_string());
        }
        by_destination.insert(
            destination.clone(),
            Mount {
                destination,
                kind: "bind".to_string(),
                source,
                options,
            },
        );
    }

    for tmpfs in pick(&yaml.tmpfs, &label.tmpfs).unwrap_or_default() {
        let mut parts = tmpfs.splitn(2, ':');
        let destination = parts.next().unwrap_or_default().to_string();
        let options: Vec<String> = parts
            .next()
            .map(|opts| opts.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        by_destination.insert(
            destination.clone(),
            Mount {
                destination,
                kind: "tmpfs".to_string(),
                source: "tmpfs".to_string(),
                options,
            },
        );
    }

    Ok(by_destination.into_values().collect())
}

fn namespaces(yaml: &ImageConfig, label: &ImageConfig) -> Vec<Namespace> {
    let mut namespaces = vec![Namespace {
        kind: "mount".to_string(),
        path: None,
    }];
    for (kind, value) in [
        ("network", pick(&yaml.net, &label.net)),
        ("pid", pick(&yaml.pid, &label.pid)),
        ("ipc", pick(&yaml.ipc, &label.ipc)),
        ("uts", pick(&yaml.uts, &label.uts)),
    ] {
        match value.as_deref() {
            // "host" shares the host namespace: no entry at all.
            Some("host") => {}
            // A path joins an existing namespace.
            Some(path) if path.starts_with('/') => namespaces.push(Namespace {
                kind: kind.to_string(),
                path: Some(path.to_string()),
            }),
            _ => namespaces.push(Namespace {
                kind: kind.to_string(),
                path: None,
            }),
        }
    }
    namespaces
}

fn parse_sysctl(
    yaml: &ImageConfig,
    label: &ImageConfig,
) -> Result<BTreeMap<String, String>, BuildError> {
    let mut sysctl = BTreeMap::new();
    for pair in pick(&yaml.sysctl, &label.sysctl).unwrap_or_default() {
        match pair.as_slice() {
            [key, value] => {
                sysctl.insert(key.clone(), value.clone());
            }
            _ => {
                return Err(BuildError::Schema(format!(
                    "image {:?}: sysctl entry {:?} is not a [key, value] pair",
                    yaml.name, pair
                )))
            }
        }
    }
    Ok(sysctl)
}

fn parse_rlimits(yaml: &ImageConfig, label: &ImageConfig) -> Result<Vec<Rlimit>, BuildError> {
    let mut rlimits = Vec::new();
    for rlimit in pick(&yaml.rlimits, &label.rlimits).unwrap_or_default() {
        let parts: Vec<&str> = rlimit.split(',').collect();
        let (name, soft, hard) = match parts.as_slice() {
            [name, soft, hard] => (*name, *soft, *hard),
            _ => {
                return Err(BuildError::Schema(format!(
                    "image {:?}: rlimit {:?} is not name,soft,hard",
                    yaml.name, rlimit
                )))
            }
        };
        let parse = |value: &str| {
            value.trim().parse::<u64>().map_err(|_| {
                BuildError::Schema(format!(
                    "image {:?}: rlimit {:?} has a non-numeric limit",
                    yaml.name, rlimit
                ))
            })
        };
        rlimits.push(Rlimit {
            kind: format!("RLIMIT_{}", name.trim().to_ascii_uppercase()),
            soft: parse(soft)?,
            hard: parse(hard)?,
        });
    }
    Ok(rlimits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata_with_label(label: &ImageConfig) -> ImageMetadata {
        let mut metadata = ImageMetadata::default();
        metadata.labels.insert(
            CONFIG_LABEL.to_string(),
            serde_json::to_string(label).unwrap(),
        );
        metadata
    }

    fn yaml_image(name: &str) -> ImageConfig {
        ImageConfig {
            name: name.to_string(),
            image: "testimage".to_string(),
            ..ImageConfig::default()
        }
    }

    #[test]
    fn yaml_capabilities_override_label_capabilities() {
        let mut yaml = yaml_image("test");
        yaml.capabilities = Some(vec!["CAP_SYS_ADMIN".to_string()]);

        let label = ImageConfig {
            capabilities: Some(vec!["CAP_SYS_CHROOT".to_string()]),
            cwd: Some("/label/directory".to_string()),
            ..ImageConfig::default()
        };

        let spec = synthesize(&yaml, &metadata_with_label(&label)).unwrap();
        assert_eq!(spec.process.capabilities.bounding, vec!["CAP_SYS_ADMIN"]);
        // The label still supplies what YAML left unset.
        assert_eq!(spec.process.cwd, "/label/directory");
    }

    #[test]
    fn invalid_capability_fails_synthesis() {
        let yaml = yaml_image("test");
        let label = ImageConfig {
            capabilities: Some(vec!["NOT_A_CAP".to_string()]),
            ..ImageConfig::default()
        };

        let err = synthesize(&yaml, &metadata_with_label(&label)).unwrap_err();
        match err {
            BuildError::InvalidCapability { image, capability } => {
                assert_eq!(image, "test");
                assert_eq!(capability, "NOT_A_CAP");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_yaml_capability_list_discards_label_list() {
        let mut yaml = yaml_image("test");
        yaml.capabilities = Some(vec![]);
        let label = ImageConfig {
            capabilities: Some(vec!["CAP_SYS_CHROOT".to_string()]),
            ..ImageConfig::default()
        };

        let spec = synthesize(&yaml, &metadata_with_label(&label)).unwrap();
        assert!(spec.process.capabilities.bounding.is_empty());
    }

    #[test]
    fn absent_capabilities_default_to_full_set() {
        let spec = synthesize(&yaml_image("test"), &ImageMetadata::default()).unwrap();
        assert_eq!(spec.process.capabilities.bounding.len(), CAPABILITIES.len());
    }

    #[test]
    fn env_is_whole_field_replacement() {
        let mut yaml = yaml_image("test");
        yaml.env = Some(vec!["FOO=yaml".to_string()]);
        let label = ImageConfig {
            env: Some(vec!["FOO=label".to_string(), "BAR=label".to_string()]),
            ..ImageConfig::default()
        };

        let spec = synthesize(&yaml, &metadata_with_label(&label)).unwrap();
        assert_eq!(spec.process.env, vec!["FOO=yaml"]);
    }

    #[test]
    fn image_config_fills_args_env_and_cwd() {
        let metadata = ImageMetadata {
            entrypoint: vec!["/bin/entry".to_string()],
            cmd: vec!["arg".to_string()],
            env: vec!["PATH=/bin".to_string()],
            working_dir: "/image/dir".to_string(),
            labels: BTreeMap::new(),
        };

        let spec = synthesize(&yaml_image("test"), &metadata).unwrap();
        assert_eq!(spec.process.args, vec!["/bin/entry", "arg"]);
        assert_eq!(spec.process.env, vec!["PATH=/bin"]);
        assert_eq!(spec.process.cwd, "/image/dir");
    }

    #[test]
    fn cwd_defaults_to_root() {
        let spec = synthesize(&yaml_image("test"), &ImageMetadata::default()).unwrap();
        assert_eq!(spec.process.cwd, "/");
    }

    #[test]
    fn numeric_fields_distinguish_unset_from_zero() {
        let label = ImageConfig {
            uid: Some(502),
            oom_score_adj: Some(-500),
            ..ImageConfig::default()
        };

        // YAML silent: label values flow through.
        let spec = synthesize(&yaml_image("test"), &metadata_with_label(&label)).unwrap();
        assert_eq!(spec.process.user.uid, 502);
        assert_eq!(spec.process.oom_score_adj, Some(-500));

        // Explicit zero in YAML beats the label; it is not "absent".
        let mut yaml = yaml_image("test");
        yaml.uid = Some(0);
        yaml.oom_score_adj = Some(0);
        let spec = synthesize(&yaml, &metadata_with_label(&label)).unwrap();
        assert_eq!(spec.process.user.uid, 0);
        assert_eq!(spec.process.oom_score_adj, Some(0));

        // Nothing declared anywhere: uid 0, score unset.
        let spec = synthesize(&yaml_image("test"), &ImageMetadata::default()).unwrap();
        assert_eq!(spec.process.user.uid, 0);
        assert_eq!(spec.process.oom_score_adj, None);
    }

    #[test]
    fn malformed_label_is_a_decode_error() {
        let mut metadata = ImageMetadata::default();
        metadata
            .labels
            .insert(CONFIG_LABEL.to_string(), "{not json".to_string());

        let err = synthesize(&yaml_image("test"), &metadata).unwrap_err();
        assert!(matches!(err, BuildError::LabelDecode { .. }));
    }

    #[test]
    fn absent_label_is_an_empty_fragment() {
        let fragment = label_fragment("img", &ImageMetadata::default()).unwrap();
        assert!(fragment.capabilities.is_none());
        assert!(fragment.cwd.is_none());
    }

    #[test]
    fn binds_and_tmpfs_become_mounts() {
        let mut yaml = yaml_image("test");
        yaml.binds = Some(vec!["/var/db:/data:ro".to_string()]);
        yaml.tmpfs = Some(vec!["/scratch:size=4m".to_string()]);

        let spec = synthesize(&yaml, &ImageMetadata::default()).unwrap();
        let bind = spec
            .mounts
            .iter()
            .find(|m| m.destination == "/data")
            .unwrap();
        assert_eq!(bind.kind, "bind");
        assert_eq!(bind.source, "/var/db");
        assert!(bind.options.contains(&"ro".to_string()));
        assert!(bind.options.contains(&"bind".to_string()));

        let tmpfs = spec
            .mounts
            .iter()
            .find(|m| m.destination == "/scratch")
            .unwrap();
        assert_eq!(tmpfs.kind, "tmpfs");
        assert_eq!(tmpfs.options, vec!["size=4m"]);
    }

    #[test]
    fn yaml_mounts_discard_label_mounts() {
        let mut yaml = yaml_image("test");
        yaml.mounts = Some(vec![MountSpec {
            destination: Some("/yaml".to_string()),
            kind: Some("tmpfs".to_string()),
            source: Some("tmpfs".to_string()),
            options: None,
        }]);
        let label = ImageConfig {
            mounts: Some(vec![MountSpec {
                destination: Some("/label".to_string()),
                kind: Some("tmpfs".to_string()),
                source: Some("tmpfs".to_string()),
                options: None,
            }]),
            ..ImageConfig::default()
        };

        let spec = synthesize(&yaml, &metadata_with_label(&label)).unwrap();
        assert!(spec.mounts.iter().any(|m| m.destination == "/yaml"));
        assert!(!spec.mounts.iter().any(|m| m.destination == "/label"));
    }

    #[test]
    fn host_namespace_mode_drops_the_namespace() {
        let mut yaml = yaml_image("test");
        yaml.net = Some("host".to_string());

        let spec = synthesize(&yaml, &ImageMetadata::default()).unwrap();
        assert!(!spec.linux.namespaces.iter().any(|n| n.kind == "network"));
        // The others stay private.
        assert!(spec.linux.namespaces.iter().any(|n| n.kind == "pid"));
        assert!(spec.linux.namespaces.iter().any(|n| n.kind == "mount"));
    }

    #[test]
    fn sysctl_and_rlimits_parse() {
        let mut yaml = yaml_image("test");
        yaml.sysctl = Some(vec![vec![
            "net.ipv4.ip_forward".to_string(),
            "1".to_string(),
        ]]);
        yaml.rlimits = Some(vec!["nofile,100,200".to_string()]);

        let spec = synthesize(&yaml, &ImageMetadata::default()).unwrap();
        assert_eq!(
            spec.linux.sysctl.get("net.ipv4.ip_forward"),
            Some(&"1".to_string())
        );
        assert_eq!(spec.process.rlimits[0].kind, "RLIMIT_NOFILE");
        assert_eq!(spec.process.rlimits[0].soft, 100);
        assert_eq!(spec.process.rlimits[0].hard, 200);

        yaml.rlimits = Some(vec!["nofile,many,200".to_string()]);
        assert!(synthesize(&yaml, &ImageMetadata::default()).is_err());
    }

    #[test]
    fn spec_serializes_in_oci_shape() {
        let mut yaml = yaml_image("test");
        yaml.readonly = Some(true);
        let spec = synthesize(&yaml, &ImageMetadata::default()).unwrap();

        let json: serde_json::Value = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["ociVersion"], SPEC_VERSION);
        assert_eq!(json["root"]["path"], "rootfs");
        assert_eq!(json["root"]["readonly"], true);
        assert!(json["process"]["capabilities"]["bounding"].is_array());
    }
}
