//! Declarative system configuration: parsing, validation, overrides.
//!
//! The YAML schema is closed: unknown keys at any level are rejected, and
//! every onboot/service entry must carry `name` and `image`. Optional
//! per-image fields are kept as `Option` so that "declared but empty" is
//! distinguishable from "not declared" - that distinction drives the
//! merge precedence in [`crate::oci::synthesize`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::BuildError;

/// Root of the declarative specification. Immutable once overrides have
/// been applied.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub kernel: KernelConfig,
    #[serde(default)]
    pub init: Vec<String>,
    #[serde(default)]
    pub onboot: Vec<ImageConfig>,
    #[serde(default)]
    pub services: Vec<ImageConfig>,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub overrides: Vec<OverrideRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub cmdline: String,
}

/// One container's declaration.
///
/// `name` and `image` are required in YAML (enforced by
/// [`Config::from_yaml`]); everything else is optional. The same shape,
/// decoded from JSON, is the label fragment an image author bakes into
/// image metadata, where `name`/`image` stay empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounts: Option<Vec<MountSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binds: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmpfs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masked_paths: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly_paths: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_gids: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_new_privileges: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oom_score_adj: Option<i32>,
    #[serde(rename = "disableOOMKiller", skip_serializing_if = "Option::is_none")]
    pub disable_oom_killer: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs_propagation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<String>,
    /// `[key, value]` pairs, e.g. `["net.ipv4.ip_forward", "1"]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sysctl: Option<Vec<Vec<String>>>,
    /// `name,soft,hard` strings, e.g. `"nofile,100,200"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rlimits: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// A static file, directory, or symlink placed into the image.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSpec {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub directory: bool,
    pub symlink: Option<String>,
    pub contents: Option<String>,
    /// Host path to copy the contents from.
    pub source: Option<String>,
    /// With `source`, a missing host file is skipped instead of fatal.
    #[serde(default)]
    pub optional: bool,
    /// Octal mode string, e.g. `"0755"`.
    pub mode: Option<String>,
}

/// Which image references get trust-verified pulls.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustConfig {
    #[serde(default)]
    pub image: Vec<String>,
    #[serde(default)]
    pub org: Vec<String>,
}

impl TrustConfig {
    /// Whether pulls of `image` must be content-trust verified: an exact
    /// image match, an untagged trusted entry matching the image's
    /// repository, or an org match on the first path component of a
    /// multi-component reference.
    pub fn covers(&self, image: &str) -> bool {
        for trusted in &self.image {
            if trusted == image || trusted == repository(image) {
                return true;
            }
        }
        if let Some((org, _)) = image.split_once('/') {
            if self.org.iter().any(|o| o == org) {
                return true;
            }
        }
        false
    }
}

/// Global image-reference substitution, matched on repository identity.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverrideRule {
    pub source: String,
    pub substitute: String,
}

impl Config {
    /// Parse and validate a YAML specification.
    ///
    /// Syntax failures surface as [`BuildError::Parse`]; a well-formed
    /// document that does not match the closed schema (unknown keys,
    /// missing `name`/`image`, duplicate names) is [`BuildError::Schema`].
    pub fn from_yaml(bytes: &[u8]) -> Result<Config, BuildError> {
        let value: serde_yaml::Value =
            serde_yaml::from_slice(bytes).map_err(|e| BuildError::Parse(e.to_string()))?;
        let config: Config =
            serde_yaml::from_value(value).map_err(|e| BuildError::Schema(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), BuildError> {
        for (section, images) in [("onboot", &self.onboot), ("services", &self.services)] {
            let mut seen = BTreeSet::new();
            for image in images {
                if image.name.is_empty() {
                    return Err(BuildError::Schema(format!(
                        "{section} entry for image {:?} has no name",
                        image.image
                    )));
                }
                if image.image.is_empty() {
                    return Err(BuildError::Schema(format!(
                        "{section} entry {:?} has no image",
                        image.name
                    )));
                }
                if !seen.insert(image.name.as_str()) {
                    return Err(BuildError::Schema(format!(
                        "duplicate {section} name {:?}",
                        image.name
                    )));
                }
            }
        }
        for file in &self.files {
            if file.path.is_empty() {
                return Err(BuildError::Schema("file entry has no path".to_string()));
            }
            let sources = [
                file.directory,
                file.symlink.is_some(),
                file.contents.is_some(),
                file.source.is_some(),
            ];
            if sources.iter().filter(|s| **s).count() > 1 {
                return Err(BuildError::Schema(format!(
                    "file {:?} must have exactly one of directory, symlink, contents, source",
                    file.path
                )));
            }
        }
        Ok(())
    }
}

/// Rewrite every image-reference-bearing field according to the config's
/// override rules. First matching rule wins per field; the substitute
/// replaces the whole reference, tag and digest included.
pub fn apply_overrides(mut config: Config) -> Config {
    let rules = config.overrides.clone();
    substitute(&mut config.kernel.image, &rules);
    for entry in &mut config.init {
        substitute(entry, &rules);
    }
    for image in config.onboot.iter_mut().chain(config.services.iter_mut()) {
        substitute(&mut image.image, &rules);
    }
    config
}

fn substitute(reference: &mut String, rules: &[OverrideRule]) {
    if reference.is_empty() {
        return;
    }
    for rule in rules {
        if repository(reference) == rule.source {
            *reference = rule.substitute.clone();
            return;
        }
    }
}

/// The repository component of an image reference: the name with any
/// digest and tag stripped. A colon in the registry host (port number)
/// is left alone.
pub fn repository(reference: &str) -> &str {
    let base = reference.split('@').next().unwrap_or(reference);
    let name_start = base.rfind('/').map(|i| i + 1).unwrap_or(0);
    match base[name_start..].rfind(':') {
        Some(i) => &base[..name_start + i],
        None => base,
    }
}
