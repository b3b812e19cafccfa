//! Kubeconfig documents
//!
//! Generated kubeconfigs reference the control-plane endpoint, its CA data and
//! an exec-based credential plugin; no long-lived secrets are written.
//!
//! Merging into an existing file upserts the cluster/context/user entries by
//! name and keeps everything else (other clusters, preferences, unknown keys).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// API version of the exec credential plugin protocol
pub const EXEC_API_VERSION: &str = "client.authentication.k8s.io/v1beta1";

// =============================================================================
// Document Model
// =============================================================================

/// A named kubeconfig entry whose body is kept as raw YAML
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedEntry {
    /// Entry name
    pub name: String,
    /// Everything besides the name (`cluster:`, `context:` or `user:`)
    #[serde(flatten)]
    pub body: BTreeMap<String, serde_yaml::Value>,
}

/// A kubeconfig file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// Always "v1"
    #[serde(rename = "apiVersion", default = "default_api_version")]
    pub api_version: String,
    /// Always "Config"
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Cluster entries
    #[serde(default)]
    pub clusters: Vec<NamedEntry>,
    /// Context entries
    #[serde(default)]
    pub contexts: Vec<NamedEntry>,
    /// User entries
    #[serde(default)]
    pub users: Vec<NamedEntry>,
    /// Active context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,
    /// Keys this model does not interpret (preferences, extensions)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Default for Kubeconfig {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            clusters: Vec::new(),
            contexts: Vec::new(),
            users: Vec::new(),
            current_context: None,
            extra: BTreeMap::new(),
        }
    }
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_kind() -> String {
    "Config".to_string()
}

/// Exec credential plugin invocation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecPlugin {
    /// Plugin protocol version
    pub api_version: String,
    /// Executable (e.g. "aws")
    pub command: String,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<ExecEnvVar>,
    /// How the plugin may use stdin
    pub interactive_mode: String,
}

/// Environment variable passed to an exec plugin
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecEnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    pub value: String,
}

/// Inputs for generating a single-cluster kubeconfig
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubeconfigSpec {
    /// Entry name for cluster, context and user (e.g. the control plane ARN)
    pub entry_name: String,
    /// API server URL
    pub server: String,
    /// Base64-encoded CA bundle
    pub certificate_authority_data: String,
    /// Credential plugin
    pub exec: ExecPlugin,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterBody<'a> {
    server: &'a str,
    certificate_authority_data: &'a str,
}

#[derive(Serialize)]
struct ContextBody<'a> {
    cluster: &'a str,
    user: &'a str,
}

#[derive(Serialize)]
struct UserBody<'a> {
    exec: &'a ExecPlugin,
}

// =============================================================================
// Pure Functions (unit-testable)
// =============================================================================

fn entry<T: Serialize>(name: &str, key: &str, body: &T) -> Result<NamedEntry> {
    let value = serde_yaml::to_value(body)?;
    Ok(NamedEntry {
        name: name.to_string(),
        body: BTreeMap::from([(key.to_string(), value)]),
    })
}

fn upsert(entries: &mut Vec<NamedEntry>, new: NamedEntry) {
    match entries.iter_mut().find(|e| e.name == new.name) {
        Some(existing) => *existing = new,
        None => entries.push(new),
    }
}

impl Kubeconfig {
    /// Build a single-cluster kubeconfig
    ///
    /// Fails if the endpoint is empty or the CA data is not valid base64.
    pub fn generate(spec: &KubeconfigSpec) -> Result<Self> {
        if spec.server.is_empty() {
            return Err(Error::not_found("control plane endpoint", &spec.entry_name));
        }
        STANDARD
            .decode(spec.certificate_authority_data.as_bytes())
            .map_err(|e| Error::serialization(format!("certificate authority data: {}", e)))?;

        let name = spec.entry_name.as_str();
        Ok(Self {
            clusters: vec![entry(
                name,
                "cluster",
                &ClusterBody {
                    server: &spec.server,
                    certificate_authority_data: &spec.certificate_authority_data,
                },
            )?],
            contexts: vec![entry(
                name,
                "context",
                &ContextBody {
                    cluster: name,
                    user: name,
                },
            )?],
            users: vec![entry(name, "user", &UserBody { exec: &spec.exec })?],
            current_context: Some(name.to_string()),
            ..Default::default()
        })
    }

    /// Upsert every entry of `other` into `self` and adopt its current context
    pub fn merge(&mut self, other: Kubeconfig) {
        for cluster in other.clusters {
            upsert(&mut self.clusters, cluster);
        }
        for context in other.contexts {
            upsert(&mut self.contexts, context);
        }
        for user in other.users {
            upsert(&mut self.users, user);
        }
        if other.current_context.is_some() {
            self.current_context = other.current_context;
        }
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Parse from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Server URL of the named cluster entry
    pub fn server(&self, cluster: &str) -> Option<&str> {
        self.clusters
            .iter()
            .find(|c| c.name == cluster)
            .and_then(|c| c.body.get("cluster"))
            .and_then(|c| c.get("server"))
            .and_then(|s| s.as_str())
    }
}

// =============================================================================
// File Operations
// =============================================================================

/// Write a kubeconfig to `path`, creating parent directories
pub fn write_kubeconfig(path: &Path, config: &Kubeconfig) -> Result<PathBuf> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
    }
    std::fs::write(path, config.to_yaml()?)
        .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
    debug!(path = %path.display(), "Wrote kubeconfig");
    Ok(path.to_path_buf())
}

/// Merge `config` into the kubeconfig at `primary`, creating it if missing
pub fn merge_into_file(primary: &Path, config: Kubeconfig) -> Result<()> {
    let mut existing = if primary.exists() {
        let data = std::fs::read_to_string(primary)
            .map_err(|e| Error::io(format!("reading {}", primary.display()), e))?;
        if data.trim().is_empty() {
            Kubeconfig::default()
        } else {
            Kubeconfig::from_yaml(&data)?
        }
    } else {
        Kubeconfig::default()
    };

    existing.merge(config);
    write_kubeconfig(primary, &existing)?;
    info!(path = %primary.display(), "Merged kubeconfig");
    Ok(())
}

/// The operator's default kubeconfig (`$KUBECONFIG` is not consulted here)
pub fn default_kubeconfig_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".kube").join("config"))
}
