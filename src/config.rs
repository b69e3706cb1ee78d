use crate::coordinator::FieldErrorPolicy;
use crate::exporter::BLOCK_LABELS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Gateway value that means "print to stdout instead of pushing".
pub const STDOUT_GATEWAY: &str = "-";

/// Top-level configuration loaded from rsnap-prom-stats.toml.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ExporterConfig {
    pub push: PushConfig,
    pub labels: LabelConfig,
    pub parse: ParseConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PushConfig {
    /// Pushgateway address, or `-` to print the metrics instead.
    pub gateway: String,
    pub job: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LabelConfig {
    /// Value of the `instance` label. Defaults to the local host name.
    pub instance: Option<String>,
    /// Additional labels attached to every exported series.
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ParseConfig {
    /// Abort the run on a malformed field instead of dropping the block.
    pub strict: bool,
}

// --- Default implementations ---

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            gateway: "localhost:9091".to_string(),
            job: "rsnapshot".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl ExporterConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Reject settings that would fail later, at push or registration time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.push.gateway.trim().is_empty() {
            return Err(ConfigError::Invalid("push.gateway is empty".into()));
        }
        if self.push.job.is_empty() || self.push.job.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "push.job {:?} must be non-empty and contain no '/'",
                self.push.job
            )));
        }
        for name in self.labels.extra.keys() {
            if name == "instance" {
                return Err(ConfigError::Invalid(
                    "labels.extra may not set \"instance\", use labels.instance".into(),
                ));
            }
            if BLOCK_LABELS.contains(&name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "label {name:?} is reserved for rsync block identity"
                )));
            }
            if !is_valid_label_name(name) {
                return Err(ConfigError::Invalid(format!(
                    "{name:?} is not a valid Prometheus label name"
                )));
            }
        }
        Ok(())
    }

    /// How the coordinator treats a malformed statistics field.
    pub fn field_error_policy(&self) -> FieldErrorPolicy {
        if self.parse.strict {
            FieldErrorPolicy::Abort
        } else {
            FieldErrorPolicy::SkipBlock
        }
    }

    /// True when metrics should be printed rather than pushed.
    pub fn prints_to_stdout(&self) -> bool {
        self.push.gateway == STDOUT_GATEWAY
    }

    /// Labels attached to every series: `instance` plus the extras.
    pub fn default_labels(&self, local_host: &str) -> BTreeMap<String, String> {
        let mut labels = self.labels.extra.clone();
        let instance = self
            .labels
            .instance
            .clone()
            .unwrap_or_else(|| local_host.to_string());
        labels.insert("instance".to_string(), instance);
        labels
    }
}

/// `[a-zA-Z_][a-zA-Z0-9_]*`, excluding the reserved `__` prefix.
fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    first_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !name.starts_with("__")
}
