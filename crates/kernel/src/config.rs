//! Kernel configuration via `stead.toml`
//!
//! Every section is optional; missing keys take their defaults. A factory
//! freezes its configuration when it hands out the first broker.

use serde::{Deserialize, Serialize};
use std::path::Path;
use stead_core::{SteadError, SteadResult};
use stead_lifecycle::{ContextFlags, RestoreState};
use std::sync::Arc;

/// Conventional config file name
pub const CONFIG_FILE_NAME: &str = "stead.toml";

/// Name of the fetch group every default-fetch-group field belongs to
pub const DEFAULT_FETCH_GROUP: &str = "default";

/// Which fields a detached copy carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetachMode {
    /// Fields currently loaded
    #[default]
    Loaded,
    /// Fields the active fetch configuration asks for, plus keys
    FetchGroups,
    /// Every field, loading whatever is missing first
    All,
}

/// What the inverse manager does about an inconsistent back-pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InverseAction {
    /// Fix the other side
    #[default]
    Manage,
    /// Log the inconsistency and leave it
    Warn,
    /// Fail with a fatal invalid-state error
    Exception,
}

/// `[detach]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetachConfig {
    /// Field selection for detached copies
    pub state: DetachMode,
    /// Give detached copies a state manager that tracks later changes
    pub detached_state_manager: bool,
    /// Reads of uncaptured fields on a detached copy return defaults
    pub access_unloaded: bool,
    /// Detached copies carry neither a state manager nor a token
    pub lite: bool,
}

impl Default for DetachConfig {
    fn default() -> Self {
        DetachConfig {
            state: DetachMode::Loaded,
            detached_state_manager: true,
            access_unloaded: false,
            lite: false,
        }
    }
}

/// `[compatibility]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatibilityConfig {
    /// Flush dirty instances before detaching them
    pub flush_before_detach: bool,
    /// Detach into fresh copies; when false the managed instance itself is
    /// detached and leaves the context
    pub copy_on_detach: bool,
    /// Cascade detach over every relation regardless of its policy
    pub cascade_with_detach: bool,
    /// Reload loaded fields from the store before detaching
    pub reload_on_detach: bool,
}

impl Default for CompatibilityConfig {
    fn default() -> Self {
        CompatibilityConfig {
            flush_before_detach: false,
            copy_on_detach: true,
            cascade_with_detach: false,
            reload_on_detach: false,
        }
    }
}

/// `[inverse]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InverseConfig {
    /// Run inverse management on relation writes
    pub enabled: bool,
    /// Reaction to inconsistencies
    pub action: InverseAction,
    /// Also manage large-result-set fields
    pub manage_lrs: bool,
}

/// `[callbacks]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    /// Abort bulk operations at the first callback failure
    pub fail_fast: bool,
}

/// `[attach]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    /// Persist copies of new instances instead of the instances themselves
    pub copy_new: bool,
}

impl Default for AttachConfig {
    fn default() -> Self {
        AttachConfig { copy_new: true }
    }
}

/// Kernel configuration loaded from `stead.toml`.
///
/// # Example
///
/// ```toml
/// optimistic = true
/// retain_state = true
/// restore_state = "immutable"
///
/// [detach]
/// state = "fetch-groups"
///
/// [inverse]
/// enabled = true
/// action = "warn"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Optimistic transactions
    pub optimistic: bool,
    /// Keep field values across commit
    pub retain_state: bool,
    /// Snapshot policy for rollback
    pub restore_state: RestoreState,
    /// Allow reads outside a transaction
    pub nontransactional_read: bool,
    /// Allow writes outside a transaction
    pub nontransactional_write: bool,
    /// Brokers and detached state managers guard state with locks
    pub multithreaded: bool,
    /// Consult and maintain the data cache
    pub data_cache: bool,
    /// Fetch groups active on new brokers
    pub fetch_groups: Vec<String>,
    /// Detach options
    pub detach: DetachConfig,
    /// Compatibility switches
    pub compatibility: CompatibilityConfig,
    /// Inverse management
    pub inverse: InverseConfig,
    /// Callback error handling
    pub callbacks: CallbackConfig,
    /// Attach options
    pub attach: AttachConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            optimistic: true,
            retain_state: true,
            restore_state: RestoreState::Immutable,
            nontransactional_read: true,
            nontransactional_write: true,
            multithreaded: false,
            data_cache: false,
            fetch_groups: vec![DEFAULT_FETCH_GROUP.to_string()],
            detach: DetachConfig::default(),
            compatibility: CompatibilityConfig::default(),
            inverse: InverseConfig::default(),
            callbacks: CallbackConfig::default(),
            attach: AttachConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns a config error if the document does not parse.
    pub fn from_toml_str(content: &str) -> SteadResult<Self> {
        toml::from_str(content)
            .map_err(|e| SteadError::Config(format!("failed to parse kernel config: {}", e)))
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> SteadResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SteadError::Config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content).map_err(|e| {
            SteadError::Config(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Serialize this config to TOML
    pub fn to_toml_string(&self) -> SteadResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SteadError::Config(format!("failed to serialize config: {}", e)))
    }

    /// Default config file content with comments
    pub fn default_toml() -> &'static str {
        r#"# stead kernel configuration

# Optimistic transactions (default: true)
optimistic = true
# Keep field values across commit (default: true)
retain_state = true
# Rollback snapshot policy: "none", "immutable" (default) or "all"
restore_state = "immutable"
nontransactional_read = true
nontransactional_write = true
multithreaded = false
data_cache = false
fetch_groups = ["default"]

[detach]
# "loaded" (default), "fetch-groups" or "all"
state = "loaded"
detached_state_manager = true
access_unloaded = false
lite = false

[compatibility]
flush_before_detach = false
copy_on_detach = true
cascade_with_detach = false
reload_on_detach = false

[inverse]
enabled = false
# "manage" (default), "warn" or "exception"
action = "manage"
manage_lrs = false

[callbacks]
fail_fast = false

[attach]
copy_new = true
"#
    }

    /// Transaction flags for a new broker
    pub fn context_flags(&self) -> Arc<ContextFlags> {
        ContextFlags::new(
            self.optimistic,
            self.nontransactional_read,
            self.nontransactional_write,
            self.retain_state,
            self.restore_state,
        )
    }
}
