//! Plugin system error types with clear, actionable messages.
//!
//! All errors include the plugin name and relevant context so an operator
//! can tell which plugin broke and what to run next.

use thiserror::Error;

/// Errors raised by discovery, synchronization, lifecycle transitions,
/// module loading and archive installation.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Plugin directory has no manifest.
    #[error("plugin directory '{path}': no plugin.toml manifest found")]
    DescriptorMissing { path: String },

    /// Manifest exists but cannot be parsed or fails validation.
    #[error("plugin manifest at {path}: {details}")]
    DescriptorMalformed { path: String, details: String },

    /// Two plugin directories declare the same name.
    #[error("plugin '{plugin}': declared by both {first} and {second}; remove one of them")]
    DuplicatePluginName {
        plugin: String,
        first: String,
        second: String,
    },

    /// A discovered descriptor disagrees with the key it was catalogued under.
    #[error("descriptor name '{declared}' does not match catalog key '{key}'")]
    NameMismatch { key: String, declared: String },

    /// Two plugins would share one storage namespace.
    #[error("schema '{schema}' is claimed by both '{first}' and '{second}'")]
    SchemaNameConflict {
        schema: String,
        first: String,
        second: String,
    },

    /// Plugin is unknown to the registry.
    #[error("plugin '{plugin}': not registered. Run plugin sync first")]
    NotRegistered { plugin: String },

    /// Plugin is enabled in the registry but has no manifest on disk.
    #[error("plugin '{plugin}': enabled in registry but missing from disk. Run plugin sync first")]
    PluginMissingOnDisk { plugin: String },

    /// Manifest is present but the entry point module is not.
    #[error("plugin '{plugin}': entry point not found at {path}")]
    EntryPointMissing { plugin: String, path: String },

    /// Entry point is not a well-formed module.
    #[error("plugin '{plugin}': syntax error in entry point: {details}")]
    PluginSyntaxError { plugin: String, details: String },

    /// Entry point compiled but failed to instantiate.
    #[error("plugin '{plugin}': import failed: {details}")]
    PluginImportError { plugin: String, details: String },

    /// Entry point does not honour the export contract.
    #[error("plugin '{plugin}': contract violation: {details}")]
    ContractViolation { plugin: String, details: String },

    /// Activation of an already enabled plugin.
    #[error("plugin '{plugin}': already active")]
    AlreadyActive { plugin: String },

    /// Deactivation of an already disabled plugin.
    #[error("plugin '{plugin}': already inactive")]
    AlreadyInactive { plugin: String },

    /// Operation needs an enabled plugin.
    #[error("plugin '{plugin}': not active. Activate it first")]
    NotActive { plugin: String },

    /// Deletion of a plugin that is still enabled.
    #[error("plugin '{plugin}': still active. Deactivate it before deleting")]
    PluginActive { plugin: String },

    /// Registry metadata is behind the manifest on disk.
    #[error(
        "plugin '{plugin}': registry schema '{registered}' differs from manifest schema '{declared}'. Run plugin sync first"
    )]
    OutOfSync {
        plugin: String,
        registered: String,
        declared: String,
    },

    /// Catalog has no entry with this id.
    #[error("catalog entry '{id}' not found")]
    CatalogEntryNotFound { id: String },

    /// Catalog id cannot be used as a directory name.
    #[error("catalog id '{id}' is not a valid plugin directory name")]
    InvalidCatalogId { id: String },

    /// Catalog entry declares an archive format the installer cannot read.
    #[error("catalog entry '{id}': unsupported archive type '{archive_type}'. Supported: {supported}")]
    UnsupportedArchiveType {
        id: String,
        archive_type: String,
        supported: String,
    },

    /// Migration generation or application failed.
    #[error("plugin '{plugin}': migration failed: {details}")]
    MigrationFailed { plugin: String, details: String },

    /// Underlying storage or I/O failure.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl PluginError {
    /// Create a malformed descriptor error.
    pub fn malformed(path: impl Into<String>, details: impl Into<String>) -> Self {
        Self::DescriptorMalformed {
            path: path.into(),
            details: details.into(),
        }
    }

    /// Create a contract violation error.
    pub fn contract(plugin: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ContractViolation {
            plugin: plugin.into(),
            details: details.into(),
        }
    }

    /// Name of the plugin this error concerns, when there is one.
    pub fn plugin(&self) -> Option<&str> {
        match self {
            Self::DuplicatePluginName { plugin, .. }
            | Self::NotRegistered { plugin }
            | Self::PluginMissingOnDisk { plugin }
            | Self::EntryPointMissing { plugin, .. }
            | Self::PluginSyntaxError { plugin, .. }
            | Self::PluginImportError { plugin, .. }
            | Self::ContractViolation { plugin, .. }
            | Self::AlreadyActive { plugin }
            | Self::AlreadyInactive { plugin }
            | Self::NotActive { plugin }
            | Self::PluginActive { plugin }
            | Self::OutOfSync { plugin, .. }
            | Self::MigrationFailed { plugin, .. } => Some(plugin),
            Self::NameMismatch { declared, .. } => Some(declared),
            _ => None,
        }
    }
}
