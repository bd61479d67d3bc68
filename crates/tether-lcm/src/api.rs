//! Request and response model for codeletset lifecycle management
//!
//! The types here mirror the wire layout (`wire` module) one to one:
//! every string field has a fixed maximum length and every array field a
//! fixed maximum count. Bounds are enforced twice, once by request
//! validation in the agent and once defensively by the wire decoder.

use crate::stream_id::StreamId;

/// Maximum length of a codeletset name, including the NUL padding byte.
pub const CODELETSET_NAME_LEN: usize = 256;
/// Maximum length of a codelet name.
pub const CODELET_NAME_LEN: usize = 256;
/// Maximum length of a hook name.
pub const HOOK_NAME_LEN: usize = 256;
/// Maximum length of a map name.
pub const MAP_NAME_LEN: usize = 256;
/// Maximum length of an IO channel name.
pub const IO_CHANNEL_NAME_LEN: usize = 256;
/// Maximum length of a file path field.
pub const PATH_LEN: usize = 256;
/// Maximum length of an error message carried in a response.
pub const MAX_ERR_MSG_SIZE: usize = 1024;

/// Maximum number of input or output IO channels per codelet.
pub const MAX_IO_CHANNEL: usize = 5;
/// Maximum number of linked-map declarations per codelet.
pub const MAX_LINKED_MAPS: usize = 10;
/// Maximum number of codelets in a single codeletset.
pub const MAX_CODELETS_IN_CODELETSET: usize = 16;

/// Default codelet priority when the descriptor leaves it unset.
pub const DEFAULT_PRIORITY: u32 = 1;

/// One IO channel declaration of a codelet.
///
/// The channel name must match the map symbol the codelet declares; the
/// stream id routes records to (or from) an external consumer. An
/// optional serde object file is attached verbatim to the channel at
/// creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoChannelDesc {
    /// Channel name, equal to the codelet's map symbol.
    pub name: String,
    /// 16-byte routing identifier.
    pub stream_id: StreamId,
    /// Optional path to a serde object file shipped to the IO layer.
    pub serde_path: Option<String>,
}

/// Declares that a codelet's map is an alias of another codelet's map
/// inside the same codeletset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedMapDesc {
    /// Map name on this codelet's side.
    pub map_name: String,
    /// Codelet owning the other side of the link.
    pub linked_codelet_name: String,
    /// Map name on the linked codelet's side.
    pub linked_map_name: String,
}

/// Descriptor for one codelet inside a load request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeletDesc {
    /// Codelet name, unique within the codeletset.
    pub codelet_name: String,
    /// Name of the hook the codelet attaches to.
    pub hook_name: String,
    /// Path of the codelet object file.
    pub codelet_path: String,
    /// Dispatch priority; higher runs earlier. Defaults to 1.
    pub priority: u32,
    /// Advisory runtime budget in nanoseconds; 0 disables the check.
    pub runtime_threshold: u64,
    /// Input (control) channels, at most [`MAX_IO_CHANNEL`].
    pub in_io_channels: Vec<IoChannelDesc>,
    /// Output channels, at most [`MAX_IO_CHANNEL`].
    pub out_io_channels: Vec<IoChannelDesc>,
    /// Cross-codelet map aliases, at most [`MAX_LINKED_MAPS`].
    pub linked_maps: Vec<LinkedMapDesc>,
}

impl CodeletDesc {
    /// Create a descriptor with default priority and no threshold.
    pub fn new(
        codelet_name: impl Into<String>,
        hook_name: impl Into<String>,
        codelet_path: impl Into<String>,
    ) -> Self {
        Self {
            codelet_name: codelet_name.into(),
            hook_name: hook_name.into(),
            codelet_path: codelet_path.into(),
            priority: DEFAULT_PRIORITY,
            runtime_threshold: 0,
            in_io_channels: Vec::new(),
            out_io_channels: Vec::new(),
            linked_maps: Vec::new(),
        }
    }
}

/// Request to atomically install a named codeletset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeletsetLoadReq {
    /// Codeletset name, unique across the process.
    pub codeletset_id: String,
    /// The codelets to install, between 1 and
    /// [`MAX_CODELETS_IN_CODELETSET`].
    pub codelets: Vec<CodeletDesc>,
}

/// Request to remove a previously installed codeletset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeletsetUnloadReq {
    /// Name of the codeletset to remove.
    pub codeletset_id: String,
}

/// Failure modes of a codeletset load.
///
/// The numeric codes reported by [`LoadError::code`] are part of the
/// management ABI and match the classic taxonomy: −1 unknown hook, −2
/// creation failure, −3 load failure, −4 invalid parameters.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LoadError {
    /// A referenced hook name is not registered with the agent.
    #[error("hook {0} does not exist")]
    HookNotExist(String),

    /// Verifier, JIT, map creation or capacity failure.
    #[error("{0}")]
    CreationFail(String),

    /// Memory exhaustion or linked-map validation mismatch.
    #[error("{0}")]
    LoadFail(String),

    /// String length, bounds or uniqueness violation in the request.
    #[error("{0}")]
    ParamInvalid(String),

    /// A codeletset with this name is already installed. The request is
    /// rejected without touching the installed set.
    #[error("codeletset {0} is already loaded")]
    AlreadyLoaded(String),
}

impl LoadError {
    /// Numeric outcome code of this failure.
    pub fn code(&self) -> i32 {
        match self {
            LoadError::HookNotExist(_) => -1,
            LoadError::CreationFail(_) => -2,
            LoadError::LoadFail(_) | LoadError::AlreadyLoaded(_) => -3,
            LoadError::ParamInvalid(_) => -4,
        }
    }
}

/// Failure modes of a codeletset unload.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum UnloadError {
    /// The codeletset id field is malformed.
    #[error("{0}")]
    ParamInvalid(String),

    /// No codeletset with the requested name is installed.
    #[error("{0}")]
    Fail(String),
}

impl UnloadError {
    /// Numeric outcome code of this failure.
    pub fn code(&self) -> i32 {
        match self {
            UnloadError::ParamInvalid(_) => -4,
            UnloadError::Fail(_) => -1,
        }
    }
}

/// Check one request string field: non-empty and shorter than `maxlen`
/// (one byte is reserved for NUL padding on the wire).
///
/// Returns a descriptive message on violation, phrased from the field
/// name, so callers can copy it straight into an error response.
pub fn validate_string_param(name: &str, value: &str, maxlen: usize) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{name} is not set"));
    }
    if value.len() >= maxlen {
        return Err(format!("{name} exceeds maximum length {maxlen}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_string_param() {
        assert!(validate_string_param("codelet_name", "ok", 16).is_ok());
        assert!(validate_string_param("codelet_name", "", 16)
            .unwrap_err()
            .contains("not set"));
        assert!(validate_string_param("codelet_name", "0123456789abcdef", 16)
            .unwrap_err()
            .contains("maximum length"));
        // Exactly maxlen - 1 still fits with its NUL byte.
        assert!(validate_string_param("codelet_name", "0123456789abcde", 16).is_ok());
    }

    #[test]
    fn test_load_error_codes() {
        assert_eq!(LoadError::HookNotExist("x".into()).code(), -1);
        assert_eq!(LoadError::CreationFail("x".into()).code(), -2);
        assert_eq!(LoadError::LoadFail("x".into()).code(), -3);
        assert_eq!(LoadError::ParamInvalid("x".into()).code(), -4);
        assert_eq!(UnloadError::Fail("x".into()).code(), -1);
    }

    #[test]
    fn test_codelet_desc_defaults() {
        let desc = CodeletDesc::new("c1", "test1", "/tmp/c1.o");
        assert_eq!(desc.priority, DEFAULT_PRIORITY);
        assert_eq!(desc.runtime_threshold, 0);
        assert!(desc.linked_maps.is_empty());
    }
}
