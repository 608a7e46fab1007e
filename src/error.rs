use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Record,
    Collection,
    Sequence,
    Model,
    Flag,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Record => write!(f, "record"),
            ResourceType::Collection => write!(f, "collection"),
            ResourceType::Sequence => write!(f, "sequence"),
            ResourceType::Model => write!(f, "model"),
            ResourceType::Flag => write!(f, "context flag"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricErrorCode {
    NotFound,
    AlreadyExists,
    Conflict,
    InvalidConfig,
    Internal,
    Validation,
    PermissionDenied,
    Serialization,
    Timeout,
    Unavailable,
}

impl FabricErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            FabricErrorCode::NotFound => "not_found",
            FabricErrorCode::AlreadyExists => "already_exists",
            FabricErrorCode::Conflict => "conflict",
            FabricErrorCode::InvalidConfig => "invalid_config",
            FabricErrorCode::Internal => "internal",
            FabricErrorCode::Validation => "validation",
            FabricErrorCode::PermissionDenied => "permission_denied",
            FabricErrorCode::Serialization => "serialization",
            FabricErrorCode::Timeout => "timeout",
            FabricErrorCode::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("{resource_type} '{resource_id}' already exists")]
    AlreadyExists {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("conflict error: {0}")]
    Conflict(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("timeout: {operation}")]
    Timeout { operation: String },
    #[error("resource unavailable: {message}")]
    Unavailable { message: String },
}

impl FabricError {
    pub fn not_found(resource_type: ResourceType, resource_id: impl Into<String>) -> Self {
        FabricError::NotFound {
            resource_type,
            resource_id: resource_id.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        FabricError::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        FabricError::Internal {
            message: message.into(),
        }
    }

    pub fn code(&self) -> FabricErrorCode {
        match self {
            FabricError::NotFound { .. } => FabricErrorCode::NotFound,
            FabricError::AlreadyExists { .. } => FabricErrorCode::AlreadyExists,
            FabricError::Conflict(_) => FabricErrorCode::Conflict,
            FabricError::InvalidConfig { .. } => FabricErrorCode::InvalidConfig,
            FabricError::Internal { .. } => FabricErrorCode::Internal,
            FabricError::Validation(_) => FabricErrorCode::Validation,
            FabricError::PermissionDenied(_) => FabricErrorCode::PermissionDenied,
            FabricError::Serialization(_) => FabricErrorCode::Serialization,
            FabricError::Timeout { .. } => FabricErrorCode::Timeout,
            FabricError::Unavailable { .. } => FabricErrorCode::Unavailable,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FabricError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, FabricError::Conflict(_))
    }
}
