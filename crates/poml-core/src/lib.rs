use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Partition key shared by every anonymous session.
pub const ANONYMOUS_PARTITION: &str = "anonymous";

pub type RecordId = Uuid;

/// The actor a quota and history partition is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    Anonymous,
    Authenticated { id: String, email: String },
}

impl Identity {
    pub fn authenticated(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self::Authenticated {
            id: id.into(),
            email: email.into(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }

    pub fn partition_key(&self) -> String {
        match self {
            Identity::Anonymous => ANONYMOUS_PARTITION.to_string(),
            Identity::Authenticated { id, .. } => format!("user:{id}"),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Anonymous => write!(f, "guest"),
            Identity::Authenticated { email, .. } => write!(f, "{email}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Trial,
    Bonus,
    Pro,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Trial => "trial",
            Tier::Bonus => "bonus",
            Tier::Pro => "pro",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum QuotaDenial {
    #[error("free trial conversions are used up; sign in to continue")]
    TrialExhausted,

    #[error("bonus conversions are used up; upgrade to continue")]
    BonusExhausted,
}

/// Why a remote conversion did not produce a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum FailureKind {
    #[error("endpoint returned HTTP {0}")]
    HttpError(u16),

    #[error("endpoint response did not contain a document")]
    MalformedResponse,

    #[error("no valid response after all retry attempts")]
    ExhaustedRetries,

    #[error("conversion was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionResult {
    Success(String),
    Failure(FailureKind),
}

impl ConversionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ConversionResult::Success(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub identity: Identity,
    pub tier: Tier,
    pub input_text: String,
}

impl ConversionRequest {
    pub fn new(identity: Identity, tier: Tier, input_text: impl Into<String>) -> Self {
        Self {
            identity,
            tier,
            input_text: input_text.into(),
        }
    }
}

/// Durable record of one completed conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRecord {
    pub id: RecordId,
    pub identity: Identity,
    pub input_text: String,
    pub output_document: String,
    pub created_at: DateTime<Utc>,
}

impl ConversionRecord {
    pub fn new(
        identity: Identity,
        input_text: impl Into<String>,
        output_document: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            input_text: input_text.into(),
            output_document: output_document.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug)]
pub enum PomlError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid session transition: {0}")]
    InvalidTransition(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("HTTP client error: {0}")]
    HttpError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, PomlError>;

/// Key-value persistence backing the quota counters.
///
/// A key that was never written reads as zero.
pub trait CounterStore: Send + Sync {
    fn get(&self, key: &str) -> Result<u32>;
    fn set(&self, key: &str, value: u32) -> Result<()>;
}

/// Append-only persistence backing the conversion history.
pub trait HistoryBackend: Send + Sync {
    fn insert(&self, key: &str, record: &ConversionRecord) -> Result<()>;
    /// All records of the partition, oldest first.
    fn list_ordered(&self, key: &str) -> Result<Vec<ConversionRecord>>;
}
