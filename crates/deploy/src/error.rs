//! Error taxonomy of the rollup lifecycle.
//!
//! Internals build errors with [`anyhow`] and `.context(...)`; the public operations of the
//! crate return [`RollupError`] so callers (CLI, HTTP façade) can map every failure onto a
//! distinct status code.

use serde::{Deserialize, Serialize};

/// Broad classification of a [`RollupError`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    Precondition,
    ExternalCommand,
    Timeout,
    Cancelled,
    Config,
    Internal,
}

impl ErrorKind {
    /// HTTP-equivalent status code for this kind.
    pub const fn status_code(self) -> u16 {
        match self {
            ErrorKind::InvalidRequest => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Precondition => 412,
            ErrorKind::ExternalCommand => 502,
            ErrorKind::Cancelled => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::Config | ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RollupError {
    /// The request itself is malformed (bad name, chain id out of range, premint collision).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A read targeted something that does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A write (update/delete) targeted a record that does not exist.
    #[error("rollup {0} does not exist")]
    MissingForWrite(String),

    #[error("rollup {0} already exists")]
    AlreadyExists(String),

    /// The stored revision moved since the caller read the record.
    #[error("revision conflict on rollup {name}: expected {expected}, found {found}")]
    Conflict { name: String, expected: u64, found: u64 },

    /// The update would break an invariant of the rollup record.
    #[error("invariant violation on rollup {name}: {reason}")]
    InvariantViolation { name: String, reason: String },

    /// Another mutation of the same rollup is in flight.
    #[error("rollup {0} is busy")]
    Busy(String),

    /// The rollup has not been provisioned far enough for the operation.
    #[error("rollup {name} is not ready: reached step {step}, needs {required}")]
    NotReady {
        name: String,
        step: String,
        required: String,
    },

    #[error("command `{command}` failed ({status}): {stderr}")]
    ExternalCommand {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RollupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RollupError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            RollupError::NotFound(_) => ErrorKind::NotFound,
            RollupError::MissingForWrite(_)
            | RollupError::AlreadyExists(_)
            | RollupError::Conflict { .. }
            | RollupError::InvariantViolation { .. }
            | RollupError::Busy(_)
            | RollupError::NotReady { .. } => ErrorKind::Precondition,
            RollupError::ExternalCommand { .. } => ErrorKind::ExternalCommand,
            RollupError::Timeout { .. } => ErrorKind::Timeout,
            RollupError::Cancelled => ErrorKind::Cancelled,
            RollupError::Config(_) => ErrorKind::Config,
            RollupError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }

    /// True for both a read miss and a write against a missing record.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RollupError::NotFound(_) | RollupError::MissingForWrite(_)
        )
    }
}

pub type RollupResult<T> = Result<T, RollupError>;

pub const RESPONSE_CODE_SUCCEED: &str = "succeed";
pub const RESPONSE_CODE_FAILED: &str = "failed";

/// Response envelope returned by the façade for every operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub msg: String,
    pub code: String,
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn with_data(data: T) -> Self {
        Self {
            msg: "request succeed".to_string(),
            code: RESPONSE_CODE_SUCCEED.to_string(),
            data: Some(data),
        }
    }

    pub fn with_msg(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            code: RESPONSE_CODE_SUCCEED.to_string(),
            data: None,
        }
    }

    /// Failure envelope together with the status code of the error.
    pub fn from_error(err: &RollupError) -> (u16, Self) {
        (
            err.status_code(),
            Self {
                msg: err.to_string(),
                code: RESPONSE_CODE_FAILED.to_string(),
                data: None,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_store_errors_are_precondition_not_read_misses() {
        let missing = RollupError::MissingForWrite("chain-a".to_string());
        assert!(missing.is_not_found());
        assert_eq!(missing.status_code(), 412);

        let read_miss = RollupError::NotFound("rollup chain-a".to_string());
        assert!(read_miss.is_not_found());
        assert_eq!(read_miss.status_code(), 404);

        assert_eq!(
            RollupError::AlreadyExists("chain-a".to_string()).status_code(),
            412
        );
    }

    #[test]
    fn test_taxonomy_maps_to_distinct_codes() {
        let codes = [
            ErrorKind::InvalidRequest,
            ErrorKind::NotFound,
            ErrorKind::Precondition,
            ErrorKind::ExternalCommand,
            ErrorKind::Timeout,
            ErrorKind::Cancelled,
        ]
        .map(ErrorKind::status_code);

        let mut deduped = codes.to_vec();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), codes.len());
    }

    #[test]
    fn test_every_kind_has_a_client_or_server_code() {
        for kind in ErrorKind::iter() {
            let code = kind.status_code();
            assert!((400..600).contains(&code), "{kind} -> {code}");
        }
    }

    #[test]
    fn test_failed_envelope() {
        let err = RollupError::ExternalCommand {
            command: "docker compose up -d".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "no such file".to_string(),
        };
        let (status, response) = ApiResponse::<()>::from_error(&err);
        assert_eq!(status, 502);
        assert_eq!(response.code, RESPONSE_CODE_FAILED);
        assert!(response.msg.contains("docker compose up -d"));

        let json = serde_json::to_value(ApiResponse::with_data(5u64)).unwrap();
        assert_eq!(json["code"], "succeed");
        assert_eq!(json["data"], 5);
    }
}
