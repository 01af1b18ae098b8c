//! Contains the `Error` and `Result` types used by the execution core.

use std::{collections::HashSet, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sdam::{WIRE_VERSION_OP_MSG, WIRE_VERSION_SHARDED_TRANSACTIONS};

const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const NOTWRITABLEPRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];
const SHUTTING_DOWN_CODES: [i32; 2] = [11600, 91];
const RETRYABLE_READ_CODES: [i32; 13] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 134, 262,
];
const RETRYABLE_WRITE_CODES: [i32; 12] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262,
];
const UNKNOWN_TRANSACTION_COMMIT_RESULT_LABEL_CODES: [i32; 3] = [50, 64, 91];

/// The `IllegalOperation` code returned by storage engines that reject transaction numbers
/// outright.
pub(crate) const RETRYABLE_WRITES_UNSUPPORTED_CODE: i32 = 20;

/// The stable message surfaced when a deployment rejects transaction numbers.
pub(crate) const RETRYABLE_WRITES_UNSUPPORTED_MESSAGE: &str =
    "This MongoDB deployment does not support retryable writes. Please add retryWrites=false to \
     your connection string.";

/// Retryable write error label. This label will be added to an error when the error is
/// write-retryable.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Transient transaction error label. This label will be added to a network error or server
/// selection error that occurs during a transaction.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
/// Unknown transaction commit result error label. This label will be added to a server selection
/// error, network error, or write-retryable error that occurs during a commit.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// The result type for all methods that can return an error in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while executing an operation. The inner
/// [`ErrorKind`](enum.ErrorKind.html) is wrapped in a `Box` to allow the errors to be
/// cloned.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,

    labels: HashSet<String>,
}

impl Error {
    /// Constructs a new error from a kind and an optional set of labels.
    ///
    /// Error labels are the only mechanism by which retryability information crosses the wire,
    /// so layers that deserialize server responses must thread the server-provided labels
    /// through here.
    pub fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        Self {
            kind: Box::new(kind),
            labels: labels
                .map(|labels| labels.into_iter().collect())
                .unwrap_or_default(),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    /// Adds the given label to this error.
    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        self.labels.insert(label.as_ref().to_string());
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(..))
    }

    pub(crate) fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ServerSelection { .. })
    }

    /// Gets the code from this error for performing topology updates and retryability
    /// decisions, if applicable.
    pub(crate) fn sdam_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            _ => None,
        }
    }

    /// If this error corresponds to a "not writable primary" error as per the SDAM spec.
    pub(crate) fn is_notwritableprimary(&self) -> bool {
        self.sdam_code()
            .map(|code| NOTWRITABLEPRIMARY_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// If this error corresponds to a "node is recovering" error as per the SDAM spec.
    pub(crate) fn is_recovering(&self) -> bool {
        self.sdam_code()
            .map(|code| RECOVERING_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// If this error corresponds to a "node is shutting down" error as per the SDAM spec.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.sdam_code()
            .map(|code| SHUTTING_DOWN_CODES.contains(&code))
            .unwrap_or(false)
    }

    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_notwritableprimary() || self.is_shutting_down()
    }

    /// Whether a read operation should be retried if this error occurs.
    pub(crate) fn is_read_retryable(&self) -> bool {
        if self.is_network_error() || self.is_state_change_error() {
            return true;
        }
        if self.contains_label(RETRYABLE_WRITE_ERROR) {
            return true;
        }
        match self.sdam_code() {
            Some(code) => RETRYABLE_READ_CODES.contains(&code),
            None => false,
        }
    }

    /// Whether a write operation should be retried if this error occurs.
    ///
    /// Servers at or past the first OP_MSG wire version report retryability through error
    /// labels; older deployments are matched against the legacy retryable code set. The wire
    /// version must be the one observed before the failing attempt, since the failure itself
    /// may reset the server description to Unknown.
    pub(crate) fn is_write_retryable(&self, prior_max_wire_version: i32) -> bool {
        if self.contains_label(RETRYABLE_WRITE_ERROR) || self.is_network_error() {
            return true;
        }
        if prior_max_wire_version < WIRE_VERSION_OP_MSG {
            match self.sdam_code() {
                Some(code) => RETRYABLE_WRITE_CODES.contains(&code),
                None => false,
            }
        } else {
            false
        }
    }

    /// Whether a "RetryableWriteError" label should be added to this error. If max_wire_version
    /// indicates a 4.4+ server, a label should only be added if the error is a network error.
    /// Otherwise, a label should be added if the error is a network error or the error code
    /// matches one of the retryable write codes.
    pub(crate) fn should_add_retryable_write_label(&self, max_wire_version: i32) -> bool {
        if max_wire_version > WIRE_VERSION_SHARDED_TRANSACTIONS {
            return self.is_network_error();
        }
        if self.is_network_error() {
            return true;
        }
        match self.sdam_code() {
            Some(code) => RETRYABLE_WRITE_CODES.contains(&code),
            None => false,
        }
    }

    pub(crate) fn should_add_unknown_transaction_commit_result_label(&self) -> bool {
        if self.contains_label(TRANSIENT_TRANSACTION_ERROR) {
            return false;
        }
        if self.is_network_error()
            || self.is_server_selection_error()
            || self.contains_label(RETRYABLE_WRITE_ERROR)
        {
            return true;
        }
        match self.sdam_code() {
            Some(code) => UNKNOWN_TRANSACTION_COMMIT_RESULT_LABEL_CODES.contains(&code),
            None => false,
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// An operation was attempted with a session that had already been ended.
    #[error("Use of an ended session is not permitted")]
    ExpiredSession,

    /// The server does not support the operation.
    #[error("The server does not support a database operation: {message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// The server returned an invalid reply to a database operation.
    #[error("The server returned an invalid reply to a database operation: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// Wrapper around [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The topology was not able to select a server for the operation.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// A session was provided to an operation on a deployment that does not support sessions.
    #[error("Attempted to use a session on a deployment that does not support sessions")]
    SessionsNotSupported,

    /// An error occurred during a transaction.
    #[error("{message}")]
    #[non_exhaustive]
    Transaction { message: String },
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Error code {} ({}): {}",
            self.code, self.code_name, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_error(code: i32, message: &str) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: String::new(),
            message: message.to_string(),
        })
        .into()
    }

    fn network_error() -> Error {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::ConnectionReset.into())).into()
    }

    #[test]
    fn network_errors_are_retryable_for_reads_and_writes() {
        assert!(network_error().is_read_retryable());
        assert!(network_error().is_write_retryable(9));
        assert!(network_error().is_write_retryable(0));
    }

    #[test]
    fn state_change_errors_are_read_retryable() {
        // NotWritablePrimary and InterruptedAtShutdown
        assert!(command_error(10107, "not writable primary").is_read_retryable());
        assert!(command_error(11600, "interrupted at shutdown").is_read_retryable());
        assert!(!command_error(8000, "something else").is_read_retryable());
    }

    #[test]
    fn labeled_errors_are_write_retryable_regardless_of_wire_version() {
        let mut err = command_error(112, "write conflict");
        assert!(!err.is_write_retryable(9));
        err.add_label(RETRYABLE_WRITE_ERROR);
        assert!(err.is_write_retryable(9));
    }

    #[test]
    fn legacy_code_set_only_applies_before_op_msg() {
        let err = command_error(11600, "interrupted at shutdown");
        assert!(err.is_write_retryable(0));
        assert!(!err.is_write_retryable(WIRE_VERSION_OP_MSG));
    }

    #[test]
    fn session_and_compatibility_errors_are_never_retryable() {
        for kind in [
            ErrorKind::ExpiredSession,
            ErrorKind::SessionsNotSupported,
            ErrorKind::Transaction {
                message: "read preference in a transaction must be primary".to_string(),
            },
            ErrorKind::IncompatibleServer {
                message: "Snapshot reads require MongoDB 5.0 or later".to_string(),
            },
        ] {
            let err = Error::from(kind);
            assert!(!err.is_read_retryable());
            assert!(!err.is_write_retryable(0));
        }
    }

    #[test]
    fn retryable_write_label_rules_follow_wire_version() {
        // 4.4+ servers apply their own labels, so only network errors get one client side.
        assert!(network_error().should_add_retryable_write_label(9));
        assert!(!command_error(11600, "shutdown").should_add_retryable_write_label(9));
        // Older servers rely on the legacy code set.
        assert!(command_error(11600, "shutdown").should_add_retryable_write_label(8));
        assert!(!command_error(8000, "other").should_add_retryable_write_label(8));
    }

    #[test]
    fn label_lookup_is_exact() {
        let mut err = network_error();
        err.add_label(TRANSIENT_TRANSACTION_ERROR);
        assert!(err.contains_label(TRANSIENT_TRANSACTION_ERROR));
        assert!(!err.contains_label(RETRYABLE_WRITE_ERROR));
        assert_eq!(err.labels().len(), 1);
    }
}
