//! A trait modeling the behavior of a server side operation.

use serde::Deserialize;

use crate::{
    error::{CommandError, Error, ErrorKind, Result},
    sdam::{SelectedServer, ServerDescription},
    selection_criteria::ReadPreference,
    session::ClientSession,
    BoxFuture,
};

/// A boolean capability flag describing how the execution pipeline must treat an operation.
///
/// Operations are polymorphic by their aspect set rather than by type: the pipeline never asks
/// what an operation *is*, only which aspects it carries.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Aspect {
    /// The operation reads data.
    Read,

    /// The operation writes data.
    Write,

    /// The operation may be retried once on a transient failure.
    Retryable,

    /// The operation opens a server-side cursor.
    CursorCreating,

    /// The operation continues a previously opened cursor and must run on the server that
    /// holds it.
    CursorIterating,

    /// The operation may run on a session whose committed transaction is still pinned.
    BypassPinningCheck,
}

/// The level of retryability an execution has, derived from the operation's aspects, the
/// configured options, and the selected server.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Retryability {
    Write,
    Read,
    None,
}

/// A trait modeling the behavior of a server side operation.
///
/// No methods in this trait should have default behaviors to ensure that wrapper operations
/// replicate all behavior. Default behavior is provided by the `OperationWithDefaults` trait.
pub trait Operation {
    /// The output type of this operation.
    type O;

    /// The name of the server side command associated with this operation.
    const NAME: &'static str;

    /// Runs one attempt of this operation against the given server. This is the single wire
    /// primitive the execution pipeline invokes; everything else is coordination around it.
    fn execute<'a>(
        &'a mut self,
        server: SelectedServer,
        session: Option<&'a mut ClientSession>,
    ) -> BoxFuture<'a, Result<Self::O>>;

    /// Whether this operation carries the given aspect.
    fn has_aspect(&self, aspect: Aspect) -> bool;

    /// The read preference to use for selecting the server that this operation will be
    /// executed on.
    fn read_preference(&self) -> Option<&ReadPreference>;

    /// The server a cursor-iterating operation is bound to. Set by the cursor machinery after
    /// the first execution.
    fn pinned_server(&self) -> Option<&ServerDescription>;

    /// Whether the author of this operation has marked it safe to retry as a read.
    fn can_retry_read(&self) -> bool;

    /// Whether the author of this operation has marked it safe to retry as a write.
    fn can_retry_write(&self) -> bool;

    /// Whether this operation may be routed to a secondary on deployments that accept
    /// writes there.
    fn try_secondary_write(&self) -> bool;

    /// Informs the operation that a retry is armed for it, so the command it builds must carry
    /// the session's transaction number.
    fn set_will_retry_write(&mut self, will_retry: bool);

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self);

    /// The name of this operation.
    fn name(&self) -> &str;
}

/// A mirror of the `Operation` trait, with default behavior where appropriate. Should only be
/// implemented by operation types that do not delegate to other operations.
pub trait OperationWithDefaults {
    /// The output type of this operation.
    type O;

    /// The name of the server side command associated with this operation.
    const NAME: &'static str;

    /// Runs one attempt of this operation against the given server.
    fn execute<'a>(
        &'a mut self,
        server: SelectedServer,
        session: Option<&'a mut ClientSession>,
    ) -> BoxFuture<'a, Result<Self::O>>;

    /// Whether this operation carries the given aspect.
    fn has_aspect(&self, aspect: Aspect) -> bool;

    /// The read preference to use for selecting the server that this operation will be
    /// executed on.
    fn read_preference(&self) -> Option<&ReadPreference> {
        None
    }

    /// The server a cursor-iterating operation is bound to.
    fn pinned_server(&self) -> Option<&ServerDescription> {
        None
    }

    /// Whether the author of this operation has marked it safe to retry as a read.
    fn can_retry_read(&self) -> bool {
        true
    }

    /// Whether the author of this operation has marked it safe to retry as a write.
    fn can_retry_write(&self) -> bool {
        true
    }

    /// Whether this operation may be routed to a secondary on deployments that accept
    /// writes there.
    fn try_secondary_write(&self) -> bool {
        false
    }

    /// Informs the operation that a retry is armed for it.
    fn set_will_retry_write(&mut self, _will_retry: bool) {}

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self) {}

    /// The name of this operation.
    fn name(&self) -> &str {
        Self::NAME
    }
}

impl<T: OperationWithDefaults> Operation for T {
    type O = T::O;
    const NAME: &'static str = T::NAME;
    fn execute<'a>(
        &'a mut self,
        server: SelectedServer,
        session: Option<&'a mut ClientSession>,
    ) -> BoxFuture<'a, Result<Self::O>> {
        self.execute(server, session)
    }
    fn has_aspect(&self, aspect: Aspect) -> bool {
        self.has_aspect(aspect)
    }
    fn read_preference(&self) -> Option<&ReadPreference> {
        self.read_preference()
    }
    fn pinned_server(&self) -> Option<&ServerDescription> {
        self.pinned_server()
    }
    fn can_retry_read(&self) -> bool {
        self.can_retry_read()
    }
    fn can_retry_write(&self) -> bool {
        self.can_retry_write()
    }
    fn try_secondary_write(&self) -> bool {
        self.try_secondary_write()
    }
    fn set_will_retry_write(&mut self, will_retry: bool) {
        self.set_will_retry_write(will_retry)
    }
    fn update_for_retry(&mut self) {
        self.update_for_retry()
    }
    fn name(&self) -> &str {
        self.name()
    }
}

/// A response body useful for deserializing command errors.
#[derive(Deserialize, Debug)]
#[non_exhaustive]
pub struct CommandErrorBody {
    /// The labels attached to the error by the server.
    #[serde(rename = "errorLabels")]
    pub error_labels: Option<Vec<String>>,

    /// The error itself.
    #[serde(flatten)]
    pub command_error: CommandError,
}

impl From<CommandErrorBody> for Error {
    fn from(command_error_response: CommandErrorBody) -> Error {
        Error::new(
            ErrorKind::Command(command_error_response.command_error),
            command_error_response.error_labels,
        )
    }
}
