//! The operation execution pipeline: validation, session acquisition, server selection, the
//! single-retry state machine, and implicit session teardown.

use crate::{
    error::{
        Error,
        ErrorKind,
        Result,
        RETRYABLE_WRITES_UNSUPPORTED_CODE,
        RETRYABLE_WRITES_UNSUPPORTED_MESSAGE,
        RETRYABLE_WRITE_ERROR,
        TRANSIENT_TRANSACTION_ERROR,
        UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    operation::{Aspect, Operation, Retryability},
    sdam::{SelectedServer, Topology, WIRE_VERSION_UNKNOWN},
    selection_criteria::{secondary_writable_server_selector, ReadPreference, SelectionCriteria},
    session::{ClientSession, OwnerTag, SessionOptions, TransactionState},
};

pub(crate) const EXECUTION_TRACING_EVENT_TARGET: &str = "mongodb::execution";

/// The outcome of a successful execution.
#[non_exhaustive]
pub struct ExecutionDetails<Op: Operation> {
    /// The operation's output.
    pub output: Op::O,

    /// The server the successful attempt ran on.
    pub server: SelectedServer,

    /// The implicit session minted for this execution, when it is handed back to the caller
    /// rather than ended.
    pub implicit_session: Option<ClientSession>,
}

/// Execute the given operation.
///
/// Server selection will be performed using the criteria derived from the operation's aspects
/// and read preference, and an implicit session will be created if the topology supports
/// sessions and an explicit session is not provided.
pub async fn execute_operation<T, Op>(
    topology: &T,
    op: &mut Op,
    session: Option<&mut ClientSession>,
) -> Result<Op::O>
where
    T: Topology + ?Sized,
    Op: Operation,
{
    execute_operation_with_details(topology, op, session)
        .await
        .map(|details| details.output)
}

/// Execute the given operation, returning the server the final attempt ran on alongside the
/// operation's output.
pub async fn execute_operation_with_details<T, Op>(
    topology: &T,
    op: &mut Op,
    mut session: Option<&mut ClientSession>,
) -> Result<ExecutionDetails<Op>>
where
    T: Topology + ?Sized,
    Op: Operation,
{
    validate(op)?;
    check_session_support(topology, session.as_deref()).await?;

    let owner = OwnerTag::new();
    let mut implicit_session = None;

    if topology.has_session_support() {
        if let Some(ref s) = session {
            if s.has_ended() {
                return Err(ErrorKind::ExpiredSession.into());
            }
            if s.snapshot_enabled() && !topology.supports_snapshot_reads() {
                return Err(ErrorKind::IncompatibleServer {
                    message: "Snapshot reads require MongoDB 5.0 or later".to_string(),
                }
                .into());
            }
        } else {
            implicit_session = Some(topology.start_session(
                SessionOptions::builder()
                    .owner(owner.clone())
                    .implicit(true)
                    .build(),
            ));
            session = implicit_session.as_mut();
        }
    } else if session.is_some() {
        return Err(ErrorKind::SessionsNotSupported.into());
    }

    let result = execute_with_selection(topology, op, session).await;

    // An implicit session is ended on every exit path of the execution that created it. The
    // end-session error is reported only when the result is otherwise successful.
    match implicit_session {
        Some(mut implicit) if implicit.owner_matches(&owner) => {
            let end_result = topology.end_session(&mut implicit).await;
            implicit.mark_ended();
            if let Err(ref end_err) = end_result {
                tracing::debug!(
                    target: EXECUTION_TRACING_EVENT_TARGET,
                    error = %end_err,
                    "failed to end implicit session"
                );
            }
            match (result, end_result) {
                (Err(err), _) => Err(err),
                (Ok(_), Err(err)) => Err(err),
                (Ok((output, server)), Ok(())) => Ok(ExecutionDetails {
                    output,
                    server,
                    implicit_session: None,
                }),
            }
        }
        implicit_session => result.map(|(output, server)| ExecutionDetails {
            output,
            server,
            implicit_session,
        }),
    }
}

/// Execute the given operation, returning the implicit session created for it if one was.
///
/// The session is minted without this execution's owner tag, so teardown leaves it alive: the
/// cursor that owns the operation's result assumes responsibility for ending it.
pub async fn execute_cursor_operation<T, Op>(
    topology: &T,
    op: &mut Op,
) -> Result<(Op::O, Option<ClientSession>)>
where
    T: Topology + ?Sized,
    Op: Operation,
{
    validate(op)?;
    check_session_support(topology, None).await?;

    let mut implicit_session = if topology.has_session_support() {
        Some(topology.start_session(SessionOptions::builder().implicit(true).build()))
    } else {
        None
    };

    let (output, _server) = execute_with_selection(topology, op, implicit_session.as_mut()).await?;
    Ok((output, implicit_session))
}

fn validate<Op: Operation>(op: &Op) -> Result<()> {
    if op.has_aspect(Aspect::CursorIterating) && op.pinned_server().is_none() {
        return Err(Error::invalid_argument(format!(
            "{} iterates a cursor but is not bound to a server",
            op.name()
        )));
    }
    Ok(())
}

/// Forces topology discovery when it is not yet known whether the deployment supports
/// sessions.
async fn check_session_support<T>(topology: &T, session: Option<&ClientSession>) -> Result<()>
where
    T: Topology + ?Sized,
{
    while topology.should_check_for_session_support() {
        let criteria =
            SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred { options: None });
        topology.select_server(&criteria, session).await?;
    }
    Ok(())
}

fn selection_criteria_for<T, Op>(topology: &T, op: &Op) -> SelectionCriteria
where
    T: Topology + ?Sized,
    Op: Operation,
{
    if let Some(pinned) = op
        .pinned_server()
        .filter(|_| op.has_aspect(Aspect::CursorIterating))
    {
        // Getting more from a cursor must happen on the server that holds it.
        SelectionCriteria::from_address(pinned.address.clone())
    } else if op.try_secondary_write() {
        secondary_writable_server_selector(topology.common_wire_version(), op.read_preference())
    } else {
        SelectionCriteria::ReadPreference(
            op.read_preference()
                .cloned()
                .unwrap_or(ReadPreference::Primary),
        )
    }
}

/// Computes the retryability level for an execution of `op` against `server`.
fn retryability_for<T, Op>(
    topology: &T,
    op: &Op,
    server: &SelectedServer,
    session: Option<&ClientSession>,
) -> Retryability
where
    T: Topology + ?Sized,
    Op: Operation,
{
    let session = match session {
        Some(s) => s,
        None => return Retryability::None,
    };
    if !op.has_aspect(Aspect::Retryable) || session.in_transaction() {
        return Retryability::None;
    }

    // Reads are retried unless the option was explicitly disabled; writes only when it was
    // explicitly enabled.
    if op.has_aspect(Aspect::Read)
        && topology.retry_reads() != Some(false)
        && server.description().supports_retryable_reads()
        && op.can_retry_read()
    {
        return Retryability::Read;
    }
    if op.has_aspect(Aspect::Write)
        && topology.retry_writes() == Some(true)
        && server.description().supports_retryable_writes()
        && op.can_retry_write()
    {
        return Retryability::Write;
    }
    Retryability::None
}

/// Selects a server and executes the given operation on it, optionally using a provided
/// session. Retries the operation upon failure if retryability is supported.
async fn execute_with_selection<T, Op>(
    topology: &T,
    op: &mut Op,
    mut session: Option<&mut ClientSession>,
) -> Result<(Op::O, SelectedServer)>
where
    T: Topology + ?Sized,
    Op: Operation,
{
    if let Some(ref mut s) = session {
        if s.in_transaction()
            && op
                .read_preference()
                .map_or(false, |rp| rp != &ReadPreference::Primary)
        {
            return Err(ErrorKind::Transaction {
                message: "read preference in a transaction must be primary".to_string(),
            }
            .into());
        }

        // A pin outlives its transaction until the next operation comes through.
        if s.is_pinned()
            && s.transaction.is_committed()
            && !op.has_aspect(Aspect::BypassPinningCheck)
        {
            s.unpin();
        }
    }

    let criteria = selection_criteria_for(topology, op);

    let server = topology.select_server(&criteria, session.as_deref()).await?;

    let retryability = retryability_for(topology, op, &server, session.as_deref());

    // The failure we are about to observe may reset the server description to Unknown, so the
    // wire version is taken now.
    let prior_max_wire_version = server
        .description()
        .max_wire_version
        .unwrap_or(WIRE_VERSION_UNKNOWN);

    if retryability == Retryability::Write {
        op.set_will_retry_write(true);
        if let Some(ref mut s) = session {
            s.advance_txn_number();
        }
    }

    if let Some(ref mut s) = session {
        s.update_last_use();
    }

    match op.execute(server.clone(), session.as_deref_mut()).await {
        Ok(output) => Ok((output, server)),
        Err(mut err) => {
            if err.is_network_error() {
                if let Some(ref mut s) = session {
                    s.mark_dirty();
                }
            }

            err.add_labels_and_update_pin(&mut session, retryability, prior_max_wire_version);

            // Retryable writes are only supported by storage engines with document-level
            // locking, so users need to disable retryable writes if using mmapv1.
            if retryability == Retryability::Write {
                if let ErrorKind::Command(ref mut command_error) = *err.kind {
                    if command_error.code == RETRYABLE_WRITES_UNSUPPORTED_CODE
                        && command_error.message.starts_with("Transaction numbers")
                    {
                        command_error.message = RETRYABLE_WRITES_UNSUPPORTED_MESSAGE.to_string();
                    }
                }
            }

            if retryability == Retryability::None {
                return Err(err);
            }

            retry_operation(
                topology,
                op,
                session,
                err,
                &criteria,
                retryability,
                prior_max_wire_version,
            )
            .await
        }
    }
}

/// Runs the single second attempt permitted after a retryable failure. There is no third try;
/// the second attempt's outcome is surfaced directly.
async fn retry_operation<T, Op>(
    topology: &T,
    op: &mut Op,
    mut session: Option<&mut ClientSession>,
    first_error: Error,
    criteria: &SelectionCriteria,
    retryability: Retryability,
    prior_max_wire_version: i32,
) -> Result<(Op::O, SelectedServer)>
where
    T: Topology + ?Sized,
    Op: Operation,
{
    let retryable = match retryability {
        Retryability::Write => first_error.is_write_retryable(prior_max_wire_version),
        Retryability::Read => first_error.is_read_retryable(),
        Retryability::None => false,
    };
    if !retryable {
        return Err(first_error);
    }

    // A fresh cursor may land on a new connection, so the pinned one is released and its pool
    // cleared rather than leaked.
    if first_error.is_network_error() && op.has_aspect(Aspect::CursorCreating) {
        if let Some(ref mut s) = session {
            if s.is_pinned() && !s.in_transaction() {
                s.unpin_and_clear();
            }
        }
    }

    tracing::debug!(
        target: EXECUTION_TRACING_EVENT_TARGET,
        operation = op.name(),
        error = %first_error,
        "retrying operation after retryable error"
    );

    let server = topology.select_server(criteria, session.as_deref()).await?;

    // The first server supported the armed retry kind; the replacement must too.
    match retryability {
        Retryability::Read if !server.description().supports_retryable_reads() => {
            return Err(Error::invalid_response(
                "Selected server does not support retryable reads",
            ));
        }
        Retryability::Write if !server.description().supports_retryable_writes() => {
            return Err(Error::invalid_response(
                "Selected server does not support retryable writes",
            ));
        }
        _ => {}
    }

    op.update_for_retry();
    if let Some(ref mut s) = session {
        s.update_last_use();
    }

    let max_wire_version = server
        .description()
        .max_wire_version
        .unwrap_or(WIRE_VERSION_UNKNOWN);

    match op.execute(server.clone(), session.as_deref_mut()).await {
        Ok(output) => Ok((output, server)),
        Err(mut err) => {
            if err.is_network_error() {
                if let Some(ref mut s) = session {
                    s.mark_dirty();
                }
            }
            err.add_labels_and_update_pin(&mut session, retryability, max_wire_version);
            Err(err)
        }
    }
}

impl Error {
    /// Adds the necessary labels to this error, and unpins the session if needed.
    ///
    /// A TransientTransactionError label should be added if a transaction is in progress and
    /// the error is a network or server selection error. A RetryableWriteError label should be
    /// added while a retryable write is armed: on pre-4.4 servers to any write-retryable error,
    /// and on newer servers to network errors only.
    ///
    /// If the TransientTransactionError or UnknownTransactionCommitResult labels are added, the
    /// session is unpinned.
    fn add_labels_and_update_pin(
        &mut self,
        session: &mut Option<&mut ClientSession>,
        retryability: Retryability,
        max_wire_version: i32,
    ) {
        let transaction_state = session
            .as_ref()
            .map_or(&TransactionState::None, |s| &s.transaction.state);

        match transaction_state {
            TransactionState::Starting | TransactionState::InProgress => {
                if self.is_network_error() || self.is_server_selection_error() {
                    self.add_label(TRANSIENT_TRANSACTION_ERROR);
                }
            }
            TransactionState::Committed => {
                if self.should_add_retryable_write_label(max_wire_version) {
                    self.add_label(RETRYABLE_WRITE_ERROR);
                }
                if self.should_add_unknown_transaction_commit_result_label() {
                    self.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
                }
            }
            TransactionState::Aborted => {
                if self.should_add_retryable_write_label(max_wire_version) {
                    self.add_label(RETRYABLE_WRITE_ERROR);
                }
            }
            TransactionState::None => {
                if retryability == Retryability::Write
                    && self.should_add_retryable_write_label(max_wire_version)
                {
                    self.add_label(RETRYABLE_WRITE_ERROR);
                }
            }
        }

        if let Some(ref mut session) = session {
            if self.contains_label(TRANSIENT_TRANSACTION_ERROR)
                || self.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
            {
                session.unpin();
            }
        }
    }
}
