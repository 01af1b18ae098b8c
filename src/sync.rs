//! Contains the blocking API. This is only available when the `sync` feature is enabled.
//!
//! Each entry point is a wrapper around its asynchronous counterpart and runs it to completion
//! on an internal runtime; the semantics of the two surfaces are identical.

use crate::{
    error::Result,
    executor,
    operation::Operation,
    runtime,
    sdam::Topology,
    session::ClientSession,
    ExecutionDetails,
};

/// Execute the given operation, blocking until it completes.
pub fn execute_operation<T, Op>(
    topology: &T,
    op: &mut Op,
    session: Option<&mut ClientSession>,
) -> Result<Op::O>
where
    T: Topology + ?Sized,
    Op: Operation,
{
    runtime::block_on(executor::execute_operation(topology, op, session))
}

/// Execute the given operation, blocking until it completes and returning the server the final
/// attempt ran on alongside the operation's output.
pub fn execute_operation_with_details<T, Op>(
    topology: &T,
    op: &mut Op,
    session: Option<&mut ClientSession>,
) -> Result<ExecutionDetails<Op>>
where
    T: Topology + ?Sized,
    Op: Operation,
{
    runtime::block_on(executor::execute_operation_with_details(
        topology, op, session,
    ))
}

/// Execute the given operation, blocking until it completes and returning the implicit session
/// created for it if one was.
pub fn execute_cursor_operation<T, Op>(
    topology: &T,
    op: &mut Op,
) -> Result<(Op::O, Option<ClientSession>)>
where
    T: Topology + ?Sized,
    Op: Operation,
{
    runtime::block_on(executor::execute_cursor_operation(topology, op))
}

#[cfg(test)]
mod test {
    use bson::doc;

    use crate::test::mock::{explicit_session, primary, TestOperation, TestTopology};

    #[test]
    fn blocking_facade_matches_async_semantics() {
        let topology = TestTopology::new([Ok(primary("a"))]).with_retry_writes(true);
        let mut op = TestOperation::write();
        let mut session = explicit_session();

        let result = super::execute_operation(&topology, &mut op, Some(&mut session)).unwrap();

        assert_eq!(result, doc! { "ok": 1 });
        assert_eq!(session.txn_number(), 1);
    }
}

