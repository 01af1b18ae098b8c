//! Logical sessions and their transaction state.

use std::time::Instant;

use bson::{doc, spec::BinarySubtype, Binary, Bson, Document};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::sdam::ServerAddress;

/// A process-unique value identifying which component created a session and is responsible for
/// ending it. Teardown compares tags rather than session identities, so a caller-supplied
/// session that happens to share structure with an implicit one is never ended by accident.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OwnerTag(Uuid);

impl OwnerTag {
    /// Mints a fresh, process-unique tag.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerTag {
    fn default() -> Self {
        Self::new()
    }
}

/// Client side abstraction of a server session. These are pooled and may be associated with
/// multiple `ClientSession`s over the course of their lifetime.
#[derive(Clone, Debug)]
pub struct ServerSession {
    /// The id of the server session to which this corresponds.
    id: Document,

    /// The transaction number of the most recent retryable operation run with this session.
    txn_number: i64,

    /// The last time an operation was executed with this session.
    last_use: Instant,

    /// Whether a network error was encountered while using this session.
    dirty: bool,
}

impl ServerSession {
    /// Creates a new session, generating the id client side.
    pub fn new() -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            txn_number: 0,
            last_use: Instant::now(),
            dirty: false,
        }
    }

    /// The id of this session.
    pub fn id(&self) -> &Document {
        &self.id
    }

    /// The current transaction number of this session.
    pub fn txn_number(&self) -> i64 {
        self.txn_number
    }

    /// The last time an operation was executed with this session.
    pub fn last_use(&self) -> Instant {
        self.last_use
    }

    /// Whether a network error was encountered while using this session. Dirty sessions must be
    /// discarded by the pool rather than reused.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl Default for ServerSession {
    fn default() -> Self {
        Self::new()
    }
}

/// The transaction state of a session.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub enum TransactionState {
    /// No transaction is in progress.
    #[default]
    None,

    /// A transaction has been started but no operation has run in it yet.
    Starting,

    /// A transaction is in progress.
    InProgress,

    /// The transaction was committed.
    Committed,

    /// The transaction was aborted.
    Aborted,
}

/// The transaction sub-state of a session. Driven by the transaction operations in the layer
/// above this crate; the execution core only reads it and performs unpinning.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct Transaction {
    /// The current state of the transaction.
    pub state: TransactionState,
}

impl Transaction {
    pub(crate) fn in_transaction(&self) -> bool {
        matches!(
            self.state,
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    pub(crate) fn is_committed(&self) -> bool {
        self.state == TransactionState::Committed
    }
}

/// Options for creating a [`ClientSession`].
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default))]
#[non_exhaustive]
pub struct SessionOptions {
    /// The tag of the component that owns the session and must end it, if any.
    #[builder(setter(strip_option))]
    pub owner: Option<OwnerTag>,

    /// Whether the session is created by the driver rather than the application.
    pub implicit: bool,

    /// Whether all reads in the session should see a single point-in-time snapshot.
    pub snapshot: bool,
}

/// Session to be used with operation execution. This acts as a handle to a server session and
/// carries the transaction and pinning state the execution pipeline consults.
#[derive(Debug)]
pub struct ClientSession {
    server_session: ServerSession,

    owner: Option<OwnerTag>,
    implicit: bool,
    ended: bool,
    snapshot: bool,

    /// The transaction sub-state of this session.
    pub transaction: Transaction,

    pinned_server: Option<ServerAddress>,
}

impl ClientSession {
    /// Creates a new `ClientSession` wrapping the provided server session.
    pub fn new(server_session: ServerSession, options: SessionOptions) -> Self {
        Self {
            server_session,
            owner: options.owner,
            implicit: options.implicit,
            ended: false,
            snapshot: options.snapshot,
            transaction: Transaction::default(),
            pinned_server: None,
        }
    }

    /// The id of this session.
    pub fn id(&self) -> &Document {
        self.server_session.id()
    }

    /// Whether this session was created implicitly by the driver or explicitly by the user.
    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    /// The tag of the component that owns this session, if any.
    pub fn owner(&self) -> Option<&OwnerTag> {
        self.owner.as_ref()
    }

    pub(crate) fn owner_matches(&self, tag: &OwnerTag) -> bool {
        self.owner.as_ref() == Some(tag)
    }

    /// Whether this session has been ended. An ended session may not be used.
    pub fn has_ended(&self) -> bool {
        self.ended
    }

    /// Marks this session as ended. Called on the teardown path that returns the session to
    /// the pool.
    pub fn mark_ended(&mut self) {
        self.ended = true;
    }

    /// Whether reads in this session are pinned to a single point-in-time snapshot.
    pub fn snapshot_enabled(&self) -> bool {
        self.snapshot
    }

    /// The current transaction number of this session.
    pub fn txn_number(&self) -> i64 {
        self.server_session.txn_number
    }

    /// Increments the session's transaction number and returns the new value.
    ///
    /// The number is never decremented; a retried write reuses the number of its first attempt
    /// so the server can deduplicate it.
    pub fn advance_txn_number(&mut self) -> i64 {
        self.server_session.txn_number += 1;
        self.server_session.txn_number
    }

    /// Whether a transaction is currently active on this session.
    pub fn in_transaction(&self) -> bool {
        self.transaction.in_transaction()
    }

    /// The server this session is pinned to, if any.
    pub fn pinned_server(&self) -> Option<&ServerAddress> {
        self.pinned_server.as_ref()
    }

    /// Whether this session is pinned to a server.
    pub fn is_pinned(&self) -> bool {
        self.pinned_server.is_some()
    }

    /// Pins this session to the given server so that subsequent statements in a sharded
    /// transaction land consistently.
    pub fn pin_server(&mut self, address: ServerAddress) {
        self.pinned_server = Some(address);
    }

    /// Releases the pinned server, if any.
    pub fn unpin(&mut self) {
        self.pinned_server = None;
    }

    /// Releases the pinned server and marks the underlying server session dirty so the pool
    /// clears the connections associated with it.
    pub fn unpin_and_clear(&mut self) {
        self.pinned_server = None;
        self.mark_dirty();
    }

    /// Marks this session (and the underlying server session) as dirty.
    pub fn mark_dirty(&mut self) {
        self.server_session.dirty = true;
    }

    /// Whether a network error was encountered while using this session.
    pub fn is_dirty(&self) -> bool {
        self.server_session.dirty
    }

    /// Updates the date that the underlying server session was last used as part of an
    /// operation sent to the server.
    pub(crate) fn update_last_use(&mut self) {
        self.server_session.last_use = Instant::now();
    }

    /// The server session backing this session. Session pools read this when checking the
    /// session back in.
    pub fn server_session(&self) -> &ServerSession {
        &self.server_session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_numbers_strictly_increase() {
        let mut session = ClientSession::new(ServerSession::new(), SessionOptions::default());
        assert_eq!(session.txn_number(), 0);
        assert_eq!(session.advance_txn_number(), 1);
        assert_eq!(session.advance_txn_number(), 2);
        assert_eq!(session.txn_number(), 2);
    }

    #[test]
    fn forced_unpin_marks_the_server_session_dirty() {
        let mut session = ClientSession::new(ServerSession::new(), SessionOptions::default());
        session.pin_server(ServerAddress::new("mongos.example.com", None));
        assert!(session.is_pinned());

        session.unpin_and_clear();
        assert!(!session.is_pinned());
        assert!(session.is_dirty());
    }

    #[test]
    fn lazy_unpin_leaves_the_session_clean() {
        let mut session = ClientSession::new(ServerSession::new(), SessionOptions::default());
        session.pin_server(ServerAddress::new("mongos.example.com", None));
        session.unpin();
        assert!(!session.is_pinned());
        assert!(!session.is_dirty());
    }

    #[test]
    fn ownership_is_compared_by_tag() {
        let tag = OwnerTag::new();
        let session = ClientSession::new(
            ServerSession::new(),
            SessionOptions::builder().owner(tag.clone()).implicit(true).build(),
        );
        assert!(session.owner_matches(&tag));
        assert!(!session.owner_matches(&OwnerTag::new()));
    }
}
