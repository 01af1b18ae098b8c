//! Cluster-view types and the `Topology` contract consumed by the execution core.

use std::{fmt, time::Duration};

use typed_builder::TypedBuilder;

use crate::{
    error::Result,
    selection_criteria::SelectionCriteria,
    session::{ClientSession, SessionOptions},
    BoxFuture,
};

/// Sentinel wire version for servers whose feature level has not been observed.
pub const WIRE_VERSION_UNKNOWN: i32 = 0;

/// The first wire version that speaks OP_MSG (MongoDB 3.6).
pub const WIRE_VERSION_OP_MSG: i32 = 6;

/// The first wire version that supports replica set transactions (MongoDB 4.0).
pub const WIRE_VERSION_RS_TRANSACTIONS: i32 = 7;

/// The first wire version that supports sharded transactions (MongoDB 4.2).
pub const WIRE_VERSION_SHARDED_TRANSACTIONS: i32 = 8;

/// The wire version of MongoDB 5.0.
pub const WIRE_VERSION_5_0: i32 = 13;

/// The minimum wire version supported by this driver.
pub const MIN_SUPPORTED_WIRE_VERSION: i32 = WIRE_VERSION_OP_MSG;

/// The default port to connect to a server on.
pub const DEFAULT_PORT: u16 = 27017;

/// An address to a MongoDB server.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    #[non_exhaustive]
    Tcp {
        /// The hostname or IP address where the MongoDB server can be found.
        host: String,

        /// The TCP port that the MongoDB server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
}

impl ServerAddress {
    /// Constructs an address from a host and an optional port.
    pub fn new(host: impl Into<String>, port: impl Into<Option<u16>>) -> Self {
        Self::Tcp {
            host: host.into(),
            port: port.into(),
        }
    }

    /// The hostname of this address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    /// The port of this address.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
            }
        }
    }
}

/// The type of a server as reported by the most recent handshake.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica-set server.
    Standalone,

    /// A router to a sharded cluster.
    Mongos,

    /// The primary of a replica set.
    RsPrimary,

    /// A secondary of a replica set.
    RsSecondary,

    /// A non-data-bearing arbiter of a replica set.
    RsArbiter,

    /// A replica set member in some other state (e.g. hidden or rolling back).
    RsOther,

    /// A load balancer fronting the cluster.
    LoadBalancer,

    /// A server whose state is not currently known.
    #[default]
    Unknown,
}

impl ServerType {
    /// Whether a server of this type stores data and can service operations.
    pub fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    /// Whether an operation can be sent to a server of this type at all.
    pub fn is_available(self) -> bool {
        self != ServerType::Unknown
    }
}

/// A description of the most recently known state of a server.
#[derive(Clone, Debug, PartialEq, TypedBuilder)]
#[non_exhaustive]
pub struct ServerDescription {
    /// The address of this server.
    pub address: ServerAddress,

    /// The type reported by the most recent handshake.
    #[builder(default)]
    pub server_type: ServerType,

    /// The maximum wire version that the server understands, if known.
    #[builder(default)]
    pub max_wire_version: Option<i32>,

    /// How long the server retains an unused logical session. Absent when the server (or the
    /// deployment) does not support sessions.
    #[builder(default)]
    pub logical_session_timeout: Option<Duration>,
}

impl ServerDescription {
    /// Whether the server can service retryable reads.
    pub(crate) fn supports_retryable_reads(&self) -> bool {
        self.max_wire_version
            .map_or(false, |version| version >= WIRE_VERSION_OP_MSG)
    }

    /// Whether the server advertises support for retryable writes. Standalone servers never do,
    /// since there is no oplog to replay a retried write against.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.server_type != ServerType::Standalone
            && self.logical_session_timeout.is_some()
            && self.supports_retryable_reads()
    }
}

/// A handle to a server returned by server selection. The handle stays valid for the duration
/// of one attempt; the execution pipeline re-selects before any second attempt.
#[derive(Clone, Debug)]
pub struct SelectedServer {
    description: ServerDescription,
}

impl SelectedServer {
    /// Wraps a server description selected for an operation.
    pub fn new(description: ServerDescription) -> Self {
        Self { description }
    }

    /// The description of the selected server.
    pub fn description(&self) -> &ServerDescription {
        &self.description
    }

    /// The address of the selected server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }
}

/// The view of the cluster consumed by the execution core.
///
/// Implementations own server discovery and monitoring, the connection pools, and the session
/// pool; the execution core only coordinates. All methods that can suspend return a
/// [`BoxFuture`].
pub trait Topology: Send + Sync {
    /// Selects a server according to the given criteria, blocking until one is available or the
    /// selection timeout elapses.
    fn select_server<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
        session: Option<&'a ClientSession>,
    ) -> BoxFuture<'a, Result<SelectedServer>>;

    /// Whether it is not yet known if the deployment supports sessions. When this returns true
    /// the executor performs a server selection to force that determination to be made.
    fn should_check_for_session_support(&self) -> bool;

    /// Whether the deployment supports logical sessions.
    fn has_session_support(&self) -> bool;

    /// Whether every data-bearing server in the deployment supports snapshot reads.
    fn supports_snapshot_reads(&self) -> bool;

    /// The greatest wire version spoken by every known server, if any server has been observed.
    fn common_wire_version(&self) -> Option<i32>;

    /// The configured retryable-reads setting. Reads are retried unless this is
    /// explicitly `false`.
    fn retry_reads(&self) -> Option<bool>;

    /// The configured retryable-writes setting. Writes are retried only when this is
    /// explicitly `true`.
    fn retry_writes(&self) -> Option<bool>;

    /// Checks a session out of the session pool.
    fn start_session(&self, options: SessionOptions) -> ClientSession;

    /// Returns a session to the session pool. Dirty or expired server sessions are discarded
    /// rather than reused.
    fn end_session<'a>(&'a self, session: &'a mut ClientSession) -> BoxFuture<'a, Result<()>>;
}
