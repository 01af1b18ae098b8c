#![doc = include_str!("../README.md")]
#![warn(
    missing_docs,
    rustdoc::missing_crate_level_docs,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
#![allow(clippy::match_like_matches_macro, clippy::derive_partial_eq_without_eq)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod error;
mod executor;
mod operation;
#[cfg(feature = "sync")]
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
mod session;
#[cfg(feature = "sync")]
#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
pub mod sync;
#[cfg(test)]
mod test;

pub use crate::{
    executor::{
        execute_cursor_operation,
        execute_operation,
        execute_operation_with_details,
        ExecutionDetails,
    },
    operation::{Aspect, CommandErrorBody, Operation, OperationWithDefaults},
    sdam::{
        SelectedServer,
        ServerAddress,
        ServerDescription,
        ServerType,
        Topology,
        DEFAULT_PORT,
        MIN_SUPPORTED_WIRE_VERSION,
        WIRE_VERSION_5_0,
        WIRE_VERSION_OP_MSG,
        WIRE_VERSION_RS_TRANSACTIONS,
        WIRE_VERSION_SHARDED_TRANSACTIONS,
        WIRE_VERSION_UNKNOWN,
    },
    selection_criteria::{
        Predicate,
        ReadPreference,
        ReadPreferenceOptions,
        SelectionCriteria,
        TagSet,
    },
    session::{
        ClientSession,
        OwnerTag,
        ServerSession,
        SessionOptions,
        Transaction,
        TransactionState,
    },
};

/// A boxed future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
