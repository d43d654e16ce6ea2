//! The error taxonomy carried by failure completions.

use snafu::Snafu;

use crate::ObjectId;

/// Why a storage request failed.
///
/// Every failure completion carries one of these; [`StoreError::object_id`]
/// recovers the associated object id, [`ObjectId::nil`] when none is known.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// READ/UPDATE/DELETE targeted a record that does not exist.
    #[snafu(display("object <{id}> not found"))]
    NotFound {
        /// The missing object.
        id: ObjectId,
    },

    /// INSERT collided with an existing record.
    #[snafu(display("object <{id}> already exists"))]
    AlreadyExists {
        /// The colliding object.
        id: ObjectId,
    },

    /// INSERT/UPDATE targeted an object whose DELETE is queued in the same
    /// cache cycle.
    #[snafu(display("object <{id}> has a delete pending"))]
    ConflictPendingDelete {
        /// The object with the queued delete.
        id: ObjectId,
    },

    /// The caller wrapper gave up before a completion arrived.
    #[snafu(display("request timed out"))]
    Timeout,

    /// The request was submitted after the component was asked to stop.
    #[snafu(display("component is shutting down"))]
    Shutdown,

    /// A backend refused to accept the request synchronously.
    #[snafu(display("backend rejected the request for object <{id}>"))]
    Rejected {
        /// The object the rejected request targeted.
        id: ObjectId,
    },

    /// A backend accepted the request but later reported failure.
    #[snafu(display("backend failed the request for object <{id}>"))]
    BackendFailed {
        /// The object the failed request targeted.
        id: ObjectId,
    },
}

impl StoreError {
    /// The object id associated with this failure, [`ObjectId::nil`] when
    /// unknown.
    pub fn object_id(&self) -> ObjectId {
        match self {
            Self::NotFound { id }
            | Self::AlreadyExists { id }
            | Self::ConflictPendingDelete { id }
            | Self::Rejected { id }
            | Self::BackendFailed { id } => *id,
            Self::Timeout | Self::Shutdown => ObjectId::nil(),
        }
    }
}
