//! Read constraints: the tag + bound-value pairs accepted by `READ`
//! requests.

use serde::{Deserialize, Serialize};

use crate::{LogSeverity, ObjectId, StatisticType, SystemParameter};

/// A kind-scoped selection constraint for a read request.
///
/// Only [`ReadConstraint::ById`] is an *identity* constraint: it names the
/// single object the read targets, which lets the write-back cache answer it
/// from memory. Every other constraint may match zero or more objects and is
/// always forwarded downstream, where it resolves to a batch record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReadConstraint {
    /// Every object of the queue's kind.
    All,
    /// The single object with this id.
    ById(ObjectId),
    /// Objects whose name field equals the value (devices, users).
    ByName(String),
    /// Objects owned by this user (devices, sync jobs).
    ByOwner(ObjectId),
    /// Objects referencing this device (sessions, sync jobs).
    ByDevice(ObjectId),
    /// Sessions belonging to this user.
    ByUser(ObjectId),
    /// Log entries of this severity.
    BySeverity(LogSeverity),
    /// The statistic of this type.
    ByStatistic(StatisticType),
    /// The system setting for this parameter.
    ByParameter(SystemParameter),
}

impl ReadConstraint {
    /// The object id this constraint resolves to, when it is an identity
    /// constraint.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Self::ById(id) => Some(*id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_by_id_is_an_identity_constraint() {
        let id = ObjectId::new();
        assert_eq!(ReadConstraint::ById(id).object_id(), Some(id));
        assert_eq!(ReadConstraint::All.object_id(), None);
        assert_eq!(ReadConstraint::ByOwner(id).object_id(), None);
        assert_eq!(
            ReadConstraint::ByName("core".to_string()).object_id(),
            None
        );
    }
}
