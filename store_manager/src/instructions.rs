//! Instruction-handler surface consumed by the rest of the server.
//!
//! These handlers are pure adapters over the synchronous wrappers on
//! [`StoreManager`]; they carry no logic of their own.

use data_types::{EntityKind, ObjectId, ReadConstraint, SharedRecord, StoreError};

use crate::StoreManager;

/// A storage instruction issued by another server component.
#[derive(Debug, Clone)]
pub enum ManagerInstruction {
    /// Fetch the record with `id`.
    Get { kind: EntityKind, id: ObjectId },
    /// Fetch the records matching `constraint`.
    Query {
        kind: EntityKind,
        constraint: ReadConstraint,
    },
    /// Insert a new record under its own kind.
    Add { record: SharedRecord },
    /// Update an existing record under its own kind.
    Update { record: SharedRecord },
    /// Delete the record with `id`.
    Remove { kind: EntityKind, id: ObjectId },
}

/// What an instruction produced.
#[derive(Debug, Clone)]
pub enum InstructionOutcome {
    /// A read resolved to this record (single or batch).
    Record(SharedRecord),
    /// A write completed.
    Done,
}

impl StoreManager {
    /// Execute one instruction by forwarding to the matching wrapper.
    pub fn handle_instruction(
        &self,
        instruction: ManagerInstruction,
    ) -> Result<InstructionOutcome, StoreError> {
        match instruction {
            ManagerInstruction::Get { kind, id } => {
                self.get(kind, id).map(InstructionOutcome::Record)
            }
            ManagerInstruction::Query { kind, constraint } => {
                self.query(kind, constraint).map(InstructionOutcome::Record)
            }
            ManagerInstruction::Add { record } => {
                self.add(record).map(|_| InstructionOutcome::Done)
            }
            ManagerInstruction::Update { record } => {
                self.update(record).map(|_| InstructionOutcome::Done)
            }
            ManagerInstruction::Remove { kind, id } => {
                self.remove(kind, id).map(|_| InstructionOutcome::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManagerConfig;
    use assert_matches::assert_matches;
    use data_types::{Record, StatisticRecord, StatisticType};
    use std::sync::Arc;
    use store_backend::mem::MemBackend;
    use store_backend::StoreBackend;

    #[test]
    fn instructions_forward_to_the_wrappers() {
        let manager = StoreManager::new(ManagerConfig::default());
        manager
            .attach_backend(
                Arc::new(MemBackend::new(EntityKind::Statistic)) as Arc<dyn StoreBackend>,
                false,
            )
            .expect("attaches");

        let record = Arc::new(Record::Statistic(StatisticRecord::new(
            StatisticType::TotalTransferredFiles,
            42,
            7,
        )));
        let id = record.object_id();

        assert_matches!(
            manager.handle_instruction(ManagerInstruction::Add { record }),
            Ok(InstructionOutcome::Done)
        );
        assert_matches!(
            manager.handle_instruction(ManagerInstruction::Get {
                kind: EntityKind::Statistic,
                id,
            }),
            Ok(InstructionOutcome::Record(r)) if r.object_id() == id
        );
        assert_matches!(
            manager.handle_instruction(ManagerInstruction::Remove {
                kind: EntityKind::Statistic,
                id,
            }),
            Ok(InstructionOutcome::Done)
        );
        assert_matches!(
            manager.handle_instruction(ManagerInstruction::Get {
                kind: EntityKind::Statistic,
                id,
            }),
            Err(StoreError::NotFound { .. })
        );
    }
}
