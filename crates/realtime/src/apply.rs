//! Applying operations to a model tree.

use crate::operation::{DiscreteOperation, Operation, OperationKind};
use model_tree::{ModelTree, TreeError, TreeResult};

impl DiscreteOperation {
    /// Apply this edit to `tree`.
    ///
    /// Returns the applied form: the same edit with its old-value fields
    /// replaced by what the tree actually displaced. A no-op applies nothing
    /// and is returned unchanged.
    pub fn apply(&self, tree: &mut ModelTree) -> TreeResult<DiscreteOperation> {
        if self.no_op {
            return Ok(self.clone());
        }
        let target = self.target;
        let applied = match &self.kind {
            OperationKind::ArrayInsert { index, value } => {
                tree.array_insert(target, *index, value.clone())?;
                self.kind.clone()
            }
            OperationKind::ArrayRemove { index, .. } => {
                let old_value = tree.array_remove(target, *index)?;
                OperationKind::ArrayRemove {
                    index: *index,
                    old_value,
                }
            }
            OperationKind::ArrayMove {
                from_index,
                to_index,
            } => {
                tree.array_move(target, *from_index, *to_index)?;
                self.kind.clone()
            }
            OperationKind::ArrayReplace { index, value, .. } => {
                let old_value = tree.array_replace(target, *index, value.clone())?;
                OperationKind::ArrayReplace {
                    index: *index,
                    value: value.clone(),
                    old_value,
                }
            }
            OperationKind::ArraySet { values, .. } => {
                let old_values = tree.array_set(target, values.clone())?;
                OperationKind::ArraySet {
                    values: values.clone(),
                    old_values,
                }
            }
            OperationKind::ObjectAdd { key, value } => {
                tree.object_add(target, key, value.clone())?;
                self.kind.clone()
            }
            OperationKind::ObjectSetProperty { key, value, .. } => {
                let old_value = tree.object_set_property(target, key, value.clone())?;
                OperationKind::ObjectSetProperty {
                    key: key.clone(),
                    value: value.clone(),
                    old_value,
                }
            }
            OperationKind::ObjectRemoveProperty { key, .. } => {
                let old_value = tree.object_remove_property(target, key)?;
                OperationKind::ObjectRemoveProperty {
                    key: key.clone(),
                    old_value,
                }
            }
            OperationKind::ObjectSet { values, .. } => {
                let old_values = tree.object_set(target, values.clone())?;
                OperationKind::ObjectSet {
                    values: values.clone(),
                    old_values,
                }
            }
            OperationKind::StringInsert { index, value } => {
                tree.string_splice(target, *index, 0, value)?;
                self.kind.clone()
            }
            OperationKind::StringRemove { index, value } => {
                let removed = tree.string_splice(target, *index, value.chars().count(), "")?;
                OperationKind::StringRemove {
                    index: *index,
                    value: removed,
                }
            }
            OperationKind::StringSplice {
                index,
                deleted,
                inserted,
            } => {
                let removed =
                    tree.string_splice(target, *index, deleted.chars().count(), inserted)?;
                OperationKind::StringSplice {
                    index: *index,
                    deleted: removed,
                    inserted: inserted.clone(),
                }
            }
            OperationKind::StringSet { value, .. } => {
                let old_value = tree.string_set(target, value.clone())?;
                OperationKind::StringSet {
                    value: value.clone(),
                    old_value,
                }
            }
            OperationKind::NumberSet { value, .. } => {
                let old_value = tree.number_set(target, *value)?;
                OperationKind::NumberSet {
                    value: *value,
                    old_value,
                }
            }
            OperationKind::NumberDelta { delta } => {
                tree.number_add(target, *delta)?;
                self.kind.clone()
            }
            OperationKind::BooleanSet { value, .. } => {
                let old_value = tree.boolean_set(target, *value)?;
                OperationKind::BooleanSet {
                    value: *value,
                    old_value,
                }
            }
            OperationKind::DateSet { value, .. } => {
                let old_value = tree.date_set(target, *value)?;
                OperationKind::DateSet {
                    value: *value,
                    old_value,
                }
            }
        };
        Ok(self.with_kind(applied))
    }
}

impl Operation {
    /// Apply to `tree` atomically.
    ///
    /// Compound members apply in order. If one fails, the members already
    /// applied are rolled back through their inverses and the tree is left as
    /// it was.
    pub fn apply(&self, tree: &mut ModelTree) -> TreeResult<Operation> {
        self.apply_members(tree, false)
    }

    /// Apply a server operation.
    ///
    /// Like [`apply`](Self::apply), except that compound members whose target
    /// node is no longer in the tree become no-ops while the rest still
    /// apply. A discrete operation on a missing node fails with
    /// `NodeNotFound`.
    pub fn apply_remote(&self, tree: &mut ModelTree) -> TreeResult<Operation> {
        self.apply_members(tree, true)
    }

    fn apply_members(&self, tree: &mut ModelTree, skip_detached: bool) -> TreeResult<Operation> {
        match self {
            Operation::Discrete(op) => op.apply(tree).map(Operation::Discrete),
            Operation::Compound(ops) => {
                let mut applied: Vec<DiscreteOperation> = Vec::with_capacity(ops.len());
                for op in ops {
                    match op.apply(tree) {
                        Ok(done) => applied.push(done),
                        Err(TreeError::NodeNotFound(id))
                            if skip_detached && !tree.contains(op.target) =>
                        {
                            tracing::debug!("Skipping compound member on detached node {}", id);
                            applied.push(op.to_no_op());
                        }
                        Err(e) => {
                            roll_back(tree, &applied);
                            return Err(e);
                        }
                    }
                }
                Ok(Operation::Compound(applied))
            }
        }
    }
}

fn roll_back(tree: &mut ModelTree, applied: &[DiscreteOperation]) {
    for done in applied.iter().rev() {
        if let Err(e) = done.inverse().apply(tree) {
            tracing::error!(
                "Failed to roll back {:?} on node {}: {}",
                done.operation_type(),
                done.target,
                e
            );
        }
    }
}
