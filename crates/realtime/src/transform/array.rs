//! Array transforms.
//!
//! Same-index insert collisions put the server element first. A whole-array
//! set on either side wins over positional edits of the other; between two
//! sets the server wins. Moves are decomposed into a remove followed by an
//! insert and transformed component by component.

use super::{register, TransformPair, TransformRegistry};
use crate::operation::{DiscreteOperation, OperationKind, OperationType};

pub(super) fn register_all(registry: &mut TransformRegistry) {
    use OperationType::*;

    register(registry, ArrayInsert, ArrayInsert, insert_insert);
    register(registry, ArrayInsert, ArrayRemove, insert_remove);
    register(registry, ArrayInsert, ArrayMove, insert_move);
    register(registry, ArrayInsert, ArrayReplace, insert_replace);

    register(registry, ArrayRemove, ArrayInsert, remove_insert);
    register(registry, ArrayRemove, ArrayRemove, remove_remove);
    register(registry, ArrayRemove, ArrayMove, remove_move);
    register(registry, ArrayRemove, ArrayReplace, remove_replace);

    register(registry, ArrayMove, ArrayInsert, move_insert);
    register(registry, ArrayMove, ArrayRemove, move_remove);
    register(registry, ArrayMove, ArrayMove, move_move);
    register(registry, ArrayMove, ArrayReplace, move_replace);

    register(registry, ArrayReplace, ArrayInsert, replace_insert);
    register(registry, ArrayReplace, ArrayRemove, replace_remove);
    register(registry, ArrayReplace, ArrayMove, replace_move);
    register(registry, ArrayReplace, ArrayReplace, replace_replace);

    for other in [ArrayInsert, ArrayRemove, ArrayMove, ArrayReplace] {
        register(registry, ArraySet, other, super::server_set_wins);
        register(registry, other, ArraySet, super::client_set_wins);
    }
    register(registry, ArraySet, ArraySet, super::server_set_wins);
}

fn index_of(op: &DiscreteOperation) -> usize {
    match &op.kind {
        OperationKind::ArrayInsert { index, .. }
        | OperationKind::ArrayRemove { index, .. }
        | OperationKind::ArrayReplace { index, .. } => *index,
        _ => 0,
    }
}

fn move_of(op: &DiscreteOperation) -> (usize, usize) {
    match &op.kind {
        OperationKind::ArrayMove {
            from_index,
            to_index,
        } => (*from_index, *to_index),
        _ => (0, 0),
    }
}

/// Copy of `op` with its index replaced.
fn at(op: &DiscreteOperation, index: usize) -> DiscreteOperation {
    let kind = match &op.kind {
        OperationKind::ArrayInsert { value, .. } => OperationKind::ArrayInsert {
            index,
            value: value.clone(),
        },
        OperationKind::ArrayRemove { old_value, .. } => OperationKind::ArrayRemove {
            index,
            old_value: old_value.clone(),
        },
        OperationKind::ArrayReplace {
            value, old_value, ..
        } => OperationKind::ArrayReplace {
            index,
            value: value.clone(),
            old_value: old_value.clone(),
        },
        other => other.clone(),
    };
    op.with_kind(kind)
}

fn moved(op: &DiscreteOperation, from_index: usize, to_index: usize) -> DiscreteOperation {
    op.with_kind(OperationKind::ArrayMove {
        from_index,
        to_index,
    })
}

/// A replace whose element was concurrently removed puts its value back.
fn replace_as_insert(op: &DiscreteOperation) -> DiscreteOperation {
    match &op.kind {
        OperationKind::ArrayReplace { index, value, .. } => {
            op.with_kind(OperationKind::ArrayInsert {
                index: *index,
                value: value.clone(),
            })
        }
        _ => op.clone(),
    }
}

fn swap(pair: TransformPair) -> TransformPair {
    (pair.1, pair.0)
}

// ========== Index Arithmetic ==========

/// Insert index `s` (server) against insert index `c`; server goes first on a tie.
fn ii(s: usize, c: usize) -> (usize, usize) {
    if s <= c {
        (s, c + 1)
    } else {
        (s + 1, c)
    }
}

/// Insert index against a remove index of a different element.
fn ir(insert: usize, remove: usize) -> (usize, usize) {
    if insert <= remove {
        (insert, remove + 1)
    } else {
        (insert - 1, remove)
    }
}

/// Where the element at `index` ends up after moving `from` to `to`.
fn index_after_move(index: usize, from: usize, to: usize) -> usize {
    if index == from {
        to
    } else if from < to && from < index && index <= to {
        index - 1
    } else if to < from && to <= index && index < from {
        index + 1
    } else {
        index
    }
}

// ========== Insert / Remove / Replace ==========

fn insert_insert(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    let (si, ci) = ii(index_of(s), index_of(c));
    (at(s, si), at(c, ci))
}

fn insert_remove(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    let (si, ci) = ir(index_of(s), index_of(c));
    (at(s, si), at(c, ci))
}

fn remove_insert(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    swap(insert_remove(c, s))
}

fn remove_remove(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    let (si, ci) = (index_of(s), index_of(c));
    if si == ci {
        (s.to_no_op(), c.to_no_op())
    } else if si < ci {
        (s.clone(), at(c, ci - 1))
    } else {
        (at(s, si - 1), c.clone())
    }
}

fn insert_replace(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    let (si, ci) = (index_of(s), index_of(c));
    if si <= ci {
        (s.clone(), at(c, ci + 1))
    } else {
        (s.clone(), c.clone())
    }
}

fn replace_insert(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    swap(insert_replace(c, s))
}

fn remove_replace(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    let (si, ci) = (index_of(s), index_of(c));
    if si == ci {
        (s.to_no_op(), replace_as_insert(c))
    } else if si < ci {
        (s.clone(), at(c, ci - 1))
    } else {
        (s.clone(), c.clone())
    }
}

fn replace_remove(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    let (si, ci) = (index_of(s), index_of(c));
    if si == ci {
        (replace_as_insert(s), c.to_no_op())
    } else if ci < si {
        (at(s, si - 1), c.clone())
    } else {
        (s.clone(), c.clone())
    }
}

fn replace_replace(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    if index_of(s) == index_of(c) {
        (s.clone(), c.to_no_op())
    } else {
        (s.clone(), c.clone())
    }
}

// ========== Moves ==========

fn insert_move(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    let gap = index_of(s);
    let (from, to) = move_of(c);

    if from < to {
        if gap <= from {
            (s.clone(), moved(c, from + 1, to + 1))
        } else if gap <= to {
            (at(s, gap - 1), moved(c, from, to + 1))
        } else {
            (s.clone(), c.clone())
        }
    } else if to < from {
        if gap <= to {
            (s.clone(), moved(c, from + 1, to + 1))
        } else if gap <= from {
            (at(s, gap + 1), moved(c, from + 1, to))
        } else {
            (s.clone(), c.clone())
        }
    } else if gap <= from {
        (s.clone(), moved(c, from + 1, to + 1))
    } else {
        (s.clone(), c.clone())
    }
}

fn move_insert(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    swap(insert_move(c, s))
}

fn remove_move(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    let index = index_of(s);
    let (from, to) = move_of(c);

    if index == from {
        return (at(s, to), c.to_no_op());
    }
    if from < to {
        if index < from {
            (s.clone(), moved(c, from - 1, to - 1))
        } else if index <= to {
            (at(s, index - 1), moved(c, from, to - 1))
        } else {
            (s.clone(), c.clone())
        }
    } else if to < from {
        if index < to {
            (s.clone(), moved(c, from - 1, to - 1))
        } else if index < from {
            (at(s, index + 1), moved(c, from - 1, to))
        } else {
            (s.clone(), c.clone())
        }
    } else if index < from {
        (s.clone(), moved(c, from - 1, to - 1))
    } else {
        (s.clone(), c.clone())
    }
}

fn move_remove(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    swap(remove_move(c, s))
}

fn replace_move(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    let (from, to) = move_of(c);
    (at(s, index_after_move(index_of(s), from, to)), c.clone())
}

fn move_replace(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    swap(replace_move(c, s))
}

/// Both moves are split into remove and insert steps. Each step of one side is
/// transformed against the steps of the other it does not yet account for.
fn move_move(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    let (s_from, s_to) = move_of(s);
    let (c_from, c_to) = move_of(c);

    if s_from == c_from {
        // Both moved the same element; the server's destination wins.
        return (moved(s, c_to, s_to), c.to_no_op());
    }

    // Removes against each other.
    let (s_remove, c_remove) = if s_from < c_from {
        (s_from, c_from - 1)
    } else {
        (s_from - 1, c_from)
    };
    // Server insert against the client remove, after the server remove.
    let (s_insert, c_remove) = ir(s_to, c_remove);
    // Server remove against the client insert, after the client remove.
    let (c_insert, s_remove) = ir(c_to, s_remove);
    // Inserts against each other, after both removes.
    let (s_insert, c_insert) = ii(s_insert, c_insert);

    (moved(s, s_remove, s_insert), moved(c, c_remove, c_insert))
}
