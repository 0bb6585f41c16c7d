//! String transforms.
//!
//! Indices count characters. Concurrent inserts at the same index put the
//! server text first. An insert strictly inside a concurrently removed span is
//! swallowed by the removal. Overlapping removals each drop the characters the
//! other already removed.
//!
//! Splices are handled by one general rule over `(index, deleted, inserted)`
//! triples: disjoint edits shift each other, and a pure insertion inside the
//! other side's deleted span is swallowed as above. Other overlapping edits
//! both rewrite the union of the touched spans to the server text followed by
//! the client text.

use super::{register, TransformPair, TransformRegistry};
use crate::operation::{DiscreteOperation, OperationKind, OperationType};

pub(super) fn register_all(registry: &mut TransformRegistry) {
    use OperationType::*;

    register(registry, StringInsert, StringInsert, insert_insert);
    register(registry, StringInsert, StringRemove, insert_remove);
    register(registry, StringRemove, StringInsert, remove_insert);
    register(registry, StringRemove, StringRemove, remove_remove);

    for other in [StringInsert, StringRemove, StringSplice] {
        register(registry, StringSplice, other, splice);
        register(registry, other, StringSplice, splice);
    }

    for other in [StringInsert, StringRemove, StringSplice] {
        register(registry, StringSet, other, super::server_set_wins);
        register(registry, other, StringSet, super::client_set_wins);
    }
    register(registry, StringSet, StringSet, super::server_set_wins);
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Characters `[from, to)` of `s`
fn slice(s: &str, from: usize, to: usize) -> String {
    s.chars().skip(from).take(to.saturating_sub(from)).collect()
}

fn insert_of(op: &DiscreteOperation) -> (usize, &str) {
    match &op.kind {
        OperationKind::StringInsert { index, value } => (*index, value),
        _ => (0, ""),
    }
}

fn remove_of(op: &DiscreteOperation) -> (usize, &str) {
    match &op.kind {
        OperationKind::StringRemove { index, value } => (*index, value),
        _ => (0, ""),
    }
}

fn insert_at(op: &DiscreteOperation, index: usize, value: String) -> DiscreteOperation {
    op.with_kind(OperationKind::StringInsert { index, value })
}

fn remove_at(op: &DiscreteOperation, index: usize, value: String) -> DiscreteOperation {
    op.with_kind(OperationKind::StringRemove { index, value })
}

// ========== Insert / Remove ==========

fn insert_insert(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    let (si, sv) = insert_of(s);
    let (ci, cv) = insert_of(c);
    if si <= ci {
        (s.clone(), insert_at(c, ci + char_len(sv), cv.to_string()))
    } else {
        (insert_at(s, si + char_len(cv), sv.to_string()), c.clone())
    }
}

/// Insert against a removal, independent of which side is the server.
fn insert_against_remove(
    insert: &DiscreteOperation,
    remove: &DiscreteOperation,
) -> (DiscreteOperation, DiscreteOperation) {
    let (ii, iv) = insert_of(insert);
    let (ri, rv) = remove_of(remove);
    let removed = char_len(rv);

    if ii <= ri {
        (
            insert.clone(),
            remove_at(remove, ri + char_len(iv), rv.to_string()),
        )
    } else if ii >= ri + removed {
        (
            insert_at(insert, ii - removed, iv.to_string()),
            remove.clone(),
        )
    } else {
        // Strictly inside the removed span: the removal takes the text with it.
        let offset = ii - ri;
        let grown = format!("{}{}{}", slice(rv, 0, offset), iv, slice(rv, offset, removed));
        (insert.to_no_op(), remove_at(remove, ri, grown))
    }
}

fn insert_remove(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    insert_against_remove(s, c)
}

fn remove_insert(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    let (c, s) = insert_against_remove(c, s);
    (s, c)
}

/// Remove `a` transformed so it applies after remove `b`.
fn remove_after_remove(a: &DiscreteOperation, b: &DiscreteOperation) -> DiscreteOperation {
    let (ai, av) = remove_of(a);
    let (bi, bv) = remove_of(b);
    let (a_end, b_end) = (ai + char_len(av), bi + char_len(bv));

    // Characters of `b` that sit before `a` shift it left.
    let shift = b_end.min(ai).saturating_sub(bi);
    let overlap_start = ai.max(bi);
    let overlap_end = a_end.min(b_end);

    let remaining = if overlap_start < overlap_end {
        let local_start = overlap_start - ai;
        let local_end = overlap_end - ai;
        format!(
            "{}{}",
            slice(av, 0, local_start),
            slice(av, local_end, char_len(av))
        )
    } else {
        av.to_string()
    };

    if remaining.is_empty() {
        a.to_no_op()
    } else {
        remove_at(a, ai - shift, remaining)
    }
}

fn remove_remove(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    (remove_after_remove(s, c), remove_after_remove(c, s))
}

// ========== Splice ==========

/// Any string edit as `(index, deleted, inserted)`.
fn as_triple(op: &DiscreteOperation) -> (usize, String, String) {
    match &op.kind {
        OperationKind::StringInsert { index, value } => (*index, String::new(), value.clone()),
        OperationKind::StringRemove { index, value } => (*index, value.clone(), String::new()),
        OperationKind::StringSplice {
            index,
            deleted,
            inserted,
        } => (*index, deleted.clone(), inserted.clone()),
        _ => (0, String::new(), String::new()),
    }
}

fn spliced(op: &DiscreteOperation, index: usize, deleted: String, inserted: String) -> DiscreteOperation {
    if deleted == inserted {
        return op.to_no_op();
    }
    op.with_kind(OperationKind::StringSplice {
        index,
        deleted,
        inserted,
    })
}

/// Shift `op` by an edit entirely before it.
fn shifted(op: &DiscreteOperation, delta_removed: usize, delta_inserted: usize) -> DiscreteOperation {
    let (index, deleted, inserted) = as_triple(op);
    let index = index - delta_removed + delta_inserted;
    match &op.kind {
        OperationKind::StringInsert { .. } => insert_at(op, index, inserted),
        OperationKind::StringRemove { .. } => remove_at(op, index, deleted),
        _ => op.with_kind(OperationKind::StringSplice {
            index,
            deleted,
            inserted,
        }),
    }
}

fn splice(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    let (si, sd, sins) = as_triple(s);
    let (ci, cd, cins) = as_triple(c);
    let (sl, cl) = (char_len(&sd), char_len(&cd));

    if si + sl <= ci {
        // Server edit entirely before the client edit (server first on a tie).
        return (s.clone(), shifted(c, sl, char_len(&sins)));
    }
    if ci + cl <= si {
        return (shifted(s, cl, char_len(&cins)), c.clone());
    }

    // A pure insertion strictly inside the other side's deleted span is
    // swallowed, the same as against a plain removal.
    if cl == 0 {
        let offset = ci - si;
        let grown = format!("{}{}{}", slice(&sd, 0, offset), cins, slice(&sd, offset, sl));
        return (spliced(s, si, grown, sins), c.to_no_op());
    }
    if sl == 0 {
        let offset = si - ci;
        let grown = format!("{}{}{}", slice(&cd, 0, offset), sins, slice(&cd, offset, cl));
        return (s.to_no_op(), spliced(c, ci, grown, cins));
    }

    // Overlap: both sides rewrite the union to server text then client text.
    let start = si.min(ci);
    let end = (si + sl).max(ci + cl);
    let merged = format!("{}{}", sins, cins);

    // The union as it reads after the server edit, and after the client edit.
    let after_server = format!(
        "{}{}{}",
        slice(&cd, 0, si.saturating_sub(ci)),
        sins,
        slice(&cd, (si + sl).saturating_sub(ci), end - ci)
    );
    let after_client = format!(
        "{}{}{}",
        slice(&sd, 0, ci.saturating_sub(si)),
        cins,
        slice(&sd, (ci + cl).saturating_sub(si), end - si)
    );

    (
        spliced(s, start, after_client, merged.clone()),
        spliced(c, start, after_server, merged),
    )
}
