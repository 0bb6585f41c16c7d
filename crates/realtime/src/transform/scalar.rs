//! Number, boolean and date transforms.

use super::{register, TransformPair, TransformRegistry};
use crate::operation::{DiscreteOperation, OperationType};

pub(super) fn register_all(registry: &mut TransformRegistry) {
    use OperationType::*;

    register(registry, NumberSet, NumberSet, super::server_set_wins);
    register(registry, NumberSet, NumberDelta, super::server_set_wins);
    register(registry, NumberDelta, NumberSet, super::client_set_wins);
    register(registry, NumberDelta, NumberDelta, delta_delta);

    register(registry, BooleanSet, BooleanSet, super::server_set_wins);
    register(registry, DateSet, DateSet, super::server_set_wins);
}

/// Additions commute.
fn delta_delta(s: &DiscreteOperation, c: &DiscreteOperation) -> TransformPair {
    (s.clone(), c.clone())
}
