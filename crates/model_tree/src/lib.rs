//! Model Tree - JSON-like data tree with stable node IDs
//!
//! Every value in a model is a [`DataValue`] carrying a [`NodeId`] that stays
//! stable across edits. Operations address nodes by that id, so the tree only
//! exposes primitive, id-targeted mutations that report what they displaced.

mod error;
mod node_id;
mod tree;
mod value;

pub use error::*;
pub use node_id::*;
pub use tree::*;
pub use value::*;
