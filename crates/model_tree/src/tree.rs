//! Model tree storage and primitive mutations

use crate::{DataValue, NodeId, TreeError, TreeResult, Value, ValueKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The complete data tree of one model.
///
/// Mutations address a node by id and return whatever they displaced, which is
/// what callers need to build exact inverses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTree {
    root: DataValue,
}

impl ModelTree {
    pub fn new(root: DataValue) -> Self {
        Self { root }
    }

    /// Create a tree whose root is an empty object
    pub fn empty() -> Self {
        Self::new(DataValue::object(Vec::<(String, DataValue)>::new()))
    }

    pub fn root(&self) -> &DataValue {
        &self.root
    }

    pub fn root_id(&self) -> NodeId {
        self.root.id
    }

    pub fn into_root(self) -> DataValue {
        self.root
    }

    pub fn find(&self, id: NodeId) -> Option<&DataValue> {
        self.root.find(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.find(id).is_some()
    }

    fn node_mut(&mut self, id: NodeId) -> TreeResult<&mut DataValue> {
        self.root.find_mut(id).ok_or(TreeError::NodeNotFound(id))
    }

    fn array_mut(&mut self, id: NodeId) -> TreeResult<&mut Vec<DataValue>> {
        match &mut self.node_mut(id)?.value {
            Value::Array(items) => Ok(items),
            other => Err(mismatch(id, ValueKind::Array, other)),
        }
    }

    fn object_mut(&mut self, id: NodeId) -> TreeResult<&mut BTreeMap<String, DataValue>> {
        match &mut self.node_mut(id)?.value {
            Value::Object(map) => Ok(map),
            other => Err(mismatch(id, ValueKind::Object, other)),
        }
    }

    fn string_mut(&mut self, id: NodeId) -> TreeResult<&mut String> {
        match &mut self.node_mut(id)?.value {
            Value::String(s) => Ok(s),
            other => Err(mismatch(id, ValueKind::String, other)),
        }
    }

    fn number_mut(&mut self, id: NodeId) -> TreeResult<&mut f64> {
        match &mut self.node_mut(id)?.value {
            Value::Number(n) => Ok(n),
            other => Err(mismatch(id, ValueKind::Number, other)),
        }
    }

    // ========== Arrays ==========

    pub fn array_insert(&mut self, id: NodeId, index: usize, value: DataValue) -> TreeResult<()> {
        let items = self.array_mut(id)?;
        if index > items.len() {
            return Err(out_of_bounds(id, index, items.len()));
        }
        items.insert(index, value);
        Ok(())
    }

    pub fn array_remove(&mut self, id: NodeId, index: usize) -> TreeResult<DataValue> {
        let items = self.array_mut(id)?;
        if index >= items.len() {
            return Err(out_of_bounds(id, index, items.len()));
        }
        Ok(items.remove(index))
    }

    /// Move one element so that it ends up at `to`
    pub fn array_move(&mut self, id: NodeId, from: usize, to: usize) -> TreeResult<()> {
        let items = self.array_mut(id)?;
        let len = items.len();
        if from >= len {
            return Err(out_of_bounds(id, from, len));
        }
        if to >= len {
            return Err(out_of_bounds(id, to, len));
        }
        let moved = items.remove(from);
        items.insert(to, moved);
        Ok(())
    }

    pub fn array_replace(
        &mut self,
        id: NodeId,
        index: usize,
        value: DataValue,
    ) -> TreeResult<DataValue> {
        let items = self.array_mut(id)?;
        match items.get_mut(index) {
            Some(slot) => Ok(std::mem::replace(slot, value)),
            None => Err(out_of_bounds(id, index, items.len())),
        }
    }

    pub fn array_set(&mut self, id: NodeId, values: Vec<DataValue>) -> TreeResult<Vec<DataValue>> {
        let items = self.array_mut(id)?;
        Ok(std::mem::replace(items, values))
    }

    // ========== Objects ==========

    /// Add a property that must not exist yet
    pub fn object_add(&mut self, id: NodeId, key: &str, value: DataValue) -> TreeResult<()> {
        let map = self.object_mut(id)?;
        if map.contains_key(key) {
            return Err(TreeError::KeyExists {
                node_id: id,
                key: key.to_string(),
            });
        }
        map.insert(key.to_string(), value);
        Ok(())
    }

    /// Set a property, returning the previous value if there was one
    pub fn object_set_property(
        &mut self,
        id: NodeId,
        key: &str,
        value: DataValue,
    ) -> TreeResult<Option<DataValue>> {
        let map = self.object_mut(id)?;
        Ok(map.insert(key.to_string(), value))
    }

    pub fn object_remove_property(&mut self, id: NodeId, key: &str) -> TreeResult<DataValue> {
        let map = self.object_mut(id)?;
        map.remove(key).ok_or_else(|| TreeError::KeyNotFound {
            node_id: id,
            key: key.to_string(),
        })
    }

    pub fn object_set(
        &mut self,
        id: NodeId,
        values: BTreeMap<String, DataValue>,
    ) -> TreeResult<BTreeMap<String, DataValue>> {
        let map = self.object_mut(id)?;
        Ok(std::mem::replace(map, values))
    }

    // ========== Strings ==========

    /// Remove `delete_count` characters at `index` and insert `insert` there.
    /// Indices count characters, not bytes. Returns the removed text.
    pub fn string_splice(
        &mut self,
        id: NodeId,
        index: usize,
        delete_count: usize,
        insert: &str,
    ) -> TreeResult<String> {
        let s = self.string_mut(id)?;
        let len = s.chars().count();
        let end = index + delete_count;
        if end > len {
            return Err(out_of_bounds(id, end, len));
        }
        let start_byte = byte_offset(s, index);
        let end_byte = byte_offset(s, end);
        let removed = s[start_byte..end_byte].to_string();
        s.replace_range(start_byte..end_byte, insert);
        Ok(removed)
    }

    pub fn string_set(&mut self, id: NodeId, value: String) -> TreeResult<String> {
        let s = self.string_mut(id)?;
        Ok(std::mem::replace(s, value))
    }

    // ========== Scalars ==========

    pub fn number_set(&mut self, id: NodeId, value: f64) -> TreeResult<f64> {
        let n = self.number_mut(id)?;
        Ok(std::mem::replace(n, value))
    }

    pub fn number_add(&mut self, id: NodeId, delta: f64) -> TreeResult<()> {
        *self.number_mut(id)? += delta;
        Ok(())
    }

    pub fn boolean_set(&mut self, id: NodeId, value: bool) -> TreeResult<bool> {
        match &mut self.node_mut(id)?.value {
            Value::Boolean(b) => Ok(std::mem::replace(b, value)),
            other => Err(mismatch(id, ValueKind::Boolean, other)),
        }
    }

    pub fn date_set(&mut self, id: NodeId, value: DateTime<Utc>) -> TreeResult<DateTime<Utc>> {
        match &mut self.node_mut(id)?.value {
            Value::Date(d) => Ok(std::mem::replace(d, value)),
            other => Err(mismatch(id, ValueKind::Date, other)),
        }
    }
}

impl Default for ModelTree {
    fn default() -> Self {
        Self::empty()
    }
}

fn mismatch(node_id: NodeId, expected: ValueKind, actual: &Value) -> TreeError {
    TreeError::TypeMismatch {
        node_id,
        expected,
        actual: actual.kind(),
    }
}

fn out_of_bounds(node_id: NodeId, index: usize, len: usize) -> TreeError {
    TreeError::IndexOutOfBounds {
        node_id,
        index,
        len,
    }
}

/// Byte offset of the `char_index`-th character; callers check bounds first
fn byte_offset(s: &str, char_index: usize) -> usize {
    s.char_indices()
        .nth(char_index)
        .map(|(byte, _)| byte)
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tree() -> (ModelTree, NodeId, NodeId) {
        let list = DataValue::array(["a", "b", "c"].map(DataValue::string));
        let text = DataValue::string("héllo");
        let (list_id, text_id) = (list.id, text.id);
        let tree = ModelTree::new(DataValue::object([("list", list), ("text", text)]));
        (tree, list_id, text_id)
    }

    fn strings(tree: &ModelTree, id: NodeId) -> Vec<String> {
        match &tree.find(id).unwrap().value {
            Value::Array(items) => items
                .iter()
                .map(|v| match &v.value {
                    Value::String(s) => s.clone(),
                    _ => panic!("expected string"),
                })
                .collect(),
            _ => panic!("expected array"),
        }
    }

    // ========== Array Tests ==========

    #[test]
    fn test_array_insert_and_remove() {
        let (mut tree, list, _) = make_tree();
        tree.array_insert(list, 1, DataValue::string("x")).unwrap();
        assert_eq!(strings(&tree, list), ["a", "x", "b", "c"]);

        let removed = tree.array_remove(list, 0).unwrap();
        assert_eq!(removed.value, Value::String("a".into()));
        assert_eq!(strings(&tree, list), ["x", "b", "c"]);
    }

    #[test]
    fn test_array_bounds() {
        let (mut tree, list, _) = make_tree();
        assert!(matches!(
            tree.array_insert(list, 4, DataValue::null()),
            Err(TreeError::IndexOutOfBounds { index: 4, len: 3, .. })
        ));
        assert!(tree.array_remove(list, 3).is_err());
        assert!(tree.array_move(list, 0, 3).is_err());
    }

    #[test]
    fn test_array_move() {
        let (mut tree, list, _) = make_tree();
        tree.array_move(list, 0, 2).unwrap();
        assert_eq!(strings(&tree, list), ["b", "c", "a"]);
        tree.array_move(list, 2, 0).unwrap();
        assert_eq!(strings(&tree, list), ["a", "b", "c"]);
    }

    #[test]
    fn test_type_mismatch() {
        let (mut tree, _, text) = make_tree();
        let err = tree.array_insert(text, 0, DataValue::null()).unwrap_err();
        assert_eq!(
            err,
            TreeError::TypeMismatch {
                node_id: text,
                expected: ValueKind::Array,
                actual: ValueKind::String,
            }
        );
    }

    // ========== Object Tests ==========

    #[test]
    fn test_object_properties() {
        let (mut tree, _, _) = make_tree();
        let root = tree.root_id();

        tree.object_add(root, "n", DataValue::number(1.0)).unwrap();
        assert!(tree.object_add(root, "n", DataValue::number(2.0)).is_err());

        let old = tree.object_set_property(root, "n", DataValue::number(3.0)).unwrap();
        assert_eq!(old.map(|v| v.value), Some(Value::Number(1.0)));

        let removed = tree.object_remove_property(root, "n").unwrap();
        assert_eq!(removed.value, Value::Number(3.0));
        assert!(matches!(
            tree.object_remove_property(root, "n"),
            Err(TreeError::KeyNotFound { .. })
        ));
    }

    // ========== String Tests ==========

    #[test]
    fn test_string_splice_counts_chars() {
        let (mut tree, _, text) = make_tree();
        let removed = tree.string_splice(text, 1, 2, "EY").unwrap();
        assert_eq!(removed, "él");
        assert_eq!(tree.find(text).unwrap().value, Value::String("hEYlo".into()));
        assert!(tree.string_splice(text, 4, 2, "").is_err());
    }

    #[test]
    fn test_scalar_setters() {
        let number = DataValue::number(1.0);
        let flag = DataValue::boolean(false);
        let (n, b) = (number.id, flag.id);
        let mut tree = ModelTree::new(DataValue::array([number, flag]));

        tree.number_add(n, 2.5).unwrap();
        assert_eq!(tree.number_set(n, 10.0).unwrap(), 3.5);
        assert!(!tree.boolean_set(b, true).unwrap());
        assert!(tree.number_add(b, 1.0).is_err());
    }
}
