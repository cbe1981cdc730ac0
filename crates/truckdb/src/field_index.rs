//! In-memory inverted index from (box, field, string-value) to the set of
//! tags currently carrying that string at that field, supporting prefix
//! search. Non-string fields are ignored; a tag contributes at most one
//! string per field, so query results never contain duplicates.

use std::collections::{HashMap, HashSet};

use crate::value::Value;

type ValueIndex = HashMap<String, HashSet<String>>;
type FieldIndexForBox = HashMap<String, ValueIndex>;

#[derive(Debug, Default)]
pub struct FieldIndex {
    boxes: HashMap<String, FieldIndexForBox>,
}

impl FieldIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds contributions for every string field of `value` under `tag`.
    pub fn index_value(&mut self, box_id: &str, tag: &str, value: &Value) {
        let Value::Map(entries) = value else {
            return;
        };
        for (field, field_value) in entries {
            if let Value::String(s) = field_value {
                self.boxes
                    .entry(box_id.to_string())
                    .or_default()
                    .entry(field.clone())
                    .or_default()
                    .entry(s.clone())
                    .or_default()
                    .insert(tag.to_string());
            }
        }
    }

    /// Removes contributions for every string field of `value` under `tag`.
    pub fn deindex_value(&mut self, box_id: &str, tag: &str, value: &Value) {
        let Value::Map(entries) = value else {
            return;
        };
        let Some(fields) = self.boxes.get_mut(box_id) else {
            return;
        };
        for (field, field_value) in entries {
            if let Value::String(s) = field_value {
                if let Some(values) = fields.get_mut(field) {
                    if let Some(tags) = values.get_mut(s) {
                        tags.remove(tag);
                        if tags.is_empty() {
                            values.remove(s);
                        }
                    }
                }
            }
        }
    }

    /// Replaces the contributions for `tag`: removes the pre-image, then
    /// indexes the new value. Either side may be `None` (insert or delete).
    pub fn update(&mut self, box_id: &str, tag: &str, old: Option<&Value>, new: Option<&Value>) {
        if let Some(old) = old {
            self.deindex_value(box_id, tag, old);
        }
        if let Some(new) = new {
            self.index_value(box_id, tag, new);
        }
    }

    pub fn remove_box(&mut self, box_id: &str) {
        self.boxes.remove(box_id);
    }

    /// Tags whose `field` string value starts with `prefix`, deduplicated.
    pub fn query_prefix(&self, box_id: &str, field: &str, prefix: &str) -> Vec<String> {
        let Some(values) = self
            .boxes
            .get(box_id)
            .and_then(|fields| fields.get(field))
        else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for (string_value, tags) in values {
            if string_value.starts_with(prefix) {
                for tag in tags {
                    if seen.insert(tag.clone()) {
                        result.push(tag.clone());
                    }
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> Value {
        Value::Map(vec![("name".to_string(), Value::String(name.to_string()))])
    }

    #[test]
    fn prefix_query_finds_matching_tags() {
        let mut idx = FieldIndex::new();
        idx.index_value("users", "u1", &user("Alice"));
        idx.index_value("users", "u2", &user("Alan"));
        idx.index_value("users", "u3", &user("Bob"));

        let mut matches = idx.query_prefix("users", "name", "Al");
        matches.sort();
        assert_eq!(matches, vec!["u1", "u2"]);
    }

    #[test]
    fn update_removes_preimage_before_adding_new() {
        let mut idx = FieldIndex::new();
        idx.index_value("users", "u1", &user("Alice"));
        idx.update("users", "u1", Some(&user("Alice")), Some(&user("Bob")));

        assert!(idx.query_prefix("users", "name", "Al").is_empty());
        assert_eq!(idx.query_prefix("users", "name", "Bo"), vec!["u1"]);
    }

    #[test]
    fn delete_removes_all_contributions() {
        let mut idx = FieldIndex::new();
        idx.index_value("users", "u1", &user("Alice"));
        idx.update("users", "u1", Some(&user("Alice")), None);
        assert!(idx.query_prefix("users", "name", "Al").is_empty());
    }

    #[test]
    fn non_string_fields_are_ignored() {
        let mut idx = FieldIndex::new();
        let value = Value::Map(vec![("age".to_string(), Value::Int(30))]);
        idx.index_value("users", "u1", &value);
        assert!(idx.query_prefix("users", "age", "").is_empty());
    }

    #[test]
    fn remove_box_drops_all_fields() {
        let mut idx = FieldIndex::new();
        idx.index_value("users", "u1", &user("Alice"));
        idx.remove_box("users");
        assert!(idx.query_prefix("users", "name", "Al").is_empty());
    }

    #[test]
    fn empty_prefix_matches_every_value() {
        let mut idx = FieldIndex::new();
        idx.index_value("users", "u1", &user("Alice"));
        idx.index_value("users", "u2", &user("Bob"));
        let mut matches = idx.query_prefix("users", "name", "");
        matches.sort();
        assert_eq!(matches, vec!["u1", "u2"]);
    }
}
