//! The name to value mapping handed to request handlers.

use std::collections::{hash_map, HashMap};

use crate::entry::{Entry, FieldValue, FileEntry};

/// Value stored under a part name in a [`MultipartBody`].
#[derive(Debug, Clone)]
pub enum BodyValue {
    /// Plain field value.
    Text(String),

    /// Parsed value of a JSON field.
    Json(serde_json::Value),

    /// Uploaded file.
    File(FileEntry),
}

/// Parsed form, keyed by part name.
///
/// When several parts share a name, the one whose handling completed last is kept. Field parts
/// complete as they arrive but file parts complete only once spooled, so for files this is not
/// necessarily arrival order. The complete sequence is available from
/// [`MultipartContext::entries`](crate::MultipartContext::entries).
#[derive(Debug, Clone, Default)]
pub struct MultipartBody {
    values: HashMap<String, BodyValue>,
}

impl MultipartBody {
    pub(crate) fn from_entries<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Self {
        let mut values = HashMap::new();

        for entry in entries {
            let value = match entry {
                Entry::Field(field) => match field.value() {
                    FieldValue::Text(text) => BodyValue::Text(text.clone()),
                    FieldValue::Json(json) => BodyValue::Json(json.clone()),
                },
                Entry::File(file) => BodyValue::File(file.clone()),
            };

            values.insert(entry.name().to_owned(), value);
        }

        MultipartBody { values }
    }

    pub fn get(&self, name: &str) -> Option<&BodyValue> {
        self.values.get(name)
    }

    /// Returns the value of a plain field.
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            BodyValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the parsed value of a JSON field.
    pub fn json(&self, name: &str) -> Option<&serde_json::Value> {
        match self.values.get(name)? {
            BodyValue::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn file(&self, name: &str) -> Option<&FileEntry> {
        match self.values.get(name)? {
            BodyValue::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, String, BodyValue> {
        self.values.iter()
    }
}

impl<'a> IntoIterator for &'a MultipartBody {
    type Item = (&'a String, &'a BodyValue);
    type IntoIter = hash_map::Iter<'a, String, BodyValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::entry::{FieldEntry, FileMeta};

    fn field(name: &str, value: FieldValue) -> Entry {
        Entry::Field(FieldEntry::new(
            name.to_owned(),
            mime::TEXT_PLAIN,
            "7bit".to_owned(),
            value,
            false,
            false,
        ))
    }

    fn file(name: &str, file_name: &str) -> Entry {
        Entry::File(FileEntry::in_memory(
            FileMeta {
                field_name: name.to_owned(),
                file_name: file_name.to_owned(),
                mime_type: mime::TEXT_PLAIN,
                transfer_encoding: "7bit".to_owned(),
            },
            Bytes::from_static(b"x"),
            std::env::temp_dir().join("unused.part"),
        ))
    }

    #[test]
    fn builds_mapping() {
        let entries = [
            field("a", FieldValue::Text("1".to_owned())),
            field("b", FieldValue::Json(serde_json::json!({ "k": true }))),
            file("c", "c.txt"),
        ];

        let body = MultipartBody::from_entries(&entries);
        assert_eq!(body.len(), 3);
        assert_eq!(body.text("a"), Some("1"));
        assert_eq!(body.json("b"), Some(&serde_json::json!({ "k": true })));
        assert_eq!(body.file("c").unwrap().file_name(), "c.txt");

        // wrong kind
        assert_eq!(body.text("b"), None);
        assert!(body.file("a").is_none());
        assert!(!body.contains("d"));
    }

    #[test]
    fn last_entry_wins() {
        let entries = [
            file("dup", "first.txt"),
            field("dup", FieldValue::Text("middle".to_owned())),
            file("dup", "last.txt"),
        ];

        let body = MultipartBody::from_entries(&entries);
        assert_eq!(body.len(), 1);
        assert_eq!(body.file("dup").unwrap().file_name(), "last.txt");
    }
}
