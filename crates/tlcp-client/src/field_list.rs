//! Canonical, ordered field lists.

use std::{cmp::Ordering, sync::Arc};

/// Deduplicated list of field names with stable indices.
///
/// Names are ordered by their Java-style string hash first and by UTF-16
/// code unit order second, which keeps the index assigned to every field
/// identical to other client implementations talking to the same adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldList {
    fields: Arc<[String]>,
}

impl FieldList {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        fields.sort_by(|a, b| compare_fields(a, b));
        fields.dedup();
        Self {
            fields: fields.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field name at `index`.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    /// Index of `field`, in logarithmic time.
    pub fn index_of(&self, field: &str) -> Option<usize> {
        self.fields
            .binary_search_by(|probe| compare_fields(probe, field))
            .ok()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.index_of(field).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }

    /// Space separated schema as sent on subscription.
    pub(crate) fn schema(&self) -> String {
        self.fields.join(" ")
    }
}

impl<S: Into<String>> FromIterator<S> for FieldList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

fn java_hash(value: &str) -> i32 {
    value
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

fn compare_fields(a: &str, b: &str) -> Ordering {
    java_hash(a)
        .cmp(&java_hash(b))
        .then_with(|| a.encode_utf16().cmp(b.encode_utf16()))
}
