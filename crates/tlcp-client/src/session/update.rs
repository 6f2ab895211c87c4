//! Positional reconstruction of subscription updates.

use std::{fmt, sync::Arc};

use crate::{
    diff::apply_patch,
    error::{TlcpError, TlcpResult},
    field_list::FieldList,
    message::UpdateValue,
};

/// Current values of every field of a subscription.
#[derive(Clone, PartialEq, Eq)]
pub struct UpdateMap {
    fields: FieldList,
    values: Arc<[Option<String>]>,
}

impl UpdateMap {
    /// Value of `field`; `None` if the field is unknown or null.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .index_of(field)
            .and_then(|index| self.value(index))
    }

    /// Value at field position `index`.
    pub fn value(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(Option::as_deref)
    }

    pub fn fields(&self) -> &FieldList {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Field names paired with their values, in field list order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.fields
            .iter()
            .zip(self.values.iter().map(Option::as_deref))
    }
}

impl fmt::Debug for UpdateMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Applies update operations to the value slots of one subscription.
#[derive(Debug)]
pub struct UpdateProcessor {
    fields: FieldList,
    values: Vec<Option<String>>,
}

impl UpdateProcessor {
    /// Create a processor for the counts reported by the server.
    pub fn new(item_count: u16, field_count: u16, fields: FieldList) -> TlcpResult<Self> {
        if item_count > 1 {
            return Err(TlcpError::config(format!(
                "Item count {item_count} not supported, expected at most 1"
            )));
        }
        if usize::from(field_count) != fields.len() {
            return Err(TlcpError::protocol(format!(
                "Server reported {field_count} fields, subscribed {}",
                fields.len()
            )));
        }
        Ok(Self {
            fields,
            values: vec![None; usize::from(field_count)],
        })
    }

    /// Apply the values of one update line.
    pub fn apply(&mut self, values: &[UpdateValue]) -> TlcpResult<UpdateMap> {
        let mut position = 0usize;
        for value in values {
            match value {
                UpdateValue::Unchanged(count) => {
                    position += usize::from(*count);
                }
                UpdateValue::Text(text) => {
                    *self.slot(position)? = text.clone();
                    position += 1;
                }
                UpdateValue::Patch { format, diff } => {
                    let slot = self.slot(position)?;
                    let previous = slot.as_deref().ok_or_else(|| {
                        TlcpError::decode(format!("Cannot patch null value at field {position}"))
                    })?;
                    *slot = Some(apply_patch(*format, previous, diff)?);
                    position += 1;
                }
            }
        }
        if position > self.values.len() {
            return Err(TlcpError::decode(format!(
                "Update skips past the last field ({position} > {})",
                self.values.len()
            )));
        }

        Ok(UpdateMap {
            fields: self.fields.clone(),
            values: self.values.as_slice().into(),
        })
    }

    fn slot(&mut self, position: usize) -> TlcpResult<&mut Option<String>> {
        let len = self.values.len();
        self.values.get_mut(position).ok_or_else(|| {
            TlcpError::decode(format!("Update value at {position} exceeds {len} fields"))
        })
    }
}
