use docform_model::{FieldId, Value};
use std::fmt;

use crate::store::FieldUiState;

/// A field whose effective value or UI state may have changed.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field_id: FieldId,
    /// Effective value after the operation.
    pub value: Value,
    pub ui: FieldUiState,
}

pub type Listener = Box<dyn FnMut(&FieldChange) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Plain callback list. Listeners run synchronously, in subscription order.
#[derive(Default)]
pub struct Listeners {
    next_id: u64,
    entries: Vec<(SubscriptionId, Listener)>,
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}

impl Listeners {
    pub fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub fn emit(&mut self, changes: &[FieldChange]) {
        for change in changes {
            for (_, listener) in &mut self.entries {
                listener(change);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
