//! Command-based undo/redo.
//!
//! Commands record what the user did, not the state the engine ended up in. Replaying a command in
//! either direction goes back through the normal write pipeline, so derived values are always
//! recomputed from inputs.

use chrono::{DateTime, Duration, Utc};
use docform_model::{FieldId, Value};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::overrides::{Override, OverrideState};

/// Default number of commands kept on the stack.
pub const DEFAULT_UNDO_CAPACITY: usize = 100;
/// Default window in which consecutive writes to the same field merge into one command.
pub const DEFAULT_MERGE_WINDOW_MS: u64 = 500;

/// Time source for the merge window.
pub trait Clock: Send + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn advance_ms(&self, ms: i64) {
        self.advance(Duration::milliseconds(ms));
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UndoCommand {
    SetValue {
        field_id: FieldId,
        old_value: Value,
        new_value: Value,
    },
    /// Any override lifecycle step. `before`/`after` are the full override records so that
    /// creation and deletion can be replayed too.
    OverrideTransition {
        field_id: FieldId,
        old_state: Option<OverrideState>,
        new_state: Option<OverrideState>,
        old_effective_value: Value,
        before: Option<Override>,
        after: Option<Override>,
    },
    ResolveConflict {
        field_id: FieldId,
        old_report_values: Vec<Value>,
        new_report_values: Vec<Value>,
    },
}

impl UndoCommand {
    pub fn field_id(&self) -> &FieldId {
        match self {
            UndoCommand::SetValue { field_id, .. }
            | UndoCommand::OverrideTransition { field_id, .. }
            | UndoCommand::ResolveConflict { field_id, .. } => field_id,
        }
    }

    /// Whether replaying this command touches the override on its field.
    pub fn touches_override(&self) -> bool {
        !matches!(self, UndoCommand::SetValue { .. })
    }

    /// Short human-readable label for menus ("Undo <description>").
    pub fn description(&self) -> String {
        match self {
            UndoCommand::SetValue { field_id, .. } => format!("edit {field_id}"),
            UndoCommand::OverrideTransition {
                field_id,
                old_state,
                new_state,
                ..
            } if old_state == new_state => format!("change override on {field_id}"),
            UndoCommand::OverrideTransition {
                field_id,
                old_state: Some(old),
                new_state: Some(OverrideState::Pending),
                ..
            } if old.is_applied() => format!("replace override on {field_id}"),
            UndoCommand::OverrideTransition {
                field_id,
                new_state,
                ..
            } => match new_state {
                Some(OverrideState::Accepted) => format!("accept override on {field_id}"),
                Some(OverrideState::Invalid) => format!("reject override on {field_id}"),
                Some(OverrideState::Pending) => format!("correct override on {field_id}"),
                Some(OverrideState::Synced | OverrideState::SyncedFormula) => {
                    format!("sync override on {field_id}")
                }
                None => format!("delete override on {field_id}"),
            },
            UndoCommand::ResolveConflict { field_id, .. } => {
                format!("resolve conflict on {field_id}")
            }
        }
    }

    /// Folds a later write to the same field into this one. Returns false if the commands are not
    /// both `SetValue` on the same field.
    fn absorb(&mut self, later: &UndoCommand) -> bool {
        match (self, later) {
            (
                UndoCommand::SetValue {
                    field_id, new_value, ..
                },
                UndoCommand::SetValue {
                    field_id: later_field,
                    new_value: later_value,
                    ..
                },
            ) if field_id == later_field => {
                *new_value = later_value.clone();
                true
            }
            _ => false,
        }
    }

    fn is_noop(&self) -> bool {
        match self {
            UndoCommand::SetValue {
                old_value,
                new_value,
                ..
            } => old_value == new_value,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    command: UndoCommand,
    at: DateTime<Utc>,
}

/// A bounded, linear undo history with a cursor.
///
/// Entries before the cursor can be undone, entries at or after it can be redone. Pushing a new
/// command discards the redo tail; when the stack is full the oldest entry is evicted.
#[derive(Debug, Clone)]
pub struct UndoStack {
    entries: Vec<Entry>,
    cursor: usize,
    capacity: usize,
    merge_window: Duration,
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new(DEFAULT_UNDO_CAPACITY, DEFAULT_MERGE_WINDOW_MS)
    }
}

impl UndoStack {
    pub fn new(capacity: usize, merge_window_ms: u64) -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
            capacity: capacity.max(1),
            merge_window: window(merge_window_ms),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Shrinking below the current length evicts the oldest entries.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.evict_overflow();
    }

    pub fn set_merge_window_ms(&mut self, merge_window_ms: u64) {
        self.merge_window = window(merge_window_ms);
    }

    /// Records an executed command. Returns true if it was merged into the previous entry.
    pub fn push(&mut self, command: UndoCommand, at: DateTime<Utc>) -> bool {
        let had_redo_tail = self.cursor < self.entries.len();
        self.entries.truncate(self.cursor);

        if !had_redo_tail {
            if let Some(last) = self.entries.last_mut() {
                let elapsed = at.signed_duration_since(last.at);
                if self.merge_window > Duration::zero()
                    && elapsed >= Duration::zero()
                    && elapsed <= self.merge_window
                    && last.command.absorb(&command)
                {
                    last.at = at;
                    if last.command.is_noop() {
                        self.entries.pop();
                    }
                    self.cursor = self.entries.len();
                    log::debug!("merged undo command into previous entry");
                    return true;
                }
            }
        }

        log::debug!("push undo command: {}", command.description());
        self.entries.push(Entry { command, at });
        self.evict_overflow();
        self.cursor = self.entries.len();
        false
    }

    /// Steps the cursor back and returns the command to reverse.
    pub fn undo(&mut self) -> Option<UndoCommand> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        self.entries.get(self.cursor).map(|e| e.command.clone())
    }

    /// Steps the cursor forward and returns the command to re-apply.
    pub fn redo(&mut self) -> Option<UndoCommand> {
        let entry = self.entries.get(self.cursor)?;
        self.cursor += 1;
        Some(entry.command.clone())
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.cursor
            .checked_sub(1)
            .and_then(|idx| self.entries.get(idx))
            .map(|e| e.command.description())
    }

    pub fn redo_description(&self) -> Option<String> {
        self.entries.get(self.cursor).map(|e| e.command.description())
    }

    /// Descriptions of every entry, oldest first.
    pub fn descriptions(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.command.description()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }

    /// Drops every command matching `pred`, keeping the cursor on the same logical position.
    /// Returns how many commands were removed.
    pub fn purge(&mut self, mut pred: impl FnMut(&UndoCommand) -> bool) -> usize {
        let mut removed = 0;
        let mut idx = 0;
        while idx < self.entries.len() {
            if pred(&self.entries[idx].command) {
                self.entries.remove(idx);
                if idx < self.cursor {
                    self.cursor -= 1;
                }
                removed += 1;
            } else {
                idx += 1;
            }
        }
        removed
    }

    /// Drops the override commands of `fields`; used when the overrides themselves are deleted.
    pub fn purge_overrides(&mut self, fields: &[FieldId]) -> usize {
        self.purge(|cmd| cmd.touches_override() && fields.contains(cmd.field_id()))
    }

    fn evict_overflow(&mut self) {
        if self.entries.len() > self.capacity {
            let excess = self.entries.len() - self.capacity;
            self.entries.drain(..excess);
            self.cursor = self.cursor.saturating_sub(excess);
        }
    }
}

fn window(ms: u64) -> Duration {
    Duration::milliseconds(i64::from(u32::try_from(ms).unwrap_or(u32::MAX)))
}
