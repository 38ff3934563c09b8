use docform_model::{FieldId, Schema, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::ast::Formula;
use crate::control::{
    evaluate_chain_from, evaluate_single, ChainWave, ControlError, ControlRule, ControlRules,
    EffectResult, EffectType,
};
use crate::error::{CoreError, CoreResult};
use crate::eval::{evaluate, FormulaError, ValueResolver};
use crate::graph::{CycleError, DependencyGraph};
use crate::notify::{FieldChange, Listener, Listeners, SubscriptionId};
use crate::overrides::{
    resolve_effective, Conflict, Override, OverrideBook, OverrideError, OverrideState,
};
use crate::settings::{EngineSettings, SettingsError};
use crate::snapshot::Snapshot;
use crate::store::{FieldUiState, FieldValueStore};
use crate::undo::{Clock, SystemClock, UndoCommand, UndoStack};
use crate::validation::{SchemaValidator, ValidationResult, Validator};

/// Effective values as formulas and control rules see them.
struct EffectiveView<'a> {
    store: &'a FieldValueStore,
    overrides: &'a OverrideBook,
}

impl ValueResolver for EffectiveView<'_> {
    fn get_field_value(&self, field: &FieldId) -> Option<Value> {
        let slot = self.store.slot(field.as_str())?;
        Some(resolve_effective(
            self.overrides.get(field.as_str()),
            slot.computed.as_ref(),
            &slot.raw,
        ))
    }
}

/// Fields touched by one propagation, plus the chain error if the depth bound was hit.
#[derive(Default)]
struct Propagation {
    touched: BTreeSet<FieldId>,
    error: Option<ControlError>,
}

/// The computation core for one working set.
///
/// Every mutation runs the same pipeline: store the input, recompute dependent formulas in
/// dependency order, run the control chain, recompute what the chain changed, refresh override
/// system values and notify listeners.
pub struct Engine {
    schema: Schema,
    formulas: BTreeMap<FieldId, Formula>,
    graph: DependencyGraph,
    controls: ControlRules,
    store: FieldValueStore,
    overrides: OverrideBook,
    undo: UndoStack,
    settings: EngineSettings,
    clock: Box<dyn Clock>,
    validator: Box<dyn Validator>,
    listeners: Listeners,
    dirty: bool,
}

impl Engine {
    /// Builds an engine for `schema`, registering every formula the schema declares.
    pub fn new(schema: Schema) -> CoreResult<Self> {
        let mut formulas = BTreeMap::new();
        for def in schema.fields() {
            if let Some(source) = &def.formula {
                let formula = parse_for(&def.id, source)?;
                formulas.insert(def.id.clone(), formula);
            }
        }
        check_references(&schema, formulas.values())?;
        let graph = build_graph(&schema, &formulas)?;
        let settings = EngineSettings::default();

        let mut engine = Self {
            store: FieldValueStore::from_schema(&schema),
            schema,
            formulas,
            graph,
            controls: ControlRules::new(),
            overrides: OverrideBook::new(),
            undo: UndoStack::new(settings.undo_capacity, settings.merge_window_ms),
            settings,
            clock: Box::new(SystemClock),
            validator: Box::new(SchemaValidator),
            listeners: Listeners::default(),
            dirty: false,
        };
        engine.recompute_all();
        Ok(engine)
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Result<Self, SettingsError> {
        self.set_settings(settings)?;
        Ok(self)
    }

    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    #[must_use]
    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: EngineSettings) -> Result<(), SettingsError> {
        settings.validate()?;
        self.undo.set_capacity(settings.undo_capacity);
        self.undo.set_merge_window_ms(settings.merge_window_ms);
        self.settings = settings;
        Ok(())
    }

    pub fn set_clock(&mut self, clock: impl Clock + 'static) {
        self.clock = Box::new(clock);
    }

    pub fn set_validator(&mut self, validator: impl Validator + 'static) {
        self.validator = Box::new(validator);
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn dependency_graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn control_rules(&self) -> &ControlRules {
        &self.controls
    }

    /// Attaches (or replaces) the formula of `field`.
    ///
    /// Parse errors, references to unknown fields and cycles are rejected and leave the engine
    /// unchanged.
    pub fn register_formula(&mut self, field: &str, source: &str) -> CoreResult<()> {
        let id = self.require_field(field)?;
        let formula = parse_for(&id, source)?;
        check_references(&self.schema, [&formula])?;

        let mut formulas = self.formulas.clone();
        formulas.insert(id.clone(), formula);
        let graph = build_graph(&self.schema, &formulas)?;

        log::debug!("registered formula for `{id}`: {source}");
        self.formulas = formulas;
        self.graph = graph;
        if let Some(entry) = self.overrides.get_mut(field) {
            entry.is_formula_field = true;
        }
        self.recompute_field_and_dependents(&id);
        Ok(())
    }

    /// Drops the formula of `field`; it becomes an input field again. Returns false if it had
    /// none.
    pub fn remove_formula(&mut self, field: &str) -> CoreResult<bool> {
        let id = self.require_field(field)?;
        if self.formulas.remove(&id).is_none() {
            return Ok(false);
        }
        self.graph = build_graph(&self.schema, &self.formulas)?;
        self.store.clear_computed(id.as_str());
        if let Some(entry) = self.overrides.get_mut(field) {
            entry.is_formula_field = false;
        }
        self.recompute_field_and_dependents(&id);
        Ok(true)
    }

    pub fn formula(&self, field: &str) -> Option<&Formula> {
        self.formulas.get(field)
    }

    pub fn is_formula_field(&self, field: &str) -> bool {
        self.formulas.contains_key(field)
    }

    /// Registers a control rule. Unknown fields, ill-typed mappings and rule cycles are
    /// rejected.
    pub fn add_control_rule(&mut self, rule: ControlRule) -> CoreResult<()> {
        self.require_field(rule.source_field.as_str())?;
        self.require_field(rule.target_field.as_str())?;
        self.controls.add(rule)
    }

    /// Override value if applied, else formula result, else raw value. `Null` for unknown fields.
    pub fn get_effective_value(&self, field: &str) -> Value {
        let id = FieldId::from(field);
        self.view().get_field_value(&id).unwrap_or(Value::Null)
    }

    pub fn raw_value(&self, field: &str) -> Option<&Value> {
        self.store.raw(field)
    }

    pub fn computed_value(&self, field: &str) -> Option<&Value> {
        self.store.computed(field)
    }

    /// The error of the last evaluation of `field`'s formula, if it failed.
    pub fn formula_error(&self, field: &str) -> Option<&FormulaError> {
        self.store.formula_error(field)
    }

    pub fn field_ui_state(&self, field: &str) -> Option<&FieldUiState> {
        self.store.ui(field)
    }

    pub fn get_validation_state(&self, field: &str) -> CoreResult<ValidationResult> {
        let id = self.require_field(field)?;
        Ok(self.validate_value(&id, &self.get_effective_value(field)))
    }

    pub fn get_override(&self, field: &str) -> Option<&Override> {
        self.overrides.get(field)
    }

    pub fn overrides(&self) -> impl Iterator<Item = &Override> {
        self.overrides.iter()
    }

    pub fn conflict(&self, field: &str) -> Option<Conflict> {
        self.overrides.get(field).and_then(Override::conflict)
    }

    /// True when something changed since the last save or session start.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writes a user value and runs the full pipeline as one undoable step.
    ///
    /// Writing the current value is a no-op. When the control chain hits its depth bound the
    /// write and the effects produced so far are kept (and undoable), and the error is returned.
    pub fn set_raw_value(
        &mut self,
        field: &str,
        value: impl Into<Value>,
    ) -> CoreResult<Vec<FieldChange>> {
        let id = self.require_field(field)?;
        if self.is_formula_field(field) {
            return Err(CoreError::FormulaField(id));
        }
        let value = value.into();
        let old_value = self.store.raw(field).cloned().unwrap_or_default();
        if old_value == value {
            return Ok(Vec::new());
        }

        self.store.set_raw(field, value.clone());
        let propagation = self.propagate_from(&id);
        self.undo.push(
            UndoCommand::SetValue {
                field_id: id,
                old_value,
                new_value: value,
            },
            self.clock.now(),
        );
        self.dirty = true;
        self.finish(propagation)
    }

    /// Takes in a value observed in a generated document.
    ///
    /// A value equal to what the system produces creates nothing. A new value on an open
    /// (pending or invalid) override is added to its reports and re-opens it; a different value on
    /// an applied override replaces it with a fresh pending one, recorded for undo. Returns the
    /// conflict, if any.
    pub fn report_override(
        &mut self,
        field: &str,
        observed: impl Into<Value>,
    ) -> CoreResult<Option<Conflict>> {
        let id = self.require_field(field)?;
        let observed = observed.into();
        let system_value = self.system_value(field);
        let is_formula = self.is_formula_field(field);
        let old_effective = self.get_effective_value(field);

        match self.overrides.get_mut(field) {
            None if observed == system_value => return Ok(None),
            None => {
                self.overrides.put(
                    &id,
                    Some(Override::new(id.clone(), system_value, observed, is_formula)),
                );
            }
            Some(entry) if entry.state.is_applied() => {
                if entry.value() == Some(&observed) {
                    return Ok(None);
                }
                let before = entry.clone();
                *entry = Override::new(id.clone(), system_value, observed, is_formula);
                let after = entry.clone();
                self.record_override_change(&id, Some(before), Some(after), old_effective)?;
                return Ok(self.conflict(field));
            }
            Some(entry) => {
                if !entry.report_values.contains(&observed) {
                    entry.report_values.push(observed);
                }
                entry.state = OverrideState::Pending;
                entry.system_value = system_value;
            }
        }

        let conflict = self.conflict(field);
        if let Some(conflict) = &conflict {
            log::warn!(
                "override on `{id}` has {} conflicting values",
                conflict.values.len()
            );
        }
        self.dirty = true;
        let propagation = self.propagate_from(&id);
        self.finish(propagation)?;
        Ok(conflict)
    }

    /// Accepts a pending override, making its value effective.
    ///
    /// Fails while a conflict is unresolved. A value that fails validation moves the override to
    /// `INVALID` (recorded for undo) and returns [`OverrideError::ValidationFailed`].
    pub fn accept_override(&mut self, field: &str) -> CoreResult<Override> {
        let id = self.require_field(field)?;
        let entry = self.overrides.require(field)?;
        if !entry
            .state
            .can_transition_to(OverrideState::Accepted, entry.is_formula_field)
        {
            return Err(OverrideError::InvalidTransition {
                field_id: id,
                from: entry.state,
                to: OverrideState::Accepted,
            }
            .into());
        }
        if let Some(conflict) = entry.conflict() {
            return Err(OverrideError::Conflict {
                field_id: id,
                values: conflict.values,
            }
            .into());
        }

        let proposed = entry.value().cloned().unwrap_or_default();
        let validation = self.validate_value(&id, &proposed);
        if !validation.is_valid() {
            self.transition_override(&id, |o| o.transition(OverrideState::Invalid).map(drop))?;
            return Err(OverrideError::ValidationFailed {
                field_id: id,
                message: validation.message(),
            }
            .into());
        }

        self.transition_override(&id, |o| o.transition(OverrideState::Accepted).map(drop))?;
        Ok(self.overrides.require(field)?.clone())
    }

    /// `PENDING → INVALID`.
    pub fn reject_override(&mut self, field: &str) -> CoreResult<()> {
        let id = self.require_field(field)?;
        self.transition_override(&id, |o| o.transition(OverrideState::Invalid).map(drop))
    }

    /// `INVALID → PENDING` with a corrected value replacing every report.
    pub fn correct_override(&mut self, field: &str, value: impl Into<Value>) -> CoreResult<()> {
        let id = self.require_field(field)?;
        let value = value.into();
        self.transition_override(&id, move |o| {
            o.transition(OverrideState::Pending)?;
            o.report_values = vec![value];
            Ok(())
        })
    }

    /// Deletes an `INVALID` override.
    pub fn delete_override(&mut self, field: &str) -> CoreResult<()> {
        let id = self.require_field(field)?;
        let entry = self.overrides.require(field)?;
        if entry.state != OverrideState::Invalid {
            return Err(OverrideError::NotDeletable {
                field_id: id,
                state: entry.state,
            }
            .into());
        }
        let before = entry.clone();
        let old_effective = self.get_effective_value(field);
        self.overrides.remove(field);
        self.record_override_change(&id, Some(before), None, old_effective)
    }

    /// Settles a conflict on a pending override by picking the value to keep.
    pub fn resolve_conflict(&mut self, field: &str, value: impl Into<Value>) -> CoreResult<()> {
        let id = self.require_field(field)?;
        let value = value.into();
        let entry = self.overrides.require_mut(field)?;
        if entry.state != OverrideState::Pending {
            return Err(OverrideError::InvalidTransition {
                field_id: id,
                from: entry.state,
                to: OverrideState::Pending,
            }
            .into());
        }
        let old_report_values = std::mem::replace(&mut entry.report_values, vec![value]);
        let new_report_values = entry.report_values.clone();

        self.undo.push(
            UndoCommand::ResolveConflict {
                field_id: id.clone(),
                old_report_values,
                new_report_values,
            },
            self.clock.now(),
        );
        self.dirty = true;
        let propagation = self.propagate_from(&id);
        self.finish(propagation).map(drop)
    }

    /// Marks whether an applied override may be used for generation.
    pub fn set_override_usable(&mut self, field: &str, usable: bool) -> CoreResult<()> {
        let id = self.require_field(field)?;
        if self.overrides.require(field)?.use_in_generation == usable {
            return Ok(());
        }
        self.transition_override(&id, |o| {
            o.use_in_generation = usable;
            Ok(())
        })
    }

    /// `ACCEPTED → SYNCED` (input field) or `SYNCED_FORMULA` (formula field), after the value has
    /// been written into a generated document.
    ///
    /// For input fields the override value is folded into the raw value, so the override can later
    /// be cleaned up without changing the effective value. Not recorded for undo.
    pub fn mark_override_synced(&mut self, field: &str) -> CoreResult<()> {
        let id = self.require_field(field)?;
        let entry = self.overrides.require_mut(field)?;
        let target = entry.synced_state();
        entry.transition(target)?;
        let folded = (!entry.is_formula_field)
            .then(|| entry.value().cloned())
            .flatten();

        if let Some(value) = folded {
            self.store.set_raw(field, value);
        }
        self.dirty = true;
        let propagation = self.propagate_from(&id);
        self.finish(propagation).map(drop)
    }

    /// Marks every accepted override as synced. Returns how many were marked.
    pub fn mark_overrides_synced(&mut self) -> CoreResult<usize> {
        let fields = self.overrides.fields_in_state(OverrideState::Accepted);
        for field in &fields {
            self.mark_override_synced(field.as_str())?;
        }
        Ok(fields.len())
    }

    /// Deletes every `SYNCED` override and the undo history that refers to them.
    ///
    /// `SYNCED_FORMULA` overrides are kept. Never fails; problems are logged.
    pub fn cleanup_synced_overrides(&mut self) -> usize {
        let fields = self.overrides.fields_in_state(OverrideState::Synced);
        if fields.is_empty() {
            return 0;
        }

        let mut propagation = Propagation::default();
        for field in &fields {
            self.overrides.remove(field.as_str());
            let step = self.propagate_from(field);
            propagation.touched.extend(step.touched);
            propagation.error = propagation.error.or(step.error);
        }
        let purged = self.undo.purge_overrides(&fields);
        log::debug!(
            "cleaned up {} synced overrides, purged {purged} undo entries",
            fields.len()
        );
        self.dirty = true;
        if let Err(err) = self.finish(propagation) {
            log::warn!("override cleanup: {err}");
        }
        fields.len()
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.undo.undo_description()
    }

    pub fn redo_description(&self) -> Option<String> {
        self.undo.redo_description()
    }

    pub fn undo_stack(&self) -> &UndoStack {
        &self.undo
    }

    /// Reverses the last command and recomputes everything downstream of it.
    ///
    /// The reverse is applied unconditionally; a control chain that hits its depth bound while
    /// recomputing is logged, not returned.
    pub fn undo(&mut self) -> CoreResult<Vec<FieldChange>> {
        let Some(command) = self.undo.undo() else {
            return Ok(Vec::new());
        };
        log::debug!("undo: {}", command.description());
        Ok(self.replay(command, Direction::Reverse))
    }

    pub fn redo(&mut self) -> CoreResult<Vec<FieldChange>> {
        let Some(command) = self.undo.redo() else {
            return Ok(Vec::new());
        };
        log::debug!("redo: {}", command.description());
        Ok(self.replay(command, Direction::Forward))
    }

    pub fn subscribe(
        &mut self,
        listener: impl FnMut(&FieldChange) + Send + 'static,
    ) -> SubscriptionId {
        let listener: Listener = Box::new(listener);
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub fn export_state(&self) -> Snapshot {
        Snapshot {
            values: self.store.raw_values(),
            overrides: self.overrides.iter().cloned().collect(),
        }
    }

    /// Replaces every value and override with the snapshot's and recomputes all derived state.
    ///
    /// Only UI control effects are re-applied; stored values already carry the `VALUE_SET`
    /// effects that produced them. Undo history is left alone.
    pub fn import_state(&mut self, snapshot: Snapshot) -> CoreResult<Vec<FieldChange>> {
        for field in snapshot.values.keys() {
            self.require_field(field.as_str())?;
            if self.is_formula_field(field.as_str()) {
                return Err(CoreError::FormulaField(field.clone()));
            }
        }
        for entry in &snapshot.overrides {
            self.require_field(entry.field_id.as_str())?;
        }

        self.store.reset(&self.schema);
        for (field, value) in snapshot.values {
            self.store.set_raw(field.as_str(), value);
        }
        self.overrides = snapshot.overrides.into_iter().collect();
        for entry in self.overrides.iter_mut() {
            entry.is_formula_field = self.formulas.contains_key(&entry.field_id);
        }

        self.recompute_all();
        self.apply_ui_rules();
        let fields: Vec<FieldId> = self.schema.ids().cloned().collect();
        self.refresh_overrides(fields.iter());
        self.dirty = false;

        self.finish(Propagation {
            touched: fields.into_iter().collect(),
            error: None,
        })
    }

    /// Starts a new session from `snapshot`. Undo history is cleared.
    pub fn open_session(&mut self, snapshot: Snapshot) -> CoreResult<Vec<FieldChange>> {
        self.undo.clear();
        self.import_state(snapshot)
    }

    /// Ends the session: values, overrides and undo history are dropped. Listeners are told
    /// about every field's reset value.
    pub fn close_session(&mut self) -> Vec<FieldChange> {
        self.undo.clear();
        self.overrides.clear();
        self.store.reset(&self.schema);
        self.recompute_all();
        self.apply_ui_rules();
        self.dirty = false;

        let touched: BTreeSet<FieldId> = self.schema.ids().cloned().collect();
        let changes = self.collect_changes(&touched);
        self.listeners.emit(&changes);
        changes
    }

    /// Records that the working set was persisted. Undo history is kept.
    pub fn mark_saved(&mut self) {
        self.dirty = false;
    }

    fn view(&self) -> EffectiveView<'_> {
        EffectiveView {
            store: &self.store,
            overrides: &self.overrides,
        }
    }

    fn require_field(&self, field: &str) -> CoreResult<FieldId> {
        match self.schema.field(field) {
            Some(def) => Ok(def.id.clone()),
            None => Err(CoreError::UnknownField(FieldId::from(field))),
        }
    }

    /// What the system produces for `field` without overrides.
    fn system_value(&self, field: &str) -> Value {
        match self.store.slot(field) {
            Some(slot) => slot.computed.clone().unwrap_or_else(|| slot.raw.clone()),
            None => Value::Null,
        }
    }

    fn validate_value(&self, field: &FieldId, value: &Value) -> ValidationResult {
        let (Some(def), Some(ui)) = (self.schema.field(field.as_str()), self.store.ui(field.as_str()))
        else {
            return ValidationResult::valid();
        };
        self.validator.validate(def, value, ui)
    }

    /// Evaluates the formulas of `fields` in the given order, caching each result before the next
    /// field is evaluated.
    fn recompute(&mut self, fields: &[FieldId]) {
        for field in fields {
            let Some(formula) = self.formulas.get(field) else {
                continue;
            };
            let result = evaluate(formula, &self.view());
            if let Err(err) = &result {
                log::warn!("formula for `{field}` failed: {err}");
            }
            self.store.set_computed(field.as_str(), result);
        }
    }

    fn recompute_all(&mut self) {
        let order: Vec<FieldId> = self.graph.topo_order().to_vec();
        log::debug!("recomputing {} formulas", self.formulas.len());
        self.recompute(&order);
    }

    fn recompute_field_and_dependents(&mut self, field: &FieldId) {
        let mut fields = vec![field.clone()];
        fields.extend(self.graph.affected_by(field.as_str()));
        self.recompute(&fields);
        self.refresh_overrides(fields.iter());
    }

    /// Recomputes everything downstream of a change to `field` (whose new input is already
    /// stored).
    ///
    /// The control chain starts from `field` and every formula recomputed because of it, in
    /// dependency order. When `VALUE_SET` effects change inputs of other formulas, those formulas
    /// are recomputed and their rules continue the chain on the remaining depth.
    fn propagate_from(&mut self, field: &FieldId) -> Propagation {
        let mut touched: BTreeSet<FieldId> = BTreeSet::new();
        touched.insert(field.clone());

        let affected = self.graph.affected_by(field.as_str());
        log::debug!("recompute wave from `{field}`: {affected:?}");
        self.recompute(&affected);
        touched.extend(affected.iter().cloned());

        let mut sources = vec![field.clone()];
        sources.extend(affected);
        let mut depth = 0;
        let mut error = None;

        while !sources.is_empty() {
            let chain = {
                let view = self.view();
                let store = &self.store;
                let formulas = &self.formulas;
                evaluate_chain_from(
                    &self.controls,
                    ChainWave {
                        origin: field,
                        sources: &sources,
                        depth,
                    },
                    &view,
                    self.settings.max_chain_depth,
                    |target| store.contains(target.as_str()) && !formulas.contains_key(target),
                )
            };

            for effect in &chain.effects {
                touched.insert(effect.target_field.clone());
                self.apply_effect(effect);
            }
            let value_set_targets: Vec<&str> =
                chain.value_set_targets().map(FieldId::as_str).collect();
            let recomputed = self.graph.affected_by_all(value_set_targets);
            if !recomputed.is_empty() {
                log::debug!("recompute wave after control effects: {recomputed:?}");
                self.recompute(&recomputed);
                touched.extend(recomputed.iter().cloned());
            }

            if chain.error.is_some() {
                error = chain.error;
                break;
            }
            depth = chain.depth;
            sources = recomputed
                .into_iter()
                .filter(|f| self.controls.rules_for(f.as_str()).next().is_some())
                .collect();
        }

        self.refresh_overrides(touched.iter());
        Propagation { touched, error }
    }

    fn apply_effect(&mut self, effect: &EffectResult) {
        let target = effect.target_field.as_str();
        match effect.effect_type {
            EffectType::ValueSet => {
                self.store.set_raw(target, effect.value.clone());
            }
            EffectType::Visibility | EffectType::Enable => {
                let Some(flag) = effect.value.as_bool() else {
                    return;
                };
                if let Some(ui) = self.store.ui_mut(target) {
                    if effect.effect_type == EffectType::Visibility {
                        ui.visible = flag;
                    } else {
                        ui.enabled = flag;
                    }
                }
            }
            EffectType::OptionsFilter => {
                let options = effect.value.as_list().map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_text().map(str::to_string))
                        .collect()
                });
                if let Some(ui) = self.store.ui_mut(target) {
                    ui.options = options;
                }
            }
        }
    }

    /// Re-applies terminal effects of every rule against current values, in registration order.
    fn apply_ui_rules(&mut self) {
        let effects: Vec<EffectResult> = {
            let view = self.view();
            self.controls
                .rules()
                .iter()
                .filter(|rule| rule.effect_type.is_terminal())
                .filter_map(|rule| {
                    let source = view
                        .get_field_value(&rule.source_field)
                        .unwrap_or(Value::Null);
                    evaluate_single(rule, &source)
                })
                .collect()
        };
        for effect in &effects {
            self.apply_effect(effect);
        }
    }

    fn refresh_overrides<'a>(&mut self, fields: impl Iterator<Item = &'a FieldId>) {
        for field in fields {
            let system_value = self.system_value(field.as_str());
            if let Some(entry) = self.overrides.get_mut(field.as_str()) {
                entry.system_value = system_value;
            }
        }
    }

    /// Applies `change` to the override on `field`, records it for undo and propagates.
    fn transition_override(
        &mut self,
        field: &FieldId,
        change: impl FnOnce(&mut Override) -> Result<(), OverrideError>,
    ) -> CoreResult<()> {
        let old_effective = self.get_effective_value(field.as_str());
        let entry = self.overrides.require_mut(field.as_str())?;
        let before = entry.clone();
        change(entry)?;
        let after = entry.clone();
        self.record_override_change(field, Some(before), Some(after), old_effective)
    }

    fn record_override_change(
        &mut self,
        field: &FieldId,
        before: Option<Override>,
        after: Option<Override>,
        old_effective_value: Value,
    ) -> CoreResult<()> {
        self.undo.push(
            UndoCommand::OverrideTransition {
                field_id: field.clone(),
                old_state: before.as_ref().map(|o| o.state),
                new_state: after.as_ref().map(|o| o.state),
                old_effective_value,
                before,
                after,
            },
            self.clock.now(),
        );
        self.dirty = true;
        let propagation = self.propagate_from(field);
        self.finish(propagation).map(drop)
    }

    fn replay(&mut self, command: UndoCommand, direction: Direction) -> Vec<FieldChange> {
        let field = command.field_id().clone();
        match command {
            UndoCommand::SetValue {
                old_value,
                new_value,
                ..
            } => {
                if !self.store.contains(field.as_str()) || self.is_formula_field(field.as_str()) {
                    log::warn!("skipping replay of write to `{field}`: no longer an input field");
                    return Vec::new();
                }
                let value = direction.pick(old_value, new_value);
                self.store.set_raw(field.as_str(), value);
            }
            UndoCommand::OverrideTransition { before, after, .. } => {
                let mut entry = direction.pick(before, after);
                if let Some(entry) = &mut entry {
                    entry.system_value = self.system_value(field.as_str());
                }
                self.overrides.put(&field, entry);
            }
            UndoCommand::ResolveConflict {
                old_report_values,
                new_report_values,
                ..
            } => match self.overrides.get_mut(field.as_str()) {
                Some(entry) => {
                    entry.report_values = direction.pick(old_report_values, new_report_values);
                }
                None => log::warn!("skipping conflict replay on `{field}`: override is gone"),
            },
        }

        self.dirty = true;
        let propagation = self.propagate_from(&field);
        if let Some(err) = &propagation.error {
            log::error!("control chain during replay: {err}");
        }
        let changes = self.collect_changes(&propagation.touched);
        self.listeners.emit(&changes);
        changes
    }

    fn collect_changes(&self, touched: &BTreeSet<FieldId>) -> Vec<FieldChange> {
        let mut fields: Vec<FieldId> = touched.iter().cloned().collect();
        self.graph.sort_topologically(&mut fields);
        fields
            .into_iter()
            .filter_map(|field_id| {
                let ui = self.store.ui(field_id.as_str())?.clone();
                let value = self.get_effective_value(field_id.as_str());
                Some(FieldChange {
                    field_id,
                    value,
                    ui,
                })
            })
            .collect()
    }

    /// Notifies listeners and converts a chain error into the call's result.
    fn finish(&mut self, propagation: Propagation) -> CoreResult<Vec<FieldChange>> {
        let changes = self.collect_changes(&propagation.touched);
        self.listeners.emit(&changes);
        match propagation.error {
            Some(err) => {
                log::error!("{err}");
                Err(err.into())
            }
            None => Ok(changes),
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Reverse,
    Forward,
}

impl Direction {
    fn pick<T>(self, old: T, new: T) -> T {
        match self {
            Direction::Reverse => old,
            Direction::Forward => new,
        }
    }
}

fn parse_for(field: &FieldId, source: &str) -> CoreResult<Formula> {
    Formula::parse(source).map_err(|source| CoreError::Parse {
        field: field.clone(),
        source,
    })
}

fn check_references<'a>(
    schema: &Schema,
    formulas: impl IntoIterator<Item = &'a Formula>,
) -> CoreResult<()> {
    for formula in formulas {
        if let Some(missing) = formula
            .dependencies()
            .iter()
            .find(|dep| !schema.contains(dep.as_str()))
        {
            return Err(CoreError::UnknownField(missing.clone()));
        }
    }
    Ok(())
}

/// Every schema field is a node; formula fields depend on their references.
fn build_graph(
    schema: &Schema,
    formulas: &BTreeMap<FieldId, Formula>,
) -> Result<DependencyGraph, CycleError> {
    DependencyGraph::build(schema.ids().map(|id| {
        let deps: Vec<FieldId> = formulas
            .get(id)
            .map(|f| f.dependencies().iter().cloned().collect())
            .unwrap_or_default();
        (id.clone(), deps)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docform_model::{FieldDefinition, FieldType};
    use pretty_assertions::assert_eq;

    fn engine() -> Engine {
        Engine::new(
            Schema::from_fields([
                FieldDefinition::new("price", FieldType::Number),
                FieldDefinition::new("qty", FieldType::Number),
                FieldDefinition::new("total", FieldType::Number)
                    .with_formula("{{price}} * {{qty}}"),
            ])
            .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn engine_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Engine>();
    }

    #[test]
    fn writes_recompute_dependents() {
        let mut engine = engine();
        engine.set_raw_value("price", 2.5).unwrap();
        let changes = engine.set_raw_value("qty", 4.0).unwrap();
        assert_eq!(engine.get_effective_value("total"), Value::Number(10.0));

        let fields: Vec<&str> = changes.iter().map(|c| c.field_id.as_str()).collect();
        assert_eq!(fields, vec!["qty", "total"]);
    }

    #[test]
    fn writes_to_formula_or_unknown_fields_are_rejected() {
        let mut engine = engine();
        assert_eq!(
            engine.set_raw_value("total", 1.0),
            Err(CoreError::FormulaField("total".into()))
        );
        assert_eq!(
            engine.set_raw_value("nope", 1.0),
            Err(CoreError::UnknownField("nope".into()))
        );
    }

    #[test]
    fn unchanged_writes_do_not_touch_history() {
        let mut engine = engine();
        engine.set_raw_value("price", 1.0).unwrap();
        assert_eq!(engine.undo_stack().len(), 1);
        assert!(engine.set_raw_value("price", 1.0).unwrap().is_empty());
        assert_eq!(engine.undo_stack().len(), 1);
    }

    #[test]
    fn formula_errors_degrade_to_null_and_are_reported() {
        let mut engine = engine();
        engine.register_formula("total", "{{price}} / {{qty}}").unwrap();
        engine.set_raw_value("price", 1.0).unwrap();
        engine.set_raw_value("qty", 0.0).unwrap();
        assert_eq!(engine.get_effective_value("total"), Value::Null);
        assert_eq!(engine.formula_error("total"), Some(&FormulaError::DivisionByZero));

        engine.set_raw_value("qty", 2.0).unwrap();
        assert_eq!(engine.get_effective_value("total"), Value::Number(0.5));
        assert_eq!(engine.formula_error("total"), None);
    }

    #[test]
    fn bad_registrations_leave_the_engine_unchanged() {
        let mut engine = engine();
        assert!(matches!(
            engine.register_formula("price", "{{total}} + 1"),
            Err(CoreError::Cycle(_))
        ));
        assert!(matches!(
            engine.register_formula("price", "{{missing}}"),
            Err(CoreError::UnknownField(_))
        ));
        assert!(matches!(
            engine.register_formula("price", "exec('rm')"),
            Err(CoreError::Parse { .. })
        ));
        assert!(!engine.is_formula_field("price"));
        assert_eq!(
            engine.dependency_graph().dependents_of("total"),
            Vec::<FieldId>::new()
        );
    }
}
