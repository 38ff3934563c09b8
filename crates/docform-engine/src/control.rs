//! Inter-field control rules.
//!
//! A rule watches one source field and, through its mapping table, produces an effect on one
//! target field. `VALUE_SET` effects change the target's value and can therefore trigger the
//! target's own rules; the other effects only touch UI state and end the chain.

use docform_model::{FieldId, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{CoreError, CoreResult};
use crate::eval::ValueResolver;
use crate::graph::DependencyGraph;

/// Hard bound on the number of waves a control chain may run.
pub const MAX_CHAIN_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EffectType {
    ValueSet,
    Visibility,
    Enable,
    OptionsFilter,
}

impl EffectType {
    /// Terminal effects never make their target "changed" for the next wave.
    pub fn is_terminal(self) -> bool {
        !matches!(self, EffectType::ValueSet)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EffectType::ValueSet => "VALUE_SET",
            EffectType::Visibility => "VISIBILITY",
            EffectType::Enable => "ENABLE",
            EffectType::OptionsFilter => "OPTIONS_FILTER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MatchValue {
    Exact(Value),
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub when: MatchValue,
    pub result: Value,
    #[serde(default)]
    pub priority: i32,
}

impl Mapping {
    pub fn exact(when: impl Into<Value>, result: impl Into<Value>) -> Self {
        Self {
            when: MatchValue::Exact(when.into()),
            result: result.into(),
            priority: 0,
        }
    }

    pub fn default_to(result: impl Into<Value>) -> Self {
        Self {
            when: MatchValue::Default,
            result: result.into(),
            priority: 0,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRule {
    pub source_field: FieldId,
    pub target_field: FieldId,
    pub effect_type: EffectType,
    pub mappings: Vec<Mapping>,
}

impl ControlRule {
    pub fn new(
        source_field: impl Into<FieldId>,
        target_field: impl Into<FieldId>,
        effect_type: EffectType,
    ) -> Self {
        Self {
            source_field: source_field.into(),
            target_field: target_field.into(),
            effect_type,
            mappings: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_mapping(mut self, mapping: Mapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    /// Checks that every mapping result fits the effect type.
    pub fn validate(&self) -> Result<(), ControlError> {
        for mapping in &self.mappings {
            let ok = match self.effect_type {
                EffectType::ValueSet => true,
                EffectType::Visibility | EffectType::Enable => {
                    matches!(mapping.result, Value::Bool(_))
                }
                EffectType::OptionsFilter => match &mapping.result {
                    Value::List(items) => items.iter().all(|v| matches!(v, Value::Text(_))),
                    _ => false,
                },
            };
            if !ok {
                let expected = match self.effect_type {
                    EffectType::OptionsFilter => "a list of text options",
                    _ => "a boolean",
                };
                return Err(ControlError::InvalidMapping {
                    source_field: self.source_field.clone(),
                    target_field: self.target_field.clone(),
                    effect_type: self.effect_type,
                    message: format!(
                        "expected {expected}, got {}",
                        mapping.result.type_name()
                    ),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectResult {
    pub target_field: FieldId,
    pub effect_type: EffectType,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("control chain starting at `{origin}` exceeded the maximum depth of {max}")]
    ChainTooDeep { origin: FieldId, max: usize },
    #[error(
        "invalid {} mapping for `{source_field}` -> `{target_field}`: {message}",
        .effect_type.as_str()
    )]
    InvalidMapping {
        source_field: FieldId,
        target_field: FieldId,
        effect_type: EffectType,
        message: String,
    },
}

/// Picks the mapping for `source_value` and returns the effect it produces.
///
/// An exact match always beats the default mapping. Among several candidates of the same kind
/// the highest priority wins, and list order breaks ties.
pub fn evaluate_single(rule: &ControlRule, source_value: &Value) -> Option<EffectResult> {
    let mut exact: Option<&Mapping> = None;
    let mut fallback: Option<&Mapping> = None;

    for mapping in &rule.mappings {
        let slot = match &mapping.when {
            MatchValue::Exact(v) if v == source_value => &mut exact,
            MatchValue::Exact(_) => continue,
            MatchValue::Default => &mut fallback,
        };
        if slot.map_or(true, |best| mapping.priority > best.priority) {
            *slot = Some(mapping);
        }
    }

    exact.or(fallback).map(|mapping| EffectResult {
        target_field: rule.target_field.clone(),
        effect_type: rule.effect_type,
        value: mapping.result.clone(),
    })
}

/// Registered control rules, indexed by source field.
///
/// Registration keeps the rule graph acyclic; a rule that would close a cycle is rejected and the
/// registry is left unchanged.
#[derive(Debug, Clone, Default)]
pub struct ControlRules {
    rules: Vec<ControlRule>,
    by_source: BTreeMap<FieldId, Vec<usize>>,
    graph: DependencyGraph,
}

impl ControlRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: ControlRule) -> CoreResult<()> {
        rule.validate()?;

        let edges = self
            .rules
            .iter()
            .chain(std::iter::once(&rule))
            .map(|r| (r.target_field.clone(), [r.source_field.clone()]));
        let graph = DependencyGraph::build(edges).map_err(CoreError::Cycle)?;

        self.by_source
            .entry(rule.source_field.clone())
            .or_default()
            .push(self.rules.len());
        self.rules.push(rule);
        self.graph = graph;
        Ok(())
    }

    pub fn rules(&self) -> &[ControlRule] {
        &self.rules
    }

    /// Rules watching `source`, in registration order.
    pub fn rules_for<'a>(&'a self, source: &str) -> impl Iterator<Item = &'a ControlRule> + 'a {
        self.by_source
            .get(source)
            .into_iter()
            .flatten()
            .filter_map(|&idx| self.rules.get(idx))
    }

    /// Control graph in rule order; a target comes after every source that drives it.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Effects produced by one chain run.
///
/// When the depth bound stops a chain, `effects` still holds everything produced before the stop.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChainEvaluation {
    pub effects: Vec<EffectResult>,
    pub error: Option<ControlError>,
    /// Index of the first wave that was not run.
    pub depth: usize,
}

impl ChainEvaluation {
    /// Targets whose value a `VALUE_SET` effect changed, in the order they were set.
    pub fn value_set_targets(&self) -> impl Iterator<Item = &FieldId> {
        self.effects
            .iter()
            .filter(|e| e.effect_type == EffectType::ValueSet)
            .map(|e| &e.target_field)
    }
}

/// Runs the rule chain triggered by a change of `changed`.
///
/// See [`evaluate_chain_with`]; every field accepts `VALUE_SET` effects.
pub fn evaluate_chain<R: ValueResolver + ?Sized>(
    rules: &ControlRules,
    changed: &FieldId,
    values: &R,
    max_depth: usize,
) -> ChainEvaluation {
    evaluate_chain_with(rules, changed, values, max_depth, |_| true)
}

/// Runs the rule chain triggered by a change of `changed`, breadth first.
///
/// Wave 0 is the changed field itself. Each `VALUE_SET` effect that actually changes its
/// target's value (as seen through `values` plus the effects of earlier waves) puts the target in
/// the next wave. A pending wave at index `max_depth` stops the chain with
/// [`ControlError::ChainTooDeep`].
///
/// Within one wave the first `VALUE_SET` to a target wins; later ones are dropped. `VALUE_SET`
/// effects on fields for which `settable` returns false are dropped as well.
pub fn evaluate_chain_with<R, F>(
    rules: &ControlRules,
    changed: &FieldId,
    values: &R,
    max_depth: usize,
    settable: F,
) -> ChainEvaluation
where
    R: ValueResolver + ?Sized,
    F: Fn(&FieldId) -> bool,
{
    let wave = ChainWave {
        origin: changed,
        sources: std::slice::from_ref(changed),
        depth: 0,
    };
    evaluate_chain_from(rules, wave, values, max_depth, settable)
}

/// Where a chain run starts: the fields of its first wave and that wave's index.
#[derive(Debug, Clone, Copy)]
pub struct ChainWave<'a> {
    /// The field whose change started the whole propagation; reported by
    /// [`ControlError::ChainTooDeep`].
    pub origin: &'a FieldId,
    pub sources: &'a [FieldId],
    pub depth: usize,
}

/// Like [`evaluate_chain_with`], but the first wave may hold several fields and may continue
/// a chain that already used some of its depth.
pub fn evaluate_chain_from<R, F>(
    rules: &ControlRules,
    start: ChainWave<'_>,
    values: &R,
    max_depth: usize,
    settable: F,
) -> ChainEvaluation
where
    R: ValueResolver + ?Sized,
    F: Fn(&FieldId) -> bool,
{
    let origin = start.origin;
    let mut overlay: HashMap<FieldId, Value> = HashMap::new();
    let mut out = ChainEvaluation::default();
    let mut wave: Vec<FieldId> = start.sources.to_vec();
    let mut depth = start.depth;

    let current = |overlay: &HashMap<FieldId, Value>, field: &FieldId| -> Value {
        overlay
            .get(field)
            .cloned()
            .or_else(|| values.get_field_value(field))
            .unwrap_or(Value::Null)
    };

    while !wave.is_empty() {
        if depth >= max_depth {
            log::error!(
                "control chain from `{origin}` stopped at depth {depth}; pending: {wave:?}"
            );
            out.error = Some(ControlError::ChainTooDeep {
                origin: origin.clone(),
                max: max_depth,
            });
            break;
        }
        log::debug!("control wave {depth}: {wave:?}");

        let mut next: Vec<FieldId> = Vec::new();
        let mut assigned: HashSet<FieldId> = HashSet::new();

        for source in &wave {
            let source_value = current(&overlay, source);
            for rule in rules.rules_for(source.as_str()) {
                let Some(effect) = evaluate_single(rule, &source_value) else {
                    continue;
                };
                if effect.effect_type.is_terminal() {
                    out.effects.push(effect);
                    continue;
                }

                let target = effect.target_field.clone();
                if !settable(&target) {
                    log::warn!("ignoring VALUE_SET from `{source}` on read-only field `{target}`");
                    continue;
                }
                if !assigned.insert(target.clone()) {
                    log::warn!(
                        "dropping VALUE_SET from `{source}` on `{target}`: already set in this wave"
                    );
                    continue;
                }
                if current(&overlay, &target) == effect.value {
                    continue;
                }
                overlay.insert(target.clone(), effect.value.clone());
                if !next.contains(&target) {
                    next.push(target);
                }
                out.effects.push(effect);
            }
        }

        wave = next;
        depth += 1;
    }

    out.depth = depth;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn values(pairs: &[(&str, Value)]) -> HashMap<FieldId, Value> {
        pairs
            .iter()
            .map(|(k, v)| (FieldId::from(*k), v.clone()))
            .collect()
    }

    #[test]
    fn exact_match_beats_default_regardless_of_order() {
        let rule = ControlRule::new("kind", "discount", EffectType::ValueSet)
            .with_mapping(Mapping::default_to(0.0).with_priority(100))
            .with_mapping(Mapping::exact("vip", 20.0));

        let effect = evaluate_single(&rule, &Value::from("vip")).unwrap();
        assert_eq!(effect.value, Value::Number(20.0));

        let effect = evaluate_single(&rule, &Value::from("regular")).unwrap();
        assert_eq!(effect.value, Value::Number(0.0));
    }

    #[test]
    fn highest_priority_wins_and_list_order_breaks_ties() {
        let rule = ControlRule::new("a", "b", EffectType::ValueSet)
            .with_mapping(Mapping::exact("x", 1.0))
            .with_mapping(Mapping::exact("x", 2.0).with_priority(5))
            .with_mapping(Mapping::exact("x", 3.0).with_priority(5));
        assert_eq!(
            evaluate_single(&rule, &Value::from("x")).unwrap().value,
            Value::Number(2.0)
        );
    }

    #[test]
    fn no_match_and_no_default_means_no_effect() {
        let rule = ControlRule::new("a", "b", EffectType::Visibility)
            .with_mapping(Mapping::exact("x", true));
        assert_eq!(evaluate_single(&rule, &Value::from("y")), None);
    }

    #[test]
    fn mapping_payloads_must_fit_the_effect() {
        let mut rules = ControlRules::new();
        let err = rules
            .add(
                ControlRule::new("a", "b", EffectType::Visibility)
                    .with_mapping(Mapping::exact("x", "yes")),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Control(ControlError::InvalidMapping { .. })
        ));

        let err = rules
            .add(
                ControlRule::new("a", "b", EffectType::OptionsFilter)
                    .with_mapping(Mapping::default_to(1.0)),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Control(ControlError::InvalidMapping { .. })
        ));
        assert!(rules.is_empty());
    }

    #[test]
    fn cyclic_rules_are_rejected_at_registration() {
        let mut rules = ControlRules::new();
        rules
            .add(ControlRule::new("a", "b", EffectType::ValueSet).with_mapping(Mapping::default_to(1.0)))
            .unwrap();
        rules
            .add(ControlRule::new("b", "c", EffectType::ValueSet).with_mapping(Mapping::default_to(1.0)))
            .unwrap();
        let err = rules
            .add(ControlRule::new("c", "a", EffectType::Enable).with_mapping(Mapping::default_to(true)))
            .unwrap_err();
        assert!(matches!(err, CoreError::Cycle(_)));
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn chain_propagates_value_set_and_stops_at_terminal_effects() {
        let mut rules = ControlRules::new();
        rules
            .add(
                ControlRule::new("country", "currency", EffectType::ValueSet)
                    .with_mapping(Mapping::exact("JP", "JPY"))
                    .with_mapping(Mapping::default_to("USD")),
            )
            .unwrap();
        rules
            .add(
                ControlRule::new("currency", "decimals", EffectType::Visibility)
                    .with_mapping(Mapping::exact("JPY", false))
                    .with_mapping(Mapping::default_to(true)),
            )
            .unwrap();

        let ctx = values(&[("country", Value::from("JP"))]);
        let result = evaluate_chain(&rules, &FieldId::from("country"), &ctx, MAX_CHAIN_DEPTH);
        assert_eq!(result.error, None);
        assert_eq!(
            result.effects,
            vec![
                EffectResult {
                    target_field: "currency".into(),
                    effect_type: EffectType::ValueSet,
                    value: "JPY".into(),
                },
                EffectResult {
                    target_field: "decimals".into(),
                    effect_type: EffectType::Visibility,
                    value: false.into(),
                },
            ]
        );
    }

    #[test]
    fn value_set_that_changes_nothing_does_not_propagate() {
        let mut rules = ControlRules::new();
        rules
            .add(ControlRule::new("a", "b", EffectType::ValueSet).with_mapping(Mapping::default_to(1.0)))
            .unwrap();
        rules
            .add(ControlRule::new("b", "c", EffectType::ValueSet).with_mapping(Mapping::default_to(2.0)))
            .unwrap();

        let ctx = values(&[("b", Value::Number(1.0))]);
        let result = evaluate_chain(&rules, &FieldId::from("a"), &ctx, MAX_CHAIN_DEPTH);
        assert!(result.effects.is_empty());
    }

    #[test]
    fn first_value_set_in_a_wave_wins() {
        let mut rules = ControlRules::new();
        rules
            .add(ControlRule::new("a", "t", EffectType::ValueSet).with_mapping(Mapping::default_to("first")))
            .unwrap();
        rules
            .add(ControlRule::new("a", "t", EffectType::ValueSet).with_mapping(Mapping::default_to("second")))
            .unwrap();

        let ctx = values(&[]);
        let result = evaluate_chain(&rules, &FieldId::from("a"), &ctx, MAX_CHAIN_DEPTH);
        assert_eq!(result.effects.len(), 1);
        assert_eq!(result.effects[0].value, Value::from("first"));
    }

    #[test]
    fn settable_predicate_filters_value_set_targets() {
        let mut rules = ControlRules::new();
        rules
            .add(ControlRule::new("a", "total", EffectType::ValueSet).with_mapping(Mapping::default_to(1.0)))
            .unwrap();
        let ctx = values(&[]);
        let result = evaluate_chain_with(&rules, &FieldId::from("a"), &ctx, MAX_CHAIN_DEPTH, |f| {
            f.as_str() != "total"
        });
        assert!(result.effects.is_empty());
        assert_eq!(result.error, None);
    }
}
