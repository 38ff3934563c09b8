use docform_engine::{Engine, EngineSettings, FieldChange, ManualClock, Snapshot};
use std::sync::{Arc, Mutex};
use docform_model::{FieldDefinition, FieldType, Schema, Value};
use pretty_assertions::assert_eq;

fn engine(clock: &ManualClock) -> Engine {
    let schema = Schema::from_fields([
        FieldDefinition::new("title", FieldType::Text),
        FieldDefinition::new("pages", FieldType::Number),
        FieldDefinition::new("label", FieldType::Text)
            .with_formula("concat({{title}}, ' (', {{pages}}, 'p)')"),
    ])
    .unwrap();
    Engine::new(schema).unwrap().with_clock(clock.clone())
}

#[test]
fn rapid_writes_to_one_field_merge_into_one_step() {
    let clock = ManualClock::default();
    let mut engine = engine(&clock);
    for (i, text) in ["R", "Re", "Rep", "Repo", "Report"].into_iter().enumerate() {
        if i > 0 {
            clock.advance_ms(200);
        }
        engine.set_raw_value("title", text).unwrap();
    }
    assert_eq!(engine.undo_stack().len(), 1);

    // Outside the window: a new step.
    clock.advance_ms(501);
    engine.set_raw_value("title", "Reports").unwrap();
    assert_eq!(engine.undo_stack().len(), 2);

    engine.undo().unwrap();
    assert_eq!(engine.get_effective_value("title"), Value::from("Report"));
    engine.undo().unwrap();
    assert_eq!(engine.get_effective_value("title"), Value::Null);
    assert!(!engine.can_undo());
}

#[test]
fn writes_to_different_fields_never_merge() {
    let clock = ManualClock::default();
    let mut engine = engine(&clock);
    engine.set_raw_value("title", "A").unwrap();
    engine.set_raw_value("pages", 3.0).unwrap();
    assert_eq!(
        engine.undo_stack().descriptions(),
        vec!["edit title", "edit pages"]
    );
}

#[test]
fn typing_back_to_the_original_value_leaves_no_step() {
    let clock = ManualClock::default();
    let mut engine = engine(&clock);
    engine.set_raw_value("title", "x").unwrap();
    clock.advance_ms(100);
    engine.set_raw_value("title", Value::Null).unwrap();
    assert!(!engine.can_undo());
}

#[test]
fn a_new_command_discards_the_redo_tail() {
    let clock = ManualClock::default();
    let mut engine = engine(&clock);
    engine.set_raw_value("title", "a").unwrap();
    clock.advance_ms(1_000);
    engine.set_raw_value("title", "b").unwrap();
    engine.undo().unwrap();
    assert_eq!(engine.redo_description().as_deref(), Some("edit title"));

    engine.set_raw_value("pages", 10.0).unwrap();
    assert!(!engine.can_redo());
    assert_eq!(
        engine.get_effective_value("label"),
        Value::from("a (10p)")
    );
}

#[test]
fn capacity_evicts_the_oldest_steps() {
    let clock = ManualClock::default();
    let mut engine = engine(&clock)
        .with_settings(EngineSettings {
            undo_capacity: 3,
            ..EngineSettings::default()
        })
        .unwrap();
    for n in 1..=5 {
        clock.advance_ms(1_000);
        engine.set_raw_value("pages", f64::from(n)).unwrap();
    }
    assert_eq!(engine.undo_stack().len(), 3);

    while engine.can_undo() {
        engine.undo().unwrap();
    }
    assert_eq!(engine.get_effective_value("pages"), Value::Number(2.0));
}

#[test]
fn default_capacity_is_one_hundred() {
    let clock = ManualClock::default();
    let mut engine = engine(&clock);
    for n in 0..150 {
        clock.advance_ms(1_000);
        engine.set_raw_value("pages", f64::from(n)).unwrap();
    }
    assert_eq!(engine.undo_stack().len(), 100);
    assert_eq!(engine.undo_stack().capacity(), 100);
}

#[test]
fn history_survives_save_but_not_session_boundaries() {
    let clock = ManualClock::default();
    let mut engine = engine(&clock);
    engine.set_raw_value("title", "Draft").unwrap();
    clock.advance_ms(1_000);
    engine.set_raw_value("pages", 12.0).unwrap();
    assert!(engine.is_dirty());

    engine.mark_saved();
    assert!(!engine.is_dirty());
    assert!(engine.can_undo());
    assert_eq!(engine.undo_stack().len(), 2);

    let saved = engine.export_state();
    engine.close_session();
    assert!(!engine.can_undo());
    assert_eq!(engine.get_effective_value("title"), Value::Null);
    assert_eq!(engine.get_effective_value("label"), Value::from(" (p)"));

    engine.open_session(saved).unwrap();
    assert!(!engine.can_undo());
    assert!(!engine.is_dirty());
    assert_eq!(engine.get_effective_value("label"), Value::from("Draft (12p)"));

    engine.set_raw_value("pages", 13.0).unwrap();
    engine.undo().unwrap();
    assert_eq!(engine.get_effective_value("pages"), Value::Number(12.0));
    assert!(!engine.can_undo());
}

#[test]
fn opening_a_session_drops_history_from_the_previous_one() {
    let clock = ManualClock::default();
    let mut engine = engine(&clock);
    engine.set_raw_value("title", "old").unwrap();
    engine.open_session(Snapshot::default()).unwrap();
    assert!(!engine.can_undo());
    assert_eq!(engine.get_effective_value("title"), Value::Null);
}

#[test]
fn zero_merge_window_keeps_every_write() {
    let clock = ManualClock::default();
    let settings = EngineSettings {
        merge_window_ms: 0,
        ..EngineSettings::default()
    };
    let mut engine = engine(&clock).with_settings(settings).unwrap();

    engine.set_raw_value("title", "a").unwrap();
    engine.set_raw_value("title", "ab").unwrap();
    assert_eq!(engine.undo_stack().len(), 2);

    engine.undo().unwrap();
    assert_eq!(engine.get_effective_value("title"), Value::from("a"));
}

#[test]
fn closing_a_session_notifies_every_field() {
    let clock = ManualClock::default();
    let mut engine = engine(&clock);
    engine.set_raw_value("title", "Draft").unwrap();

    let seen: Arc<Mutex<Vec<FieldChange>>> = Arc::default();
    let sink = Arc::clone(&seen);
    engine.subscribe(move |change| sink.lock().unwrap().push(change.clone()));

    let changes = engine.close_session();
    let fields: Vec<&str> = changes.iter().map(|c| c.field_id.as_str()).collect();
    assert_eq!(fields.len(), 3);
    assert!(fields.contains(&"title") && fields.contains(&"label"));

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, changes);
    let title = seen.iter().find(|c| c.field_id.as_str() == "title").unwrap();
    assert_eq!(title.value, Value::Null);
}
