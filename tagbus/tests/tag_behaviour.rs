use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tagbus::protocol::Value;
use tagbus::tags::{TagError, TagKind, TagMetadata, TagRegistry, TagSpec};

#[test]
fn tags_are_singletons_by_name() {
    let registry = TagRegistry::new();
    let first = registry.tag("Plant/Level", TagKind::Float).expect("create");
    let second = registry.tag("Plant/Level", TagKind::Float).expect("reuse");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len(), 1);
}

#[test]
fn conflicting_kind_is_refused() {
    let registry = TagRegistry::new();
    registry.tag("Plant/Level", TagKind::Float).expect("create");
    let err = registry.tag("Plant/Level", TagKind::Int).unwrap_err();
    assert!(matches!(err, TagError::KindConflict(_, TagKind::Float)));
}

#[test]
fn set_validates_kind_and_updates_state() {
    let registry = TagRegistry::new();
    let tag = registry.tag("IntVal", TagKind::Int).expect("create");

    assert!(tag.value().is_null());
    assert_eq!(tag.time_us(), 0);

    tag.set_at(Value::Int(7), 1_000_000).expect("set");
    assert_eq!(tag.value(), Value::Int(7));
    assert_eq!(tag.time_us(), 1_000_000);
    assert_eq!(tag.bus_id(), 0);

    let err = tag.set(Value::Text("seven".into())).unwrap_err();
    assert!(matches!(err, TagError::KindMismatch(_, TagKind::Int)));
    assert_eq!(tag.value(), Value::Int(7));
}

#[test]
fn float_tags_accept_integer_values() {
    let registry = TagRegistry::new();
    let tag = registry.tag("Ratio", TagKind::Float).expect("create");
    tag.set(Value::Int(3)).expect("int into float tag");
}

#[test]
fn stale_write_is_a_silent_no_op() {
    let registry = TagRegistry::new();
    let tag = registry.tag("IntVal", TagKind::Int).expect("create");
    tag.set_at(Value::Int(7), 1_000_000).expect("set");
    tag.set_at(Value::Int(9), 500_000).expect("stale is ok");
    assert_eq!(tag.value(), Value::Int(7));
    assert_eq!(tag.time_us(), 1_000_000);
}

#[test]
fn callbacks_fire_in_registration_order() {
    let registry = TagRegistry::new();
    let tag = registry.tag("IntVal", TagKind::Int).expect("create");
    let order = Arc::new(Mutex::new(Vec::new()));

    for label in 1..=3 {
        let order = order.clone();
        tag.add_callback(move |_| order.lock().unwrap().push(label), 0);
    }

    tag.set(Value::Int(1)).expect("set");
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn callback_filter_matches_authoring_bus_id() {
    let registry = TagRegistry::new();
    let tag = registry.tag("IntVal", TagKind::Int).expect("create");
    let any = Arc::new(AtomicU32::new(0));
    let only_five = Arc::new(AtomicU32::new(0));

    {
        let any = any.clone();
        tag.add_callback(move |_| { any.fetch_add(1, Ordering::SeqCst); }, 0);
    }
    {
        let only_five = only_five.clone();
        tag.add_callback(move |_| { only_five.fetch_add(1, Ordering::SeqCst); }, 5);
    }

    tag.set_from(Value::Int(1), 10, 4).expect("set");
    tag.set_from(Value::Int(2), 20, 5).expect("set");

    assert_eq!(any.load(Ordering::SeqCst), 2);
    assert_eq!(only_five.load(Ordering::SeqCst), 1);
}

#[test]
fn write_in_own_callback_is_refused() {
    let registry = TagRegistry::new();
    let tag = registry.tag("IntVal", TagKind::Int).expect("create");
    let inner_result = Arc::new(Mutex::new(None));

    {
        let inner_result = inner_result.clone();
        tag.add_callback(
            move |t| {
                *inner_result.lock().unwrap() = Some(t.set(Value::Int(0)));
            },
            0,
        );
    }

    tag.set_at(Value::Int(5), 1_000).expect("outer write completes");

    let inner = inner_result.lock().unwrap().take().expect("callback ran");
    assert!(matches!(inner, Err(TagError::ReentrantWrite(_))));
    assert_eq!(tag.value(), Value::Int(5));
}

#[test]
fn writing_other_tags_from_a_callback_chains() {
    let registry = TagRegistry::new();
    let source = registry.tag("Source", TagKind::Int).expect("create");
    let derived = registry.tag("Derived", TagKind::Int).expect("create");

    {
        let derived = derived.clone();
        source.add_callback(
            move |t| {
                if let Value::Int(v) = t.value() {
                    derived.set(Value::Int(v * 2)).expect("chained write");
                }
            },
            0,
        );
    }

    source.set(Value::Int(21)).expect("set");
    assert_eq!(derived.value(), Value::Int(42));
}

#[test]
fn panicking_callback_does_not_abort_the_batch() {
    let registry = TagRegistry::new();
    let tag = registry.tag("IntVal", TagKind::Int).expect("create");
    let later = Arc::new(AtomicU32::new(0));

    tag.add_callback(|_| panic!("handler fault"), 0);
    {
        let later = later.clone();
        tag.add_callback(move |_| { later.fetch_add(1, Ordering::SeqCst); }, 0);
    }

    tag.set(Value::Int(1)).expect("set still completes");
    assert_eq!(later.load(Ordering::SeqCst), 1);
}

#[test]
fn declare_applies_metadata_and_init() {
    let registry = TagRegistry::new();
    let spec = TagSpec {
        kind: TagKind::Float,
        metadata: TagMetadata {
            desc: Some("basin level".into()),
            units: Some("m".into()),
            min: Some(0.0),
            max: Some(12.5),
            dp: Some(2),
            multi: None,
            format: None,
        },
        init: Some(Value::Float(1.5)),
    };
    let tag = registry.declare("Basin/Level", spec).expect("declare");

    assert_eq!(tag.value(), Value::Float(1.5));
    assert!(tag.time_us() > 0);
    assert_eq!(tag.bus_id(), 0);
    let metadata = tag.metadata();
    assert_eq!(metadata.units.as_deref(), Some("m"));
    assert_eq!(metadata.max, Some(12.5));
}
