use std::io::Write;

use tagbus::config::{Settings, SettingsError};
use tagbus::protocol::Value;
use tagbus::tags::TagKind;

fn write_config(yaml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("temp file");
    file.write_all(yaml.as_bytes()).expect("write yaml");
    file
}

#[test]
fn loads_bus_section_and_tag_declarations() {
    let file = write_config(
        r#"
bus:
  ip: 127.0.0.1
  port: 11324
  tus: 20000
tags:
  Pump/Speed:
    type: float
    units: rpm
    dp: 1
    min: 0
    max: 1500
  Pump/Mode:
    multi: ["Stopped", "Auto", "Manual"]
    init: 1
  Recipe:
    type: dict
    init: {steps: [1, 2]}
"#,
    );

    let settings = Settings::load(file.path()).expect("load");
    assert_eq!(settings.bus.port, 11324);
    assert_eq!(settings.bus.tus, 20000);
    assert_eq!(settings.bus.socket_addr().unwrap().port(), 11324);
    assert_eq!(settings.tags.len(), 3);

    let speed = settings.tags["Pump/Speed"].to_spec("Pump/Speed").expect("spec");
    assert_eq!(speed.kind, TagKind::Float);
    assert_eq!(speed.metadata.units.as_deref(), Some("rpm"));
    assert_eq!(speed.metadata.max, Some(1500.0));
    assert!(speed.init.is_none());

    // multi implies int, and the labels ride along as metadata.
    let mode = settings.tags["Pump/Mode"].to_spec("Pump/Mode").expect("spec");
    assert_eq!(mode.kind, TagKind::Int);
    assert_eq!(
        mode.metadata.multi.as_deref(),
        Some(&["Stopped".to_owned(), "Auto".to_owned(), "Manual".to_owned()][..])
    );
    assert_eq!(mode.init, Some(Value::Int(1)));

    let recipe = settings.tags["Recipe"].to_spec("Recipe").expect("spec");
    assert_eq!(recipe.kind, TagKind::Dict);
    assert!(matches!(recipe.init, Some(Value::Json(_))));
}

#[test]
fn bus_defaults_apply_when_fields_are_omitted() {
    let file = write_config("bus:\n  port: 4444\n");
    let settings = Settings::load(file.path()).expect("load");
    assert_eq!(settings.bus.ip, "127.0.0.1");
    assert_eq!(settings.bus.port, 4444);
    assert_eq!(settings.bus.tus, tagbus::protocol::DEFAULT_TUS);
    assert!(settings.tags.is_empty());
}

#[test]
fn declaration_without_a_type_is_refused() {
    let file = write_config("tags:\n  Orphan:\n    desc: no type here\n");
    let settings = Settings::load(file.path()).expect("load");
    let err = settings.tags["Orphan"].to_spec("Orphan").unwrap_err();
    assert!(matches!(err, SettingsError::MissingType(_)));
}

#[test]
fn multi_on_a_non_int_type_is_refused() {
    let file = write_config(
        "tags:\n  Mode:\n    type: float\n    multi: [\"A\", \"B\"]\n",
    );
    let settings = Settings::load(file.path()).expect("load");
    let err = settings.tags["Mode"].to_spec("Mode").unwrap_err();
    assert!(matches!(err, SettingsError::MultiNotInt(_)));
}

#[test]
fn init_must_match_the_declared_type() {
    let file = write_config("tags:\n  Level:\n    type: float\n    init: full\n");
    let settings = Settings::load(file.path()).expect("load");
    let err = settings.tags["Level"].to_spec("Level").unwrap_err();
    assert!(matches!(err, SettingsError::InitMismatch(_)));
}
