//! Loader integration: file discovery, format precedence, validation.

use cadenza_domain::config;

#[test]
fn loads_json_catalog() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("cadenza.json"),
        r#"{"jobs": {"hello": {"command": ["/bin/echo", "hi"], "schedule": "@hourly"}}}"#,
    )
    .unwrap();

    let catalog = config::load(dir.path()).unwrap();
    assert_eq!(catalog.jobs.len(), 1);
    assert!(catalog.jobs["hello"].schedule_expr.is_some());
}

#[test]
fn loads_yaml_catalog() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("cadenza.yaml"),
        concat!(
            "jobs:\n",
            "  hello:\n",
            "    command: [/bin/echo, hi]\n",
            "    schedule: '@daily'\n",
        ),
    )
    .unwrap();

    let catalog = config::load(dir.path()).unwrap();
    assert!(catalog.jobs.contains_key("hello"));
}

#[test]
fn json_wins_when_both_formats_exist() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("cadenza.json"),
        r#"{"jobs": {"from-json": {"command": ["/bin/true"]}}}"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("cadenza.yaml"),
        "jobs:\n  from-yaml:\n    command: [/bin/true]\n",
    )
    .unwrap();

    let catalog = config::load(dir.path()).unwrap();
    assert!(catalog.jobs.contains_key("from-json"));
    assert!(!catalog.jobs.contains_key("from-yaml"));
}

#[test]
fn missing_catalog_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(config::load(dir.path()).is_err());
}

#[test]
fn invalid_catalog_is_rejected_wholesale() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("cadenza.json"),
        r#"{"jobs": {"ok": {"command": ["/bin/true"]}, "broken": {"command": []}}}"#,
    )
    .unwrap();
    assert!(config::load(dir.path()).is_err());
}
