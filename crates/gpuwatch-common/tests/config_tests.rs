use gpuwatch_common::config::{GpuWatchConfig, OperationMode};

#[test]
fn defaults_match_the_documented_limits() {
    let cfg = GpuWatchConfig::default();
    assert_eq!(cfg.mode, OperationMode::Auto);
    assert_eq!(cfg.limits.max_groups, 64);
    assert_eq!(cfg.limits.max_field_groups, 64);
    assert_eq!(cfg.limits.max_fields_per_group, 128);
    assert_eq!(cfg.limits.max_group_entities, 64);
    assert_eq!(cfg.janitor_interval().as_millis(), 1000);
}

// the only test in this binary that touches the environment
#[test]
fn yaml_file_overrides_defaults() {
    let path = std::env::temp_dir().join(format!("gpuwatch-config-{}.yaml", std::process::id()));
    std::fs::write(&path, "mode: manual\nread_timeout_ms: 250\nlimits:\n  max_groups: 4\n").unwrap();
    std::env::set_var("GPUWATCH_CONFIG", &path);
    let cfg = GpuWatchConfig::load();
    std::env::remove_var("GPUWATCH_CONFIG");
    let _ = std::fs::remove_file(&path);

    assert_eq!(cfg.mode, OperationMode::Manual);
    assert_eq!(cfg.read_timeout().as_millis(), 250);
    assert_eq!(cfg.limits.max_groups, 4);
    assert_eq!(cfg.limits.max_field_groups, 64);
    assert_eq!(cfg.listen_addr, "127.0.0.1:50051");
}

#[test]
fn modes_parse_case_insensitively() {
    assert_eq!("MANUAL".parse::<OperationMode>().unwrap(), OperationMode::Manual);
    assert!("sometimes".parse::<OperationMode>().is_err());
}
