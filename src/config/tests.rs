use super::*;
use serial_test::serial;

fn clear_strand_env() {
    for (key, _) in env::vars() {
        if key.starts_with("STRAND_") {
            env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn load_uses_defaults_when_env_unset() {
    clear_strand_env();

    let config = Config::load().unwrap();
    assert_eq!(config.runtime.max_agents, 32);
    assert_eq!(config.health.heartbeat_interval_secs, 10);
    assert!(config.registry.state_dir.is_none());
    assert_eq!(config.engine.retry_base_ms, 500);
}

#[test]
#[serial]
fn load_reads_overrides_from_env() {
    clear_strand_env();
    env::set_var("STRAND_MAX_AGENTS", "8");
    env::set_var("STRAND_STATE_DIR", "/tmp/strand-state");
    env::set_var("STRAND_AUTO_RESTART", "false");

    let config = Config::load().unwrap();
    assert_eq!(config.runtime.max_agents, 8);
    assert_eq!(
        config.registry.state_dir,
        Some(PathBuf::from("/tmp/strand-state"))
    );
    assert!(!config.health.auto_restart);

    clear_strand_env();
}

#[test]
#[serial]
fn load_rejects_unparseable_values() {
    clear_strand_env();
    env::set_var("STRAND_MAX_AGENTS", "many");

    let result = Config::load();
    assert!(matches!(result, Err(StrandError::InvalidArgument(_))));

    clear_strand_env();
}

#[test]
#[serial]
fn validate_rejects_zero_max_agents() {
    let mut config = Config::default();
    config.runtime.max_agents = 0;
    assert!(config.validate().is_err());
}

#[test]
#[serial]
fn validate_rejects_inverted_retry_bounds() {
    let mut config = Config::default();
    config.engine.retry_base_ms = 1_000;
    config.engine.retry_cap_ms = 100;
    assert!(config.validate().is_err());
}

#[test]
#[serial]
fn small_queue_is_advisory_not_fatal() {
    let mut config = Config::default();
    config.runtime.task_queue_size = 1;
    assert!(config.validate().is_ok());
}
