use super::*;
use serial_test::serial;

fn clear_foundry_env() {
    for (key, _) in env::vars() {
        if key.starts_with("FOUNDRY_") {
            env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn load_requires_the_agent_binary() {
    clear_foundry_env();
    let err = Config::load().unwrap_err();
    assert!(matches!(err, FoundryError::ConfigurationError(_)));

    env::set_var("FOUNDRY_AGENT_BINARY", "  ");
    let err = Config::load().unwrap_err();
    assert!(matches!(err, FoundryError::ConfigurationError(_)));
}

#[test]
#[serial]
fn defaults_apply_when_only_the_binary_is_set() {
    clear_foundry_env();
    env::set_var("FOUNDRY_AGENT_BINARY", "agent-cli");

    let config = Config::load().unwrap();
    assert_eq!(config.agent.binary, "agent-cli");
    assert_eq!(config.storage.db_path, "foundry.db");
    assert_eq!(config.daemon.tick_period_ms, TICK_PERIOD_MS);
    assert_eq!(config.daemon.max_session_duration_ms, 0);
    assert_eq!(config.workspace.base_ref, "main");
    assert!(config.agent.base_args.is_empty());
}

#[test]
#[serial]
fn explicit_values_override_defaults() {
    clear_foundry_env();
    env::set_var("FOUNDRY_AGENT_BINARY", "agent-cli");
    env::set_var("FOUNDRY_AGENT_ARGS", "--headless --json");
    env::set_var("FOUNDRY_TICK_MS", "500");
    env::set_var("FOUNDRY_BASE_REF", "develop");
    env::set_var("FOUNDRY_DB_PATH", ":memory:");
    env::set_var("FOUNDRY_TASK_RETRY_BUDGET", "5");

    let config = Config::load().unwrap();
    assert_eq!(config.agent.base_args, vec!["--headless", "--json"]);
    assert_eq!(config.daemon.tick_period_ms, 500);
    assert_eq!(config.workspace.base_ref, "develop");
    assert_eq!(config.storage.db_path, ":memory:");
    assert_eq!(config.daemon.task_retry_budget, 5);
}

#[test]
#[serial]
fn malformed_numerics_fall_back() {
    clear_foundry_env();
    env::set_var("FOUNDRY_AGENT_BINARY", "agent-cli");
    env::set_var("FOUNDRY_TICK_MS", "not-a-number");

    let config = Config::load().unwrap();
    assert_eq!(config.daemon.tick_period_ms, TICK_PERIOD_MS);
}

#[test]
#[serial]
fn zero_tick_period_is_rejected() {
    clear_foundry_env();
    env::set_var("FOUNDRY_AGENT_BINARY", "agent-cli");
    env::set_var("FOUNDRY_TICK_MS", "0");

    let err = Config::load().unwrap_err();
    assert!(matches!(err, FoundryError::ConfigurationError(_)));
}
