use stepwise_core::config::{AppConfig, StoreBackend};
use stepwise_flow::{ActionKind, StepRegistry};

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

/// Validate the configured flow and environment. Returns the number of
/// failed checks.
pub fn run_check(config: &AppConfig, registry: &Result<StepRegistry, String>) -> usize {
    let checks = vec![
        check_flow(config, registry),
        check_api_key(config),
        check_store(config),
        check_runner(config),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    if let Ok(registry) = registry {
        println!();
        print_chain(registry);
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count
}

fn check_flow(config: &AppConfig, registry: &Result<StepRegistry, String>) -> CheckResult {
    let source = if config.flow.is_some() {
        "custom flow"
    } else {
        "built-in support flow"
    };
    match registry {
        Ok(registry) => CheckResult {
            label: "Flow".into(),
            ok: true,
            detail: format!("{} with {} steps", source, registry.len()),
        },
        Err(e) => CheckResult {
            label: "Flow".into(),
            ok: false,
            detail: format!("{}: {}", source, e),
        },
    }
}

fn check_api_key(config: &AppConfig) -> CheckResult {
    if !stepwise_llm::is_supported_provider(&config.model.provider) {
        return CheckResult {
            label: "API Key".into(),
            ok: false,
            detail: format!(
                "Unsupported provider '{}' (expected one of: {})",
                config.model.provider,
                stepwise_llm::OPENAI_COMPATIBLE_PROVIDERS.join(", ")
            ),
        };
    }
    let has_key = config
        .model
        .api_key
        .as_ref()
        .is_some_and(|k| !k.is_empty() && !k.starts_with("${"))
        || std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty());
    // Local OpenAI-compatible servers usually run without a key.
    let needs_key = !config.model.provider.eq_ignore_ascii_case("ollama") && config.model.base_url.is_none();

    if !needs_key || has_key {
        CheckResult {
            label: "API Key".into(),
            ok: true,
            detail: format!(
                "Configured for {} ({})",
                config.model.model_id, config.model.provider
            ),
        }
    } else {
        CheckResult {
            label: "API Key".into(),
            ok: false,
            detail: format!(
                "No API key set for provider '{}' (set model.api_key or OPENAI_API_KEY)",
                config.model.provider
            ),
        }
    }
}

fn check_store(config: &AppConfig) -> CheckResult {
    match config.store.backend {
        StoreBackend::Memory => CheckResult {
            label: "Store".into(),
            ok: true,
            detail: "in-memory (threads end with the process)".into(),
        },
        StoreBackend::Sqlite => {
            let path = config.store.resolved_path();
            match stepwise_memory::SqliteThreadStore::open(&path) {
                Ok(_) => CheckResult {
                    label: "Store".into(),
                    ok: true,
                    detail: format!("sqlite at {}", path.display()),
                },
                Err(e) => CheckResult {
                    label: "Store".into(),
                    ok: false,
                    detail: format!("{}: {}", path.display(), e),
                },
            }
        }
    }
}

fn check_runner(config: &AppConfig) -> CheckResult {
    let runner = &config.runner;
    if runner.generation_timeout_secs == 0 {
        return CheckResult {
            label: "Runner".into(),
            ok: false,
            detail: "generation_timeout_secs must be greater than 0".into(),
        };
    }
    if runner.history_limit == Some(0) {
        return CheckResult {
            label: "Runner".into(),
            ok: false,
            detail: "history_limit = 0 would hide the inbound message".into(),
        };
    }
    CheckResult {
        label: "Runner".into(),
        ok: true,
        detail: format!(
            "timeout {}s, busy threads {:?}, extra actions {:?}",
            runner.generation_timeout_secs, runner.busy_policy, runner.extra_actions
        ),
    }
}

fn print_chain(registry: &StepRegistry) {
    for step in registry.steps() {
        let requires = if step.requires.is_empty() {
            "-".to_string()
        } else {
            step.requires.join(", ")
        };
        println!(
            "  {}. {} (requires: {})",
            step.id.position() + 1,
            step.name,
            requires
        );
        for action in registry.actions_for(step.id) {
            let effect = match &action.kind {
                ActionKind::Record { fact, .. } => match step.next {
                    Some(next) => format!("record {} -> {}", fact, registry.step_name(next)),
                    None => format!("record {}", fact),
                },
                ActionKind::Revert { target } => format!("revert -> {}", registry.step_name(*target)),
                ActionKind::Terminal { outcome } => format!("terminal ({})", outcome),
            };
            println!("       - {}: {}", action.name, effect);
        }
    }
}
