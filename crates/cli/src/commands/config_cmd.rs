//! `nosrelay config`: configuration management commands.

use nosrelay_config::AppConfig;

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let warnings = warnings(&config);
            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Upstream:  {}", config.relay.default_upstream_url);
            println!("   Reserved:  {} tokens", config.relay.reserved_tokens);
            println!(
                "   Gateway:   {}:{}",
                config.gateway.host, config.gateway.port
            );
            println!("   Triggers:  {}", config.price.trigger_phrases.join(", "));
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

/// Problems that do not stop the gateway but will fail some requests.
fn warnings(config: &AppConfig) -> Vec<&'static str> {
    let mut warnings = Vec::new();

    if config.relay.api_key.is_none() {
        warnings.push("No upstream API key set; callers must send their own (set OPENAI_API_KEY)");
    }

    if config.price.enabled && config.price.api_key.is_none() {
        warnings.push("Price questions get no context without BIRDEYE_API_KEY");
    }

    if config.relay.stream_timeout_secs == 0 {
        warnings.push("No stream deadline; slow upstreams are relayed indefinitely");
    }

    warnings
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    redact(&mut config);
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn redact(config: &mut AppConfig) {
    for key in [&mut config.relay.api_key, &mut config.price.api_key] {
        if key.is_some() {
            *key = Some("[REDACTED]".into());
        }
    }
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = AppConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}
