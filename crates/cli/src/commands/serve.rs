//! `nosrelay serve`: start the streaming chat gateway.

use nosrelay_config::AppConfig;

pub async fn run(port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("📡 nosrelay gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Chat:      POST /api/chat");
    println!(
        "   Price:     {}",
        if config.price.enabled && config.price.api_key.is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );

    nosrelay_gateway::start(config).await?;

    Ok(())
}
