//! Basic usage of tor-ha
//!
//! Starts the full HA layer against local Tor daemons, prints the combined
//! status, makes one request per traffic class and waits for Ctrl-C.
//!
//! ```text
//! cargo run --example basic_usage -- [config.json]
//! ```

use tor_ha::{HaConfig, HaEvent, HaSystem, TrafficClass};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => HaConfig::load(path)?,
        None => HaConfig::default(),
    };
    config.apply_env();

    let system = HaSystem::new(config)?;

    // Print every manager event as it happens
    let mut events = system.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if !matches!(event, HaEvent::HealthCheckCompleted(_)) {
                println!("event: {}", serde_json::to_string(&event).unwrap_or_default());
            }
        }
    });

    system.start().await?;
    println!("{}", serde_json::to_string_pretty(&system.status())?);

    for class in TrafficClass::ALL {
        match system
            .failover()
            .acquire_client(class, Some("https://check.torproject.org/api/ip"))
            .await
        {
            Ok(client) => println!("{:<10} -> {}", class, client.transport()),
            Err(e) => println!("{:<10} -> unavailable ({})", class, e),
        }
    }

    if let Some(address) = system.redundancy().get_best_address("main")? {
        println!("main service reachable at {}", address);
    }

    println!("Running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    system.shutdown().await;
    Ok(())
}
