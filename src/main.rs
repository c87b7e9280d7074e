use anyhow::Result;
use clap::{Arg, Command};
use log::info;

use modbus_agent::config::AgentSettings;
use modbus_agent::{Agent, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let matches = Command::new("modbus-agent")
        .version(VERSION)
        .about("Modbus polling agent bridging local devices to a cloud control plane")
        .arg(
            Arg::new("token")
                .short('t')
                .long("token")
                .value_name("REGISTRATION_TOKEN")
                .help("Registration token issued by the control plane")
                .required(true),
        )
        .arg(
            Arg::new("settings")
                .short('s')
                .long("settings")
                .value_name("FILE")
                .help("Agent settings TOML file (endpoints, buffer tuning)"),
        )
        .get_matches();

    let registration_token = matches.get_one::<String>("token").unwrap().clone();

    let mut settings = match matches.get_one::<String>("settings") {
        Some(path) => AgentSettings::from_file(path)?,
        None => AgentSettings::default(),
    };
    settings.apply_env_overrides();
    settings.validate()?;

    info!("🚀 Starting modbus-agent v{}", VERSION);
    info!("📡 Control plane: {}", settings.ws_url);
    info!("💾 Buffer directory: {}", settings.buffer_dir);

    let agent = Agent::new(settings, registration_token)?;

    tokio::select! {
        _ = agent.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("👋 Interrupt received");
        }
    }

    agent.shutdown().await;
    Ok(())
}
