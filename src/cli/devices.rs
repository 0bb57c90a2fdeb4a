//! CLI subcommand: `netguard devices`

use anyhow::Result;

use crate::config::Config;
use crate::security::mask_password;

pub fn run(config_path: Option<&str>) -> Result<()> {
    let config = Config::load_with_override(config_path)?;

    if config.devices.is_empty() {
        println!("No devices configured. Add [devices.<name>] entries to config.toml.");
        return Ok(());
    }

    println!("Devices ({}):", config.devices.len());
    println!();
    for (name, device) in &config.devices {
        let password = if device.password.is_empty() {
            "(from NETGUARD_DEVICE_PASSWORD)".to_string()
        } else {
            mask_password(&device.password)
        };
        println!("  {}", name);
        println!("    target:   {}@{}:{}", device.username, device.host, device.port);
        println!("    type:     {}", device.device_type);
        if let Some(ref role) = device.role {
            println!("    role:     {}", role);
        }
        if let Some(ref description) = device.description {
            println!("    about:    {}", description);
        }
        println!("    password: {}", password);
    }

    Ok(())
}
