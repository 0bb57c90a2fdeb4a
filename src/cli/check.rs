//! CLI subcommand: `netguard check`

use anyhow::Result;
use clap::Args;

use crate::config::Config;
use crate::security::{CommandPolicy, PolicyRuleSet};

#[derive(Args)]
pub struct CheckArgs {
    /// Commands to check (quote each one)
    #[arg(required = true)]
    pub commands: Vec<String>,
}

pub async fn run(args: CheckArgs, config_path: Option<&str>) -> Result<()> {
    let config = Config::load_with_override(config_path)?;
    let policy = CommandPolicy::new(PolicyRuleSet::from_config(&config.security));

    let mut blocked = 0;
    for command in &args.commands {
        match policy.authorize(command) {
            Ok(authorized) => println!("ALLOWED  {}", authorized.as_sent()),
            Err(violation) => {
                blocked += 1;
                println!(
                    "BLOCKED  {} ({}: {})",
                    command.trim(),
                    violation.category(),
                    violation
                );
            }
        }
    }

    if blocked > 0 {
        anyhow::bail!("{} of {} command(s) blocked", blocked, args.commands.len());
    }
    Ok(())
}
