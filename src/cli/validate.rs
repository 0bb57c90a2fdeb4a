//! CLI subcommand: `netguard validate`

use anyhow::Result;
use clap::Args;

use crate::config::Config;
use crate::security::{InputValidator, special_char_ratio, suspicious_patterns};

#[derive(Args)]
pub struct ValidateArgs {
    /// The query to screen
    pub query: String,

    /// Also list every heuristic that matched, even when validation fails earlier
    #[arg(long)]
    pub explain: bool,
}

pub async fn run(args: ValidateArgs, config_path: Option<&str>) -> Result<()> {
    let config = Config::load_with_override(config_path)?;
    let validator = InputValidator::from_config(&config.security);

    if args.explain {
        println!("Length:        {} chars", args.query.chars().count());
        println!(
            "Special chars: {:.0}%",
            special_char_ratio(&args.query) * 100.0
        );
        let patterns = suspicious_patterns(&args.query);
        if patterns.is_empty() {
            println!("Patterns:      none");
        } else {
            println!("Patterns:      {}", patterns.join(", "));
        }
        println!();
    }

    match validator.validate(&args.query) {
        Ok(()) => {
            println!("{}", validator.sanitize(&args.query));
            Ok(())
        }
        Err(e) => anyhow::bail!("Rejected ({}): {}", e.category(), e),
    }
}
