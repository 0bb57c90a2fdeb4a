//! CLI subcommand: `netguard redact`

use anyhow::{Context, Result};
use clap::Args;
use std::io::Read;

use crate::security::redact_report;

#[derive(Args)]
pub struct RedactArgs {
    /// Text to redact; reads stdin when omitted
    pub text: Option<String>,

    /// Also redact private addresses and hostnames
    #[arg(short, long)]
    pub aggressive: bool,

    /// Print per-category counts to stderr
    #[arg(long)]
    pub report: bool,
}

pub async fn run(args: RedactArgs) -> Result<()> {
    let input = match args.text {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };

    let report = redact_report(&input, args.aggressive);
    print!("{}", report.text);
    if !report.text.ends_with('\n') {
        println!();
    }

    if args.report {
        if report.has_redactions() {
            for (category, count) in &report.redactions {
                eprintln!("{:<16} {}", category.as_str(), count);
            }
        }
        eprintln!("{:<16} {}", "total", report.total());
    }

    Ok(())
}
