//! `config`: print the effective settings.

use crate::config::Settings;

pub fn run(settings: &Settings) -> anyhow::Result<()> {
    println!("Current Configuration:");
    println!("{}", "=".repeat(50));
    println!("{}", settings.to_toml()?);
    Ok(())
}
