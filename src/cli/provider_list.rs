use std::error::Error;

use crate::core::config::Config;
use crate::core::providers::{api_key_env_var, known_providers, CredentialSource, EnvCredentials};

pub fn list_providers() -> Result<(), Box<dyn Error>> {
    let config = Config::load()?;
    let providers = known_providers(&config);

    if providers.is_empty() {
        println!("No providers configured.");
        return Ok(());
    }

    println!("Known providers:");
    println!();
    for provider in providers {
        let is_default = config
            .default_provider
            .as_ref()
            .is_some_and(|default| default.eq_ignore_ascii_case(&provider.id));
        let has_key = EnvCredentials.api_key(&provider.id).is_some();
        println!(
            "  {} {}{} ({})",
            if has_key { "✅" } else { "❌" },
            provider.id,
            if is_default { "*" } else { "" },
            provider.display_name
        );
        println!("      {} · {}", provider.family.label(), provider.base_url);
        if !has_key {
            println!("      set {} to use it", api_key_env_var(&provider.id));
        }
    }

    if config.default_provider.is_some() {
        println!();
        println!("* = default provider");
    }

    Ok(())
}
