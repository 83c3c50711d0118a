use crate::core::config::data::Config;

impl Config {
    pub fn print_all(&self) {
        println!("Current configuration:");
        match &self.default_provider {
            Some(provider) => println!("  default-provider: {provider}"),
            None => println!("  default-provider: (unset)"),
        }
        match &self.system_instruction {
            Some(instruction) => println!("  system-instruction: {instruction}"),
            None => println!("  system-instruction: (unset)"),
        }
        let generation = &self.generation;
        println!("  temperature: {}", generation.temperature);
        println!("  top-p: {}", generation.top_p);
        println!("  max-output-tokens: {}", generation.max_output_tokens);
        println!("  history-window: {}", generation.history_window);
        println!("  search: {}", if generation.search { "on" } else { "off" });
        println!("  retry-attempts: {}", self.retry.max_attempts);
        println!("  retry-delay-ms: {}", self.retry.base_delay_ms);
        println!("  retrieval-max-chars: {}", self.retrieval.max_chars);
        println!("  battle-cooldown-ms: {}", self.battle.cooldown_ms);
        println!("  battle-turns: {}", self.battle.max_turns);
        if self.default_models.is_empty() {
            println!("  default-models: (none set)");
        } else {
            println!("  default-models:");
            let mut entries: Vec<_> = self.default_models.iter().collect();
            entries.sort_by_key(|(provider, _)| *provider);
            for (provider, model) in entries {
                println!("    {provider}: {model}");
            }
        }
        if !self.custom_providers.is_empty() {
            println!("  custom-providers:");
            for provider in &self.custom_providers {
                println!(
                    "    {} ({}) {} [{}]",
                    provider.id,
                    provider.display_name,
                    provider.base_url,
                    provider.mode.as_deref().unwrap_or("openai")
                );
            }
        }
    }
}
