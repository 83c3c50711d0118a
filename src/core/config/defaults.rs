use crate::core::config::data::Config;

impl Config {
    pub fn get_default_model(&self, provider: &str) -> Option<&String> {
        let normalized = provider.to_lowercase();
        self.default_models
            .get(&normalized)
            .or_else(|| self.default_models.get(provider))
    }

    pub fn set_default_model(&mut self, provider: String, model: String) {
        let normalized = provider.to_lowercase();
        self.default_models.insert(normalized.clone(), model);
        if normalized != provider {
            self.default_models.remove(&provider);
        }
    }

    pub fn unset_default_model(&mut self, provider: &str) {
        let normalized = provider.to_lowercase();
        self.default_models.remove(&normalized);
        if normalized != provider {
            self.default_models.remove(provider);
        }
    }

    /// Apply a `key = value` pair from the command line.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<(), String> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| format!("Invalid value for {key}: {value}"))
        }

        match key {
            "default-provider" => self.default_provider = Some(value.trim().to_string()),
            "system-instruction" => self.system_instruction = Some(value.to_string()),
            "temperature" => self.generation.temperature = parse(key, value)?,
            "top-p" => self.generation.top_p = parse(key, value)?,
            "max-output-tokens" => self.generation.max_output_tokens = parse(key, value)?,
            "history-window" => self.generation.history_window = parse(key, value)?,
            "search" => self.generation.search = parse(key, value)?,
            "retry-attempts" => self.retry.max_attempts = parse::<u32>(key, value)?.max(1),
            "retry-delay-ms" => self.retry.base_delay_ms = parse(key, value)?,
            "retrieval-max-chars" => self.retrieval.max_chars = parse(key, value)?,
            "battle-cooldown-ms" => self.battle.cooldown_ms = parse(key, value)?,
            "battle-turns" => self.battle.max_turns = parse(key, value)?,
            _ => return Err(format!("Unknown config key: {key}")),
        }
        Ok(())
    }
}
