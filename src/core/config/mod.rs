pub mod data;
pub mod defaults;
pub mod io;
pub mod printing;

pub use data::{
    BattleSettings, Config, CustomProvider, GenerationConfig, RetrievalSettings, RetrySettings,
};
pub use io::ConfigError;
