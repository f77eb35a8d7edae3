pub mod manager;
pub mod system_prompts;
pub mod templates;

pub use manager::{BuiltPrompt, PromptManager, PromptParams};
pub use templates::TemplateRegistry;

pub use pi_error::{PiError, Result};
