pub mod ollama;
pub mod remote;

pub use ollama::OllamaProvider;
pub use remote::RemoteLlmProvider;
