pub mod anthropic;
pub mod classify;
pub mod factory;
pub mod health;
pub mod normalize;
pub mod openai;
pub mod router;
pub mod sse;

pub mod mock;

pub use anthropic::AnthropicProvider;
pub use classify::ErrorClassifier;
pub use factory::{build_chain, build_provider};
pub use health::InMemoryHealthRegistry;
pub use normalize::{NormalizedOutput, StreamNormalizer};
pub use openai::OpenAiCompatibleProvider;
pub use router::{CallMode, FallbackRouter, FinalAnswer, RouterError};
