pub mod anthropic;
pub mod openai;
pub mod render;

pub mod mock;

pub use anthropic::AnthropicAdapter;
pub use mock::{MockResponse, RecordedCall, ScriptedAdapter};
pub use openai::OpenAiResponsesAdapter;
