pub mod adapter;
pub mod client;
pub mod error;
pub mod gemini;
pub mod openai;
pub mod user_agent;

pub use adapter::{
    AdapterRegistry, EventReceiver, ProviderReply, ProviderRequest, StreamEvent, UpstreamAdapter,
};
pub use error::{ErrorKind, UpstreamError};
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;
pub use user_agent::UserAgentPool;
