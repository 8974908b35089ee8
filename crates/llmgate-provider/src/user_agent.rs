use std::sync::atomic::{AtomicUsize, Ordering};

const USER_AGENTS: [&str; 4] = [
    "openai-node/4.77.0 node/20.11.1",
    "OpenAI/Python 1.59.3",
    "google-genai-sdk/0.12.0 gl-node/20.11.1",
    "curl/8.5.0",
];

/// Round-robin pool of client identifier strings sent upstream.
#[derive(Debug, Default)]
pub struct UserAgentPool {
    cursor: AtomicUsize,
}

impl UserAgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> &'static str {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[index % USER_AGENTS.len()]
    }
}
