use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use llmgate_protocol::chat::Usage;

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct UsageCounters {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct UsageRow {
    pub provider: String,
    pub model: String,
    #[serde(flatten)]
    pub counters: UsageCounters,
}

/// Best-effort per-(provider, model) token counters. Recording never
/// blocks a request; a poisoned lock just drops the sample.
#[derive(Debug, Default)]
pub struct UsageTracker {
    rows: Mutex<HashMap<(String, String), UsageCounters>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, provider: &str, model: &str, usage: &Usage) {
        let Ok(mut rows) = self.rows.lock() else {
            return;
        };
        let counters = rows
            .entry((provider.to_string(), model.to_string()))
            .or_default();
        counters.requests += 1;
        counters.prompt_tokens += u64::from(usage.prompt_tokens);
        counters.completion_tokens += u64::from(usage.completion_tokens);
        counters.total_tokens += u64::from(usage.total_tokens);
    }

    pub fn snapshot(&self) -> Vec<UsageRow> {
        let Ok(rows) = self.rows.lock() else {
            return Vec::new();
        };
        let mut out: Vec<UsageRow> = rows
            .iter()
            .map(|((provider, model), counters)| UsageRow {
                provider: provider.clone(),
                model: model.clone(),
                counters: *counters,
            })
            .collect();
        out.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        out
    }
}
