pub const DEFAULT_LISTEN: &str = "0.0.0.0:3000";
pub const DEFAULT_BASE_URL: &str = "https://router.huggingface.co/v1";
pub const DEFAULT_MODEL: &str = "openai/gpt-oss-20b";
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Process-wide settings, read once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub metrics_path: String,
    pub base_url: String,
    pub default_model: String,
    /// Provider credential. `None` when `HF_TOKEN` is unset or blank.
    pub hf_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            listen: read("HFSTREAM_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
            metrics_path: read("HFSTREAM_METRICS_PATH")
                .unwrap_or_else(|| DEFAULT_METRICS_PATH.to_string()),
            base_url: read("HFSTREAM_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            default_model: read("HFSTREAM_DEFAULT_MODEL")
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            hf_token: read("HF_TOKEN"),
        }
    }

    pub fn has_credential(&self) -> bool {
        self.hf_token.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
