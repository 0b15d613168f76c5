use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeraldError {
    #[error("Upstream fetch error: {0}")]
    Fetch(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("KV error: {0}")]
    Kv(String),

    #[error("Webhook error: {0}")]
    Webhook(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
