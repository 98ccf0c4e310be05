use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid phrase {phrase:?}: {source}")]
    InvalidPhrase {
        phrase: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
