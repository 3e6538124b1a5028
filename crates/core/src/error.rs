use thiserror::Error;

/// Errors raised while loading or validating pool configuration.
///
/// Every variant that concerns a single setting names the key, so an
/// operator can find the offending line without reading the source.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid expression for `{key}` ({expr:?}): {reason}")]
    Expression {
        key: String,
        expr: String,
        reason: String,
    },

    #[error("`{key}` must resolve to a positive integer, got {value}")]
    NonPositive { key: String, value: f64 },

    #[error("{class}: maxPoolSize ({max}) is smaller than poolSize ({core})")]
    MaxBelowCore {
        class: String,
        core: usize,
        max: usize,
    },

    #[error("`{0}` must not be empty")]
    EmptyValue(String),

    #[error("unsupported configuration key: {0}")]
    UnsupportedKey(String),

    #[error("syntax error on line {line}: {content:?}")]
    Syntax { line: usize, content: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
