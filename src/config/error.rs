#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("experiment validation failed: {0}")]
    Validation(String),
    #[error("invalid time `{raw}`; expected YYYY-MM-DDTHH:MM or YYYY-MM-DDTHH:MM:SS")]
    InvalidTime { raw: String },
    #[error("invalid cycle length `{raw}`; expected a positive duration like `12h`, `30m` or `3600s`")]
    InvalidCycleLength { raw: String },
    #[error("stage `{stage}` declares unknown kind `{kind}`")]
    UnknownStageKind { stage: String, kind: String },
}
