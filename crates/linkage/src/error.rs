use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum LinkError {
    /// TOML parse / deserialization error.
    ConfigParse(String),
    /// Malformed model state (empty comparison, missing else level, bad probability, ...).
    Configuration(String),
    /// A blocking rule would produce more candidate pairs than the configured ceiling.
    /// `pairs` is where counting stopped, so it can undercount the rule.
    BlockingExplosion { rule: String, pairs: u64, ceiling: u64 },
    /// Zero u probability, or a bayes factor that is not finite.
    DegenerateParameter(String),
    /// The backend could not execute or materialize a query.
    Backend(String),
    /// Training was cancelled between iterations.
    Cancelled,
    /// Missing required column in input data.
    MissingColumn { table: String, column: String },
    /// IO error (file read, etc.).
    Io(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigParse(msg) => write!(f, "config parse error: {msg}"),
            Self::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Self::BlockingExplosion { rule, pairs, ceiling } => write!(
                f,
                "blocking rule '{rule}' produces {pairs} candidate pairs, above the ceiling of {ceiling}"
            ),
            Self::DegenerateParameter(msg) => write!(f, "degenerate parameter: {msg}"),
            Self::Backend(msg) => write!(f, "backend error: {msg}"),
            Self::Cancelled => write!(f, "training cancelled"),
            Self::MissingColumn { table, column } => {
                write!(f, "table '{table}': missing column '{column}'")
            }
            Self::Io(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for LinkError {}
