use thiserror::Error;

/// Enumeration of errors detected while building a `DependencyGraph` from section declarations.
/// Both are configuration-time defects of a pump type, never runtime conditions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    #[error("section {section} depends on unknown section {dependency}")]
    UnknownDependency { section: String, dependency: String },
    #[error("circular dependency between sections: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// Enumeration of errors raised by operations on a `PumpConfig`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{0} is not a known configuration section")]
    UnknownSection(String),
    #[error("section {section} has no field named {field}")]
    UnknownField { section: String, field: String },
    #[error("section {section} has no subsection #{index}")]
    SubsectionOutOfRange { section: String, index: usize },
    #[error("section {0} does not allow multiple subsections")]
    NotMultiple(String),
    #[error("section {0} must keep at least one subsection")]
    LastSubsection(String),
    #[error("invalid value for {section}/{field}: {reason}")]
    InvalidValue {
        section: String,
        field: String,
        reason: String,
    },
    #[error(transparent)]
    Dependency(#[from] DependencyError),
}

/// Enumeration of errors returned by a `TargetApi` implementation.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("invalid target settings: {0}")]
    Settings(String),
    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),
    #[error("request to {url} failed: {error}")]
    Request { url: String, error: reqwest::Error },
    #[error("{url} responded with status {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("no upload target found for unit {unit} and test list {test_list}")]
    NotFound { unit: String, test_list: String },
    #[error("{count} upload targets found for unit {unit} and test list {test_list}")]
    Ambiguous {
        unit: String,
        test_list: String,
        count: u64,
    },
    #[error("unexpected response from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

impl TargetError {
    /// Ambiguous matches imply a configuration defect on the target side and are escalated.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, TargetError::Ambiguous { .. })
    }
}

/// Enumeration of errors raised by source-specific collaborators (fetch, transform, post-process).
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Enumeration of errors surfaced by a `PumpRuntime` to the host application.
#[derive(Error, Debug)]
pub enum PumpError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("pump {pump} has invalid configuration sections: {}", .sections.join(", "))]
    Invalid { pump: String, sections: Vec<String> },
    #[error("pump {0} is not active")]
    Inactive(String),
    #[error("pump {0} is already running")]
    AlreadyRunning(String),
    #[error("pump {0} has been terminated")]
    Terminated(String),
    #[error("{0} is not a registered pump type")]
    UnknownPumpType(String),
    #[error("pump type {0} is already registered")]
    DuplicatePumpType(String),
}
