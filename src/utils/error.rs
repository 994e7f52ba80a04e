use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatteryError {
    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid formula '{formula}' at position {position}: {reason}")]
    InvalidFormula {
        formula: String,
        position: usize,
        reason: String,
    },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid value for '{field}' ({value}): {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("LLM request failed ({status}): {message}")]
    LlmError { status: u16, message: String },

    #[error("Materials database lookup failed: {message}")]
    MaterialsDbError { message: String },

    #[error("Scoring tool failed: {message}")]
    ScoringError { message: String },

    #[error("No new candidates after {attempts} attempts")]
    NoNewCandidates { attempts: u32 },

    #[error("Ranking pass '{pass}' failed: {details}")]
    RankingError { pass: String, details: String },

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Input,
    Configuration,
    ExternalService,
    Storage,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl BatteryError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BatteryError::InvalidFormula { .. } | BatteryError::ValidationError { .. } => {
                ErrorCategory::Input
            }
            BatteryError::ConfigError { .. }
            | BatteryError::InvalidConfigValueError { .. }
            | BatteryError::MissingConfigError { .. } => ErrorCategory::Configuration,
            BatteryError::ApiError(_)
            | BatteryError::LlmError { .. }
            | BatteryError::MaterialsDbError { .. }
            | BatteryError::ScoringError { .. } => ErrorCategory::ExternalService,
            BatteryError::IoError(_) | BatteryError::CsvError(_) => ErrorCategory::Storage,
            BatteryError::SerializationError(_)
            | BatteryError::NoNewCandidates { .. }
            | BatteryError::RankingError { .. }
            | BatteryError::SessionNotFound { .. } => ErrorCategory::Processing,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            BatteryError::SessionNotFound { .. } => ErrorSeverity::Low,
            // 外部服務通常可以重試
            BatteryError::ApiError(_)
            | BatteryError::LlmError { .. }
            | BatteryError::MaterialsDbError { .. }
            | BatteryError::NoNewCandidates { .. } => ErrorSeverity::Medium,
            BatteryError::InvalidFormula { .. }
            | BatteryError::ValidationError { .. }
            | BatteryError::ScoringError { .. }
            | BatteryError::RankingError { .. }
            | BatteryError::CsvError(_)
            | BatteryError::SerializationError(_)
            | BatteryError::ConfigError { .. }
            | BatteryError::InvalidConfigValueError { .. }
            | BatteryError::MissingConfigError { .. } => ErrorSeverity::High,
            BatteryError::IoError(_) => ErrorSeverity::Critical,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            BatteryError::ApiError(_) => "Check network connectivity and the API endpoint",
            BatteryError::CsvError(_) => "Check that the CSV file has a header row and consistent columns",
            BatteryError::IoError(_) => "Check that the file exists and that you have permission to access it",
            BatteryError::SerializationError(_) => "The service returned an unexpected payload; check the API version",
            BatteryError::InvalidFormula { .. } => "Use plain formulas such as LiFePO4 or Li(Ni0.8Co0.1Mn0.1)O2",
            BatteryError::ConfigError { .. }
            | BatteryError::InvalidConfigValueError { .. }
            | BatteryError::MissingConfigError { .. } => "Review the configuration file and environment variables",
            BatteryError::LlmError { status: 401, .. } => "Set OPENAI_API_KEY or OPENROUTER_API_KEY",
            BatteryError::LlmError { status: 429, .. } => "Rate limited; wait a moment and retry",
            BatteryError::LlmError { .. } => "Check the LLM backend (OPENAI_API_BASE) and model name",
            BatteryError::MaterialsDbError { .. } => "Set MP_API_KEY or disable the Materials Project lookup",
            BatteryError::ScoringError { .. } => "Run the scoring tool by hand on a few formulas to check its output",
            BatteryError::NoNewCandidates { .. } => "Give feedback with a different direction or raise llm.max_attempts",
            BatteryError::RankingError { .. } => "Inspect the failing pass output and the scoring tool logs",
            BatteryError::SessionNotFound { .. } => "Start a new session",
            BatteryError::ValidationError { .. } => "Fix the input values and try again",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Input => format!("Invalid input: {}", self),
            ErrorCategory::Configuration => format!("Configuration problem: {}", self),
            ErrorCategory::ExternalService => format!("External service error: {}", self),
            ErrorCategory::Storage => format!("File access error: {}", self),
            ErrorCategory::Processing => format!("Processing failed: {}", self),
        }
    }

    /// 依嚴重程度決定程序退出碼
    pub fn exit_code(&self) -> i32 {
        match self.severity() {
            ErrorSeverity::Low => 0,
            ErrorSeverity::Medium => 2,
            ErrorSeverity::High => 1,
            ErrorSeverity::Critical => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, BatteryError>;
