use std::error::Error;
use std::fmt::{Display, Formatter};

pub type KappaResult<T> = Result<T, KappaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KappaErrorCategory {
    InputValidationError,
    IoSystemError,
    ComputationError,
    InternalError,
}

impl KappaErrorCategory {
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::InputValidationError => 2,
            Self::IoSystemError => 3,
            Self::ComputationError => 4,
            Self::InternalError => 5,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InputValidationError => "InputValidationError",
            Self::IoSystemError => "IoSystemError",
            Self::ComputationError => "ComputationError",
            Self::InternalError => "InternalError",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KappaError {
    category: KappaErrorCategory,
    tag: &'static str,
    message: String,
}

impl KappaError {
    pub fn new(
        category: KappaErrorCategory,
        tag: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            tag,
            message: message.into(),
        }
    }

    pub fn input_validation(tag: &'static str, message: impl Into<String>) -> Self {
        Self::new(KappaErrorCategory::InputValidationError, tag, message)
    }

    pub fn io_system(tag: &'static str, message: impl Into<String>) -> Self {
        Self::new(KappaErrorCategory::IoSystemError, tag, message)
    }

    pub fn computation(tag: &'static str, message: impl Into<String>) -> Self {
        Self::new(KappaErrorCategory::ComputationError, tag, message)
    }

    pub fn internal(tag: &'static str, message: impl Into<String>) -> Self {
        Self::new(KappaErrorCategory::InternalError, tag, message)
    }

    pub const fn category(&self) -> KappaErrorCategory {
        self.category
    }

    pub const fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    pub fn diagnostic_line(&self) -> String {
        format!("ERROR: [{}] {}", self.tag, self.message)
    }
}

impl Display for KappaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.as_str(),
            self.tag,
            self.message
        )
    }
}

impl Error for KappaError {}

impl From<std::io::Error> for KappaError {
    fn from(error: std::io::Error) -> Self {
        Self::io_system("IO.SYSTEM", error.to_string())
    }
}
