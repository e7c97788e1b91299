use std::fmt;
use strum::{Display, EnumString};
use thiserror::Error;

//
// Public Interface
//

pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage that produced a failure.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Compile,
    Parse,
    Translate,
    Solve,
}

/// Position of an offending construct inside a module.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Location {
    pub function: Option<String>,
    pub block: Option<String>,
    pub index: Option<usize>,
    pub line: Option<usize>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("external compiler failed: {0}")]
    Compile(String),

    #[error("cannot read input: {0}")]
    Io(String),

    #[error("malformed IR at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("unsupported construct '{construct}' at {location}")]
    UnsupportedConstruct { construct: String, location: Location },

    #[error("type error at {location}: {message}")]
    TypeError { message: String, location: Location },

    #[error("SSA violation at {location}: {message}")]
    SsaViolation { message: String, location: Location },

    #[error("function @{function} has a loop (back-edge {latch} -> {header}) and unroll bound is 0")]
    LoopNotSupported {
        function: String,
        header: String,
        latch: String,
    },

    #[error("internal invariant violated at {location}: {message}")]
    InvariantViolation { message: String, location: Location },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn stage(&self) -> Stage {
        match self {
            Error::Compile(_) => Stage::Compile,
            Error::Parse { .. } | Error::Io(_) => Stage::Parse,
            _ => Stage::Translate,
        }
    }

    /// Errors that abort the whole run rather than a single function.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Compile(_)
                | Error::Io(_)
                | Error::Parse { .. }
                | Error::InvariantViolation { .. }
        )
    }

    pub fn parse<S: Into<String>>(line: usize, message: S) -> Self {
        Error::Parse {
            line,
            message: message.into(),
        }
    }

    pub fn unsupported<S: Into<String>>(construct: S, location: Location) -> Self {
        Error::UnsupportedConstruct {
            construct: construct.into(),
            location,
        }
    }

    pub fn type_error<S: Into<String>>(message: S, location: Location) -> Self {
        Error::TypeError {
            message: message.into(),
            location,
        }
    }

    pub fn ssa<S: Into<String>>(message: S, location: Location) -> Self {
        Error::SsaViolation {
            message: message.into(),
            location,
        }
    }

    pub fn invariant<S: Into<String>>(message: S, location: Location) -> Self {
        Error::InvariantViolation {
            message: message.into(),
            location,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Location {
    pub fn function(name: &str) -> Self {
        Self {
            function: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn instruction(function: &str, block: &str, index: usize, line: usize) -> Self {
        Self {
            function: Some(function.to_string()),
            block: Some(block.to_string()),
            index: Some(index),
            line: Some(line),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.function {
            Some(function) => write!(f, "@{}", function)?,
            None => write!(f, "module")?,
        }
        if let Some(block) = &self.block {
            write!(f, " block %{}", block)?;
        }
        if let Some(index) = self.index {
            write!(f, " instruction #{}", index)?;
        }
        if let Some(line) = self.line {
            write!(f, " (line {})", line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_names_function_block_and_line() {
        let location = Location::instruction("f", "entry", 2, 17);
        assert_eq!(
            location.to_string(),
            "@f block %entry instruction #2 (line 17)"
        );
        assert_eq!(Location::default().to_string(), "module");
    }

    #[test]
    fn stages_follow_error_kind() {
        assert_eq!(Error::parse(3, "x").stage(), Stage::Parse);
        assert_eq!(
            Error::unsupported("fadd", Location::function("f")).stage(),
            Stage::Translate
        );
        assert_eq!(Stage::Solve.to_string(), "solve");
        assert!(Error::parse(1, "x").is_fatal());
        assert!(!Error::type_error("x", Location::default()).is_fatal());
    }
}
