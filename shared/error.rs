use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use ndarray_linalg::error::LinalgError;
use thiserror::Error;

/// Location of an offending input: any subset of file, line, column and token.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Diagnostic {
    pub path: Option<PathBuf>,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub token: Option<String>,
}

impl Diagnostic {
    pub fn file(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            ..Self::default()
        }
    }

    pub fn at_line(path: &Path, line: usize) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            line: Some(line),
            ..Self::default()
        }
    }

    pub fn with_column(mut self, column: usize) -> Self {
        self.column = Some(column);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}", path.display())?,
            None => f.write_str("<input>")?,
        }
        if let Some(line) = self.line {
            write!(f, ":{line}")?;
            if let Some(column) = self.column {
                write!(f, ":{column}")?;
            }
        }
        if let Some(token) = &self.token {
            write!(f, " near '{token}'")?;
        }
        Ok(())
    }
}

/// The single error type shared by every component of the crate.
#[derive(Debug, Error)]
pub enum GremlError {
    #[error("{diagnostic}: {message}")]
    InputShape {
        message: String,
        diagnostic: Diagnostic,
    },

    #[error("{diagnostic}: {message}")]
    InputValue {
        message: String,
        diagnostic: Diagnostic,
    },

    #[error("{message}")]
    Numerical {
        message: String,
        #[source]
        source: Option<LinalgError>,
    },

    #[error("{0}")]
    Constraint(String),

    #[error("REML did not converge within {iterations} iterations")]
    NonConvergence { iterations: usize },

    #[error("internal invariant violated: {0}")]
    Programmer(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse TOML report: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("failed to serialize TOML report: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("failed to write delimited output: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, GremlError>;

impl GremlError {
    pub fn shape(message: impl Into<String>, diagnostic: Diagnostic) -> Self {
        Self::InputShape {
            message: message.into(),
            diagnostic,
        }
    }

    pub fn value(message: impl Into<String>, diagnostic: Diagnostic) -> Self {
        Self::InputValue {
            message: message.into(),
            diagnostic,
        }
    }

    pub fn numerical(message: impl Into<String>) -> Self {
        Self::Numerical {
            message: message.into(),
            source: None,
        }
    }

    pub fn linalg(message: impl Into<String>, source: LinalgError) -> Self {
        Self::Numerical {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn programmer(message: impl Into<String>) -> Self {
        Self::Programmer(message.into())
    }

    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// True for the kinds that describe bad user input rather than a failed fit.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::InputShape { .. } | Self::InputValue { .. } | Self::Io { .. }
        )
    }

    /// Tags a numerical failure with the optimizer iteration it occurred in.
    pub fn at_iteration(self, iteration: usize) -> Self {
        match self {
            Self::Numerical { message, source } => Self::Numerical {
                message: format!("iteration {iteration}: {message}"),
                source,
            },
            other => other,
        }
    }

    /// Prefixes the diagnostic of an input error with the file it came from,
    /// leaving other kinds untouched.
    pub fn in_file(self, path: &Path) -> Self {
        match self {
            Self::InputShape {
                message,
                mut diagnostic,
            } => {
                diagnostic.path.get_or_insert_with(|| path.to_path_buf());
                Self::InputShape {
                    message,
                    diagnostic,
                }
            }
            Self::InputValue {
                message,
                mut diagnostic,
            } => {
                diagnostic.path.get_or_insert_with(|| path.to_path_buf());
                Self::InputValue {
                    message,
                    diagnostic,
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_renders_all_present_parts() {
        let diag = Diagnostic::at_line(Path::new("pheno.tsv"), 7)
            .with_column(3)
            .with_token("abc");
        assert_eq!(diag.to_string(), "pheno.tsv:7:3 near 'abc'");
    }

    #[test]
    fn diagnostic_without_path_uses_placeholder() {
        let diag = Diagnostic::default().with_token("x");
        assert_eq!(diag.to_string(), "<input> near 'x'");
    }

    #[test]
    fn in_file_only_fills_missing_path() {
        let err = GremlError::value("bad", Diagnostic::default().with_token("q"));
        let err = err.in_file(Path::new("covar.txt"));
        assert_eq!(err.to_string(), "covar.txt near 'q': bad");

        let err = GremlError::shape("wide", Diagnostic::file(Path::new("a.txt")));
        let err = err.in_file(Path::new("b.txt"));
        assert_eq!(err.to_string(), "a.txt: wide");
    }

    #[test]
    fn iteration_tag_only_touches_numerical_errors() {
        let err = GremlError::numerical("V matrix is not positive definite").at_iteration(4);
        assert_eq!(err.to_string(), "iteration 4: V matrix is not positive definite");
        let err = GremlError::programmer("x").at_iteration(4);
        assert_eq!(err.to_string(), "internal invariant violated: x");
    }

    #[test]
    fn numerical_errors_are_not_input_errors() {
        assert!(!GremlError::numerical("V matrix is not positive definite").is_input_error());
        assert!(GremlError::shape("x", Diagnostic::default()).is_input_error());
    }
}
