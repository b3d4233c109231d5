use std::fmt;

use super::Error;

/// An ordered collection of independent errors about one object.
///
/// Appending never overwrites: every problem found on an object during a
/// translation pass is retained and rendered.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    pub fn extend(&mut self, other: MultiError) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<Error> {
        self.errors
    }

    /// `None` when nothing was accumulated.
    pub fn into_option(self) -> Option<Self> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<Error> for MultiError {
    fn from(err: Error) -> Self {
        Self { errors: vec![err] }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => write!(f, "no errors"),
            [single] => write!(f, "{}", single),
            many => {
                write!(f, "{} errors occurred:", many.len())?;
                for err in many {
                    write!(f, "\n\t* {}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_error_renders_without_header() {
        let errs = MultiError::from(Error::validation("bad port"));
        assert_eq!(errs.to_string(), "Validation error: bad port");
    }

    #[test]
    fn appends_keep_every_error() {
        let mut errs = MultiError::new();
        errs.push(Error::validation("first"));
        errs.push(Error::validation("second"));

        let rendered = errs.to_string();
        assert!(rendered.starts_with("2 errors occurred:"));
        assert!(rendered.contains("first"));
        assert!(rendered.contains("second"));
    }

    #[test]
    fn empty_accumulator_is_none() {
        assert!(MultiError::new().into_option().is_none());
    }
}
