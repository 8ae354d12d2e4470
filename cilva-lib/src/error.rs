use thiserror::Error;

/// Failure classes for method translation. Every failure is scoped to the method being
/// translated; the driver may report it and carry on with the next method.
#[derive(Debug, Error)]
pub enum Error {
    /// The input violates a structural rule (regions, stack shape, branch targets).
    #[error("malformed input: {0}")]
    Malformed(String),
    /// The input is well formed but has no JVM rendition.
    #[error("unsupported construct: {0}")]
    Unsupported(String),
    /// An invariant of the translator itself was broken.
    #[error("internal error: {0}")]
    Internal(String),
    #[error("in method {method}: {source}")]
    InMethod { method : String, source : Box<Error> },
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ErrorKind {
    Malformed,
    Unsupported,
    Internal,
}

impl Error {
    pub fn malformed(msg : impl Into<String>) -> Error { Error::Malformed(msg.into()) }
    pub fn unsupported(msg : impl Into<String>) -> Error { Error::Unsupported(msg.into()) }
    pub fn internal(msg : impl Into<String>) -> Error { Error::Internal(msg.into()) }

    pub fn in_method(self, method : impl Into<String>) -> Error {
        Error::InMethod { method : method.into(), source : Box::new(self) }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Malformed(_)            => ErrorKind::Malformed,
            Error::Unsupported(_)          => ErrorKind::Unsupported,
            Error::Internal(_)             => ErrorKind::Internal,
            Error::InMethod { source, .. } => source.kind(),
        }
    }
}

pub type GeneralResult<T> = std::result::Result<T, Error>;

#[test]
fn test_kind_sees_through_context() {
    let e = Error::malformed("clauses overlap").in_method("Foo::bar");
    assert_eq!(e.kind(), ErrorKind::Malformed);
    assert_eq!(e.to_string(), "in method Foo::bar: malformed input: clauses overlap");
}
