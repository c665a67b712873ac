use std::error::Error as StdError;
use std::fmt;
use std::io;

/// A generic "error happened" for the crate.
///
/// The internal kind is deliberately hidden: callers inspect an `Error`
/// through the `is_*` predicates rather than matching on a public enum, the
/// same shape `hyper::Error` uses so the taxonomy can grow without breaking
/// downstream matches.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Box<dyn StdError + Send + Sync>>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse,
    IncompleteMessage,
    ProtocolMisuse,
    HandlerFailure,
    Io,
    Bind,
    Listen,
    Accept,
}

/// A type-erased error, used at the boundary of the handler contract
/// (§6.2) where the embedder's own error type crosses into this crate.
pub type BoxError = Box<dyn StdError + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
struct Reason(&'static str);

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl StdError for Reason {}

impl Error {
    fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    fn with<C: Into<BoxError>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_parse(reason: &'static str) -> Error {
        Error::new(Kind::Parse).with(Reason(reason))
    }

    pub(crate) fn new_incomplete_message() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_protocol_misuse(reason: &'static str) -> Error {
        Error::new(Kind::ProtocolMisuse).with(Reason(reason))
    }

    pub(crate) fn new_handler_failure(cause: BoxError) -> Error {
        Error::new(Kind::HandlerFailure).with(cause)
    }

    pub(crate) fn new_io(cause: io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_bind(cause: io::Error) -> Error {
        Error::new(Kind::Bind).with(cause)
    }

    pub(crate) fn new_listen(cause: io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_accept(cause: io::Error) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    /// True if this error came from malformed request bytes.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse | Kind::IncompleteMessage)
    }

    /// True if the handler misused the send/receive contract.
    pub fn is_protocol_misuse(&self) -> bool {
        matches!(self.inner.kind, Kind::ProtocolMisuse)
    }

    /// True if the handler itself failed (panicked/returned an error).
    pub fn is_handler_failure(&self) -> bool {
        matches!(self.inner.kind, Kind::HandlerFailure)
    }

    /// True if the listening socket could not be bound at all.
    pub fn is_bind(&self) -> bool {
        matches!(self.inner.kind, Kind::Bind | Kind::Listen)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse => "invalid HTTP/1.1 message",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::ProtocolMisuse => "handler violated the send/receive contract",
            Kind::HandlerFailure => "request handler failed",
            Kind::Io => "transport error",
            Kind::Bind => "failed to bind listener",
            Kind::Listen => "failed to construct listener",
            Kind::Accept => "failed to accept connection",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("rasgi::Error");
        builder.field("kind", &self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            builder.field("cause", cause);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())?;
        if let Some(ref cause) = self.inner.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::new_io(err)
    }
}
