//! Error related business logic of `zener`.
//!
//! Contains the `ErrorKind` enum shared by every subsystem of the
//! client, as well as other useful extensions of the `std::result::Result`
//! type, to work with our very own `Error` type.

use std::error;
use std::fmt;
use std::io;
use std::result;

/// Extension of the standard library's `Result` type,
/// used to wrap its error in a `zener::diode::error::Error`.
pub trait ResultWrappedExt {
    type T;

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
}

/// Extension of the standard library's `Result` type.
///
/// Different from `ResultWrappedExt`, this trait is
/// used in cases where we want to drop the underlying
/// error type in the `Result`. Having this possibility
/// might be useful when the error type in the `Result`
/// doesn't implement `Send`.
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|_| Error::wrapped(kind, msg))
    }
}

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

/// The class of failure, as observed by callers.
///
/// Kinds carry the payloads the edge protocol needs to report back
/// to front-ends; everything else about the underlying cause lives
/// in the wrapped error value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A frame failed to decode: length mismatch, unknown tag,
    /// or a nested term overrunning its parent.
    MalformedFrame,
    /// The client was closed before or during the operation.
    ClientClosed,
    /// The operation was cancelled; carries the edge host.
    Cancelled(String),
    /// The in-flight call queue or an actor mailbox is at capacity.
    BackpressureFull,
    /// The server answered with an error response: (method, message).
    Rpc(String, String),
    /// The server reported a timeout opening the remote port.
    PortOpenTimeout,
    /// The server refused a submitted transaction.
    SendTransactionFailed,
    /// A name lookup returned no usable destination.
    EmptyBnsResult,
    /// A state proof did not hash up to the published account roots.
    BadMerkleProof,
    /// The persisted block anchor does not match the chain served
    /// by the edge; the anchor has been deleted.
    AnchorLost,
    /// Network validation made no forward progress.
    NoProgress,
    /// A signature failed to verify or recover.
    SignatureInvalid,
    /// An I/O failure on the socket or the on-disk store.
    Transport,
}

/// The error type used throughout this crate.
pub struct Error {
    inner: ErrorInner,
}

#[derive(Debug)]
enum ErrorInner {
    Simple(ErrorKind),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl Error {
    /// Returns an error not wrapping another
    /// error implementation, with kind `ErrorKind`.
    pub fn simple(kind: ErrorKind) -> Self {
        let inner = ErrorInner::Simple(kind);
        Error { inner }
    }

    /// Wraps an arbitrary error in an `Error`,
    /// with kind of type `ErrorKind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        let inner = ErrorInner::Wrapped(kind, e.into());
        Error { inner }
    }

    /// Returns a reference to the `ErrorKind` of this `Error`.
    pub fn kind(&self) -> &ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => k,
            ErrorInner::Wrapped(k, _) => k,
        }
    }

    /// Swaps the `ErrorKind` of this `Error`.
    pub fn swap_kind(self, k: ErrorKind) -> Self {
        let inner = match self.inner {
            ErrorInner::Simple(_) => ErrorInner::Simple(k),
            ErrorInner::Wrapped(_, e) => ErrorInner::Wrapped(k, e),
        };
        Error { inner }
    }

    /// Checks whether this `Error` has the given kind.
    pub fn is(&self, k: &ErrorKind) -> bool {
        self.kind() == k
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(fmt, "{:?}", k),
            ErrorInner::Wrapped(k, e) => write!(fmt, "{:?}: {}", k, e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::wrapped(ErrorKind::Transport, e)
    }
}

impl error::Error for Error {}
