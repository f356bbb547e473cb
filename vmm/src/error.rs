use core::panic::Location;

/// Construct an error of the given kind.
macro_rules! err {
    ($err:ident) => {
        crate::error::Error::from_kind(crate::error::ErrorKind::$err)
    };
}

/// Construct and return with an error of the given kind.
macro_rules! bail {
    ($err:ident) => {
        return Err(crate::error::err!($err))
    };
}

/// Check a condition and return with an error of the given kind if the
/// expression is false.
macro_rules! ensure {
    ($condition:expr, $err:ident) => {
        if !$condition {
            crate::error::bail!($err);
        }
    };
}

pub(crate) use {bail, ensure, err};

#[derive(Clone, Copy)]
pub struct Error {
    kind: ErrorKind,
    caller_location: &'static Location<'static>,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[doc(hidden)]
    #[track_caller]
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            caller_location: Location::caller(),
        }
    }
}

impl core::fmt::Debug for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} at {}", self.kind, self.caller_location)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A physical page, a slab object or a page-table page could not be
    /// allocated.
    OutOfMemory,
    /// A node was requested with more pages than a node can hold.
    OutOfCapacity,
    /// The target range of an insertion is already mapped.
    Overlap,
    /// An unmap request cuts through the middle of a mapping.
    PartialUnmap,
    /// An address is outside the user range, wraps, or is unmapped.
    BadAddress,
    /// The backing store returned an error or a short read.
    Io,
    /// A fault could not be resolved; the faulting thread cannot continue.
    Fault,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
