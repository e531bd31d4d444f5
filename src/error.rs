//! # Error Types
//!
//! Every public operation returns [`Result<T>`] whose error is one of the
//! kinds below. Lookup misses are not errors: `get` returns `Ok(None)` and
//! `delete` returns `Ok(false)`. [`Error::NotFound`] is reserved for misses
//! at the database-table level, such as opening a named database that does
//! not exist.
//!
//! Page-level code reports problems through `eyre` reports with context.
//! When such a report reaches the public API it is converted back into a
//! typed error: reports wrapping an [`Error`] unwrap to it, reports caused by
//! an `std::io::Error` become [`Error::Io`], and everything else is treated as
//! structural corruption.

use std::io;

use thiserror::Error;

use crate::PageNo;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("key/data pair already exists")]
    KeyExists,

    #[error("key of {size} bytes exceeds the maximum of {max} bytes")]
    KeyTooLarge { size: usize, max: usize },

    #[error("map full: {requested_pages} pages requested, map holds {max_pages}")]
    OutOfSpace {
        requested_pages: u64,
        max_pages: u64,
    },

    #[error("environment is corrupted: {0}")]
    Corrupted(String),

    #[error("cursor is bound to a finished transaction")]
    StaleCursor,

    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("write transaction already active")]
    WouldBlock,

    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("named database limit of {max} reached")]
    DatabasesFull { max: u32 },

    #[error("reader table full ({max} live readers)")]
    ReadersFull { max: u32 },

    #[error("fixed-size duplicate expected {expected} bytes, got {actual}")]
    BadValueSize { expected: usize, actual: usize },

    #[error("incompatible operation: {0}")]
    Incompatible(String),
}

/// Fieldless mirror of [`Error`] for callers that only dispatch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    KeyExists,
    KeyTooLarge,
    OutOfSpace,
    CorruptEnvironment,
    StaleCursor,
    ConfigMismatch,
    WouldBlock,
    IoFailure,
    DatabasesFull,
    ReadersFull,
    BadValueSize,
    Incompatible,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound => ErrorKind::NotFound,
            Error::KeyExists => ErrorKind::KeyExists,
            Error::KeyTooLarge { .. } => ErrorKind::KeyTooLarge,
            Error::OutOfSpace { .. } => ErrorKind::OutOfSpace,
            Error::Corrupted(_) => ErrorKind::CorruptEnvironment,
            Error::StaleCursor => ErrorKind::StaleCursor,
            Error::ConfigMismatch(_) => ErrorKind::ConfigMismatch,
            Error::WouldBlock => ErrorKind::WouldBlock,
            Error::Io(_) => ErrorKind::IoFailure,
            Error::DatabasesFull { .. } => ErrorKind::DatabasesFull,
            Error::ReadersFull { .. } => ErrorKind::ReadersFull,
            Error::BadValueSize { .. } => ErrorKind::BadValueSize,
            Error::Incompatible(_) => ErrorKind::Incompatible,
        }
    }

    pub(crate) fn corrupted(msg: impl Into<String>) -> Self {
        Error::Corrupted(msg.into())
    }

    pub(crate) fn bad_page(page_no: PageNo, what: impl std::fmt::Display) -> Self {
        Error::Corrupted(format!("page {page_no}: {what}"))
    }
}

impl From<eyre::Report> for Error {
    fn from(report: eyre::Report) -> Self {
        let report = match report.downcast::<Error>() {
            Ok(err) => return err,
            Err(report) => report,
        };

        let io_kind = report
            .chain()
            .find_map(|cause| cause.downcast_ref::<io::Error>())
            .map(io::Error::kind);

        match io_kind {
            Some(kind) => Error::Io(io::Error::new(kind, format!("{report:#}"))),
            None => Error::Corrupted(format!("{report:#}")),
        }
    }
}
