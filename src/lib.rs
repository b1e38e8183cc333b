//! Additive regularization of topic models.
//!
//! This crate implements the training core of an ARTM-style topic modeling
//! engine: a batch-parallel EM processor, a regularize/normalize pipeline,
//! offline and online fitting, a score cache and a copy-on-commit Φ store.

#[macro_use]
extern crate serde_derive;

use std::fmt;
use std::io;

pub mod batch;
mod blas;
pub mod collections;
pub mod dictionary;
pub mod master;
pub mod phi;
pub mod processor;
pub mod registry;
pub mod regularizers;
pub mod scores;
pub mod sync;
pub mod theta;
pub mod token;

pub use crate::batch::{Batch, Item};
pub use crate::dictionary::{Dictionary, DictionaryData};
pub use crate::master::{MasterModel, MasterModelConfig};
pub use crate::phi::{PhiMatrix, TopicModel};
pub use crate::theta::ThetaMatrix;
pub use crate::token::{Token, TransactionType};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    InvalidArgument(String),
    NotFound(String),
    AlreadyExists(String),
    CorruptedMessage(String),
    DiskRead(String),
    DiskWrite(String),
    InvalidOperation(String),
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::NotFound(msg) => write!(f, "not found: {}", msg),
            Error::AlreadyExists(msg) => write!(f, "already exists: {}", msg),
            Error::CorruptedMessage(msg) => write!(f, "corrupted message: {}", msg),
            Error::DiskRead(msg) => write!(f, "disk read error: {}", msg),
            Error::DiskWrite(msg) => write!(f, "disk write error: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "invalid operation: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub(crate) fn disk_read(path: &std::path::Path, err: io::Error) -> Self {
        Error::DiskRead(format!("{}: {}", path.display(), err))
    }

    pub(crate) fn disk_write(path: &std::path::Path, err: io::Error) -> Self {
        Error::DiskWrite(format!("{}: {}", path.display(), err))
    }
}
