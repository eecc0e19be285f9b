//! Content-addressed chain archive.
//!
//! Headers are interned once and referred to everywhere by a small stable
//! link. The archive keeps the candidate and confirmed chains as height
//! tables over links, a per-link block state machine, block bodies and their
//! transaction outputs, the confirmed UTXO set with undo records, prevout
//! caches, and filter commitments. Every command commits through a single
//! write batch: either the store is unchanged or the command's post-condition
//! holds.

pub mod archive;
pub mod context;
pub mod genesis;
pub mod index;
pub mod state;
pub mod undo;
pub mod validation;

pub use archive::Archive;
pub use genesis::genesis_block;
pub use context::BlockContext;
pub use index::{HeaderEntry, HeaderLink};
pub use state::BlockState;
pub use undo::{BlockUndo, UtxoEntry};
pub use validation::{PrevOut, ValidationError};

use bn_primitives::encoding::DecodeError;
use bn_storage::StoreError;

#[derive(Debug)]
pub enum ArchiveError {
    /// Block rule violation. The only non-fatal category.
    Validation(ValidationError),
    Store(StoreError),
    Decode(DecodeError),
    Corrupt(&'static str),
    UnknownLink,
    MissingHeader,
    MissingBody,
    MissingParent,
}

impl ArchiveError {
    /// True for everything except block rule violations.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ArchiveError::Validation(_))
    }
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::Validation(err) => write!(f, "{err}"),
            ArchiveError::Store(err) => write!(f, "{err}"),
            ArchiveError::Decode(err) => write!(f, "{err}"),
            ArchiveError::Corrupt(message) => write!(f, "{message}"),
            ArchiveError::UnknownLink => write!(f, "unknown header link"),
            ArchiveError::MissingHeader => write!(f, "missing header"),
            ArchiveError::MissingBody => write!(f, "missing block body"),
            ArchiveError::MissingParent => write!(f, "missing parent header"),
        }
    }
}

impl std::error::Error for ArchiveError {}

impl From<ValidationError> for ArchiveError {
    fn from(err: ValidationError) -> Self {
        ArchiveError::Validation(err)
    }
}

impl From<StoreError> for ArchiveError {
    fn from(err: StoreError) -> Self {
        ArchiveError::Store(err)
    }
}

impl From<DecodeError> for ArchiveError {
    fn from(err: DecodeError) -> Self {
        ArchiveError::Decode(err)
    }
}
