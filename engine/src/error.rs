//! Error kinds surfaced by the engine.
//!
//! Construction phases (symbol finalize, memspec load, ELF setup) fail hard;
//! query and navigation phases degrade to null/invalid instances instead.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InsightError {
    #[error("symbol parse error: {0}")]
    SymbolParse(String),

    #[error("symbol file version mismatch: required major {required}, found {found}")]
    SymbolVersionMismatch { required: u16, found: u16 },

    #[error("dangling type reference: id {referer} refers to unknown id {missing}")]
    DanglingReference { referer: i32, missing: i32 },

    #[error("memory specification incomplete: {0}")]
    MemSpecsUnresolved(String),

    #[error("virtual address {addr:#x} is not in canonical form")]
    AddressNotCanonical { addr: u64 },

    #[error("page not present for virtual address {addr:#x}")]
    NonPresentPage { addr: u64 },

    #[error("short read at {addr:#x}: got {got} of {wanted} bytes")]
    ShortRead { addr: u64, got: usize, wanted: usize },

    #[error("unresolved relocation against symbol \"{symbol}\"")]
    RelocationUnresolved { symbol: String },

    #[error("query error: {0}")]
    Query(String),

    #[error("operation interrupted")]
    Interrupted,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, InsightError>;
