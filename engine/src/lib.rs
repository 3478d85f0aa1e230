//! InSight engine — virtual-machine introspection over raw memory dumps.
//!
//! Given a kernel build's debug symbols, its `System.map` and a handful of
//! architecture constants, the engine reconstructs a typed view of every
//! kernel object reachable from the global variables inside a physical
//! memory image, answers interactive queries against that view, and can
//! verify executable kernel pages against their on-disk ELF originals.
//!
//! The layers, leaves first: [`memspecs`]/[`systemmap`] carry the build
//! constants, [`codec`] the persisted record format, [`symbols`] the
//! deduplicated type graph, [`vmem`] the page-table walker over the raw
//! image, [`instance`] typed navigation, [`map`] the concurrent reverse
//! map, and [`verify`] the ELF-reconstructing page verifier. [`engine`]
//! ties them together for the command front-end.

pub mod codec;
pub mod engine;
pub mod error;
pub mod instance;
pub mod interrupt;
pub mod map;
pub mod memdump;
pub mod memspecs;
pub mod query;
pub mod symbols;
pub mod systemmap;
pub mod verify;
pub mod vmem;

pub use engine::{Engine, KernelSymbols};
pub use error::{InsightError, Result};
pub use instance::{Instance, KnowledgeSources, Origin};
pub use memdump::MemoryDump;
pub use memspecs::{Arch, KernelVersion, MemSpecs};
pub use symbols::{RealType, RealTypeSet, SymbolFactory, TypeInfo};
pub use systemmap::SystemMap;
pub use vmem::VirtualMemory;
