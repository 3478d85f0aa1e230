//! The top-level engine value: loaded kernel symbols plus the open memory
//! dumps. Everything the command front-end touches goes through here; no
//! process-wide state beyond the interrupt flag and the name interner.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use tracing::info;

use crate::error::{InsightError, Result};
use crate::map::MemoryMap;
use crate::memdump::MemoryDump;
use crate::memspecs::MemSpecs;
use crate::symbols::{persist, FinalizeReason, SymbolFactory, TypeInfo};
use crate::systemmap::SystemMap;
use crate::verify::PageVerifier;

/// A finalized symbol factory together with the memory specification it
/// was built for.
pub struct KernelSymbols {
    pub specs: MemSpecs,
    pub factory: SymbolFactory,
}

impl KernelSymbols {
    /// Assembles symbols from a producer stream plus the build's MemSpecs
    /// and System.map.
    pub fn parse<I>(mut specs: MemSpecs, system_map: SystemMap, stream: I) -> Result<KernelSymbols>
    where
        I: IntoIterator<Item = Result<TypeInfo>>,
    {
        specs.attach_system_map(system_map)?;
        let mut factory = SymbolFactory::new();
        for info in stream {
            factory.feed(info?)?;
        }
        factory.finalize(FinalizeReason::Parsing)?;
        info!(
            types = factory.type_count(),
            variables = factory.var_count(),
            "kernel symbols parsed"
        );
        Ok(KernelSymbols { specs, factory })
    }

    pub fn load(path: &Path) -> Result<KernelSymbols> {
        let file = File::open(path)
            .map_err(|_| InsightError::FileNotFound(path.display().to_string()))?;
        let (specs, factory) = persist::read(BufReader::new(file))?;
        info!(
            types = factory.type_count(),
            variables = factory.var_count(),
            file = %path.display(),
            "kernel symbols loaded"
        );
        Ok(KernelSymbols { specs, factory })
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        persist::write(&self.specs, &self.factory, BufWriter::new(file))?;
        info!(file = %path.display(), "kernel symbols stored");
        Ok(())
    }
}

#[derive(Default)]
pub struct Engine {
    symbols: Option<KernelSymbols>,
    /// Slots stay stable across unloads so dump indexes keep meaning.
    dumps: Vec<Option<MemoryDump>>,
}

impl Engine {
    pub fn new() -> Engine {
        Engine::default()
    }

    pub fn set_symbols(&mut self, symbols: KernelSymbols) {
        self.symbols = Some(symbols);
    }

    pub fn symbols(&self) -> Result<&KernelSymbols> {
        self.symbols
            .as_ref()
            .ok_or_else(|| InsightError::Query("no symbols loaded".into()))
    }

    pub fn load_symbols(&mut self, path: &Path) -> Result<()> {
        self.symbols = Some(KernelSymbols::load(path)?);
        Ok(())
    }

    pub fn store_symbols(&self, path: &Path) -> Result<()> {
        self.symbols()?.store(path)
    }

    // ---- dumps -----------------------------------------------------------

    /// Opens a memory image against the loaded symbols; returns its index.
    pub fn load_memory_dump(&mut self, path: &Path) -> Result<usize> {
        let symbols = self
            .symbols
            .as_ref()
            .ok_or_else(|| InsightError::Query("load symbols before memory files".into()))?;
        let index = self
            .dumps
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.dumps.len());
        let dump = MemoryDump::open(symbols.specs.clone(), &symbols.factory, path, index)?;
        if index == self.dumps.len() {
            self.dumps.push(Some(dump));
        } else {
            self.dumps[index] = Some(dump);
        }
        info!(index, file = %path.display(), "memory dump loaded");
        Ok(index)
    }

    /// Unloads by index or by file name; returns the file name unloaded.
    pub fn unload_memory_dump(&mut self, index_or_file: &str) -> Result<String> {
        let index = match index_or_file.parse::<usize>() {
            Ok(i) => i,
            Err(_) => self
                .dumps
                .iter()
                .position(|d| {
                    d.as_ref()
                        .is_some_and(|d| d.file_name().to_string_lossy() == index_or_file)
                })
                .ok_or_else(|| InsightError::FileNotFound(index_or_file.to_owned()))?,
        };
        match self.dumps.get_mut(index).and_then(Option::take) {
            Some(dump) => Ok(dump.file_name().display().to_string()),
            None => Err(InsightError::Query(format!(
                "no memory dump loaded at index {index}"
            ))),
        }
    }

    pub fn dump(&self, index: usize) -> Result<&MemoryDump> {
        self.dumps
            .get(index)
            .and_then(Option::as_ref)
            .ok_or_else(|| InsightError::Query(format!("no memory dump at index {index}")))
    }

    pub fn dumps(&self) -> impl Iterator<Item = &MemoryDump> {
        self.dumps.iter().filter_map(Option::as_ref)
    }

    pub fn default_dump_index(&self) -> Option<usize> {
        self.dumps
            .iter()
            .position(Option::is_some)
    }

    // ---- derived workers -------------------------------------------------

    /// A fresh reverse map over one dump. The range tree is never
    /// persisted; it is rebuilt per session.
    pub fn revmap(&self, index: usize) -> Result<MemoryMap<'_>> {
        let symbols = self.symbols()?;
        let dump = self.dump(index)?;
        Ok(MemoryMap::new(&symbols.factory, dump.vmem()))
    }

    /// A page verifier over one dump.
    pub fn verifier(
        &self,
        index: usize,
        kernel_image: &Path,
        module_dir: &Path,
    ) -> Result<PageVerifier<'_>> {
        let symbols = self.symbols()?;
        let dump = self.dump(index)?;
        Ok(PageVerifier::new(
            &symbols.factory,
            dump.vmem(),
            kernel_image,
            module_dir,
        ))
    }
}
