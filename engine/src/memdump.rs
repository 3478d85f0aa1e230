//! One loaded physical-memory image: its virtual-memory view, the runtime
//! fixups read from the live guest, and the interactive query entry point.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{InsightError, Result};
use crate::instance::{Instance, KnowledgeSources, Origin};
use crate::memspecs::{MemSpecs, HIGH_MEMORY_FAILSAFE_X86_64};
use crate::query::{parse_query, CastOffset, QueryComponent};
use crate::symbols::{RealTypeSet, SymbolFactory};
use crate::vmem::VirtualMemory;

pub struct MemoryDump {
    file_name: PathBuf,
    index: usize,
    vmem: VirtualMemory,
}

impl MemoryDump {
    /// Opens the image and applies the runtime-read MemSpecs values.
    pub fn open(
        specs: MemSpecs,
        factory: &SymbolFactory,
        path: &Path,
        index: usize,
    ) -> Result<MemoryDump> {
        let vmem = VirtualMemory::open_file(specs, path, index)?;
        let mut dump = MemoryDump {
            file_name: path.to_path_buf(),
            index,
            vmem,
        };
        dump.init(factory)?;
        Ok(dump)
    }

    fn init(&mut self, factory: &SymbolFactory) -> Result<()> {
        // Virtual address translation depends on the runtime value of
        // high_memory; read it through the fresh symbol view.
        let high_memory = factory.find_var_by_name("high_memory").and_then(|var| {
            let inst = Instance::of_variable(factory, &self.vmem, var, KnowledgeSources::empty());
            let inst = inst.dereference(RealTypeSet::TR_LEXICAL_POINTERS);
            if self.vmem.specs().sizeof_pointer == 4 {
                inst.to_uint32().map(u64::from)
            } else {
                inst.to_uint64()
            }
        });
        let is_64bit = self.vmem.specs().is_64bit();
        match high_memory {
            Some(v) => self.vmem.specs_mut().high_memory = v,
            None if is_64bit => {
                warn!("variable \"high_memory\" not found, using the 64-bit failsafe");
                self.vmem.specs_mut().high_memory = HIGH_MEMORY_FAILSAFE_X86_64;
            }
            None => {
                return Err(InsightError::MemSpecsUnresolved(
                    "high_memory is required on 32-bit guests but could not be read".into(),
                ))
            }
        }

        if !is_64bit {
            if let Some(var) = factory.find_var_by_name("vmalloc_earlyreserve") {
                let inst =
                    Instance::of_variable(factory, &self.vmem, var, KnowledgeSources::empty());
                if let Some(v) = inst.to_uint32() {
                    self.vmem.specs_mut().vmalloc_earlyreserve = u64::from(v);
                }
            }
        }

        self.check_kernel_version(factory);
        Ok(())
    }

    /// Compares the symbol file's kernel version strings against the live
    /// `init_uts_ns` of the dump. A mismatch is a warning, not an error.
    fn check_kernel_version(&self, factory: &SymbolFactory) {
        let expected = self.vmem.specs().version.release.clone();
        if expected.is_empty() {
            return;
        }
        let Some(var) = factory.find_var_by_name("init_uts_ns") else {
            return;
        };
        let inst = Instance::of_variable(factory, &self.vmem, var, KnowledgeSources::empty());
        let release = inst
            .member("name", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty())
            .member("release", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty());
        if !release.is_valid() {
            return;
        }
        match self.vmem.read_c_string(release.address(), 65) {
            Ok(live) if !live.is_empty() && live != expected => {
                warn!(
                    symbols = %expected,
                    dump = %live,
                    "kernel version of the dump differs from the loaded symbols"
                );
            }
            _ => {}
        }
    }

    pub fn file_name(&self) -> &Path {
        &self.file_name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn vmem(&self) -> &VirtualMemory {
        &self.vmem
    }

    pub fn specs(&self) -> &MemSpecs {
        self.vmem.specs()
    }

    // ---- queries ---------------------------------------------------------

    /// Evaluates a dot-separated path expression against this dump.
    pub fn query_instance<'f>(
        &'f self,
        factory: &'f SymbolFactory,
        expression: &str,
    ) -> Result<Instance<'f>> {
        let components = parse_query(expression)?;
        let mut result: Option<Instance<'f>> = None;
        let mut path = String::new();
        for comp in &components {
            let next = self.next_instance(factory, comp, result.take())?;
            if !path.is_empty() {
                path.push('.');
            }
            path.push_str(&comp.symbol);
            if !next.is_valid() {
                let reason = match next.origin() {
                    Origin::Candidate => "the selected member candidate is invalid",
                    Origin::RuleEngine => "the rule-engine result is invalid",
                    _ => "the instance is invalid",
                };
                return Err(InsightError::Query(format!("\"{path}\": {reason}")));
            }
            result = Some(next);
        }
        result.ok_or_else(|| InsightError::Query("empty query string".into()))
    }

    /// An instance of a named type at a fixed address; backs `memory dump`.
    pub fn instance_at<'f>(
        &'f self,
        factory: &'f SymbolFactory,
        type_name: &str,
        address: u64,
        parent_names: Vec<String>,
    ) -> Result<Instance<'f>> {
        let ty = factory
            .find_base_type_by_name(type_name)
            .ok_or_else(|| InsightError::Query(format!("unknown type \"{type_name}\"")))?;
        let ty = factory.dereferenced_type(ty, RealTypeSet::TR_LEXICAL);
        Ok(Instance::new(
            factory,
            &self.vmem,
            address,
            ty,
            "user",
            parent_names,
            -1,
            Origin::External,
        ))
    }

    fn next_instance<'f>(
        &'f self,
        factory: &'f SymbolFactory,
        comp: &QueryComponent,
        prev: Option<Instance<'f>>,
    ) -> Result<Instance<'f>> {
        let mut result = match prev {
            None => {
                // The first component names a global variable.
                let var = factory.find_var_by_name(&comp.symbol).ok_or_else(|| {
                    InsightError::Query(format!("variable does not exist: {}", comp.symbol))
                })?;
                match comp.candidate {
                    Some(k) if k > 0 => {
                        if var.alt_ref_types.len() < k {
                            return Err(InsightError::Query(format!(
                                "variable \"{}\" has no candidate with index {k}",
                                comp.symbol
                            )));
                        }
                        Instance::of_variable_candidate(factory, &self.vmem, var, k - 1)
                    }
                    Some(_) => {
                        // <0> suppresses alternative-type resolution.
                        Instance::of_variable(factory, &self.vmem, var, KnowledgeSources::empty())
                    }
                    None => Instance::of_variable(
                        factory,
                        &self.vmem,
                        var,
                        KnowledgeSources::ALT_TYPES,
                    ),
                }
            }
            Some(prev) => {
                let ty = prev
                    .ty()
                    .ok_or_else(|| InsightError::Query("invalid instance".into()))?;
                if !ty.is(RealTypeSet::STRUCT_OR_UNION) {
                    if prev.is_null() {
                        return Err(InsightError::Query(format!(
                            "member \"{}\" is null",
                            prev.full_name()
                        )));
                    }
                    return Err(InsightError::Query(format!(
                        "member \"{}\" is not a struct or union",
                        prev.full_name()
                    )));
                }
                if !prev.member_exists(&comp.symbol) {
                    return Err(InsightError::Query(format!(
                        "\"{}\" has no member named \"{}\"",
                        prev.type_name(),
                        comp.symbol
                    )));
                }
                match comp.candidate {
                    Some(k) if k > 0 => {
                        if prev.member_candidates_count(&comp.symbol) < k {
                            return Err(InsightError::Query(format!(
                                "member \"{}\" has no candidate with index {k}",
                                comp.symbol
                            )));
                        }
                        prev.member_candidate(&comp.symbol, k - 1)
                    }
                    Some(_) => prev.member(
                        &comp.symbol,
                        RealTypeSet::TR_LEXICAL,
                        KnowledgeSources::empty(),
                    ),
                    None => prev.member(
                        &comp.symbol,
                        RealTypeSet::TR_LEXICAL,
                        KnowledgeSources::ALT_TYPES,
                    ),
                }
            }
        };
        if !result.is_valid() {
            return Ok(result);
        }

        // Optional cast, with an optional byte or member-name offset.
        if let Some(type_name) = &comp.cast_type {
            let offset = match &comp.cast_offset {
                None => 0,
                Some(CastOffset::Bytes(n)) => *n,
                Some(CastOffset::Member(member)) => {
                    let probe = self.instance_at(factory, type_name, 0, Vec::new())?;
                    probe.member_offset(member).ok_or_else(|| {
                        InsightError::Query(format!(
                            "type \"{type_name}\" has no member \"{member}\""
                        ))
                    })?
                }
            };
            let base = if result
                .ty()
                .is_some_and(|t| t.is(RealTypeSet::POINTER))
            {
                result.to_pointer().unwrap_or(0)
            } else {
                result.address()
            };
            result = self.instance_at(
                factory,
                type_name,
                base.wrapping_sub(offset),
                result.full_name_components(),
            )?;
        }

        for &index in &comp.indexes {
            result = result
                .array_elem(index)
                .dereference(RealTypeSet::TR_LEXICAL);
            if !result.is_valid() {
                return Ok(result);
            }
        }

        // Resolve as deep as a non-null pointer chain allows.
        Ok(result.dereference(RealTypeSet::TR_ANY_NON_NULL))
    }
}
