//! x86-64 RELA application for kernel module objects, following the
//! kernel's own `apply_relocate_add`.
//!
//! Symbols resolve through a ladder: the object's own defined symbols,
//! the table accumulated across previously parsed modules, the kernel
//! function table, `System.map` (with an ELF-binding cross-check), and
//! finally the debug-symbol factory. An unresolved symbol is reported and
//! its instruction left unrelocated.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::instance::Instance;
use crate::symbols::{RealType, TypeKind};

use super::module_elf::{
    ElfSymbol, ObjectFile, SymBinding, R_X86_64_32, R_X86_64_32S, R_X86_64_64, R_X86_64_NONE,
    R_X86_64_PC32, SHN_ABS, SHN_COMMON, SHN_UNDEF,
};
use super::DumpView;

pub(crate) struct Resolver<'v, 'a> {
    pub view: &'v DumpView<'a>,
    pub sym_table: &'v HashMap<String, u64>,
    pub func_table: &'v HashMap<String, u64>,
}

impl Resolver<'_, '_> {
    /// Resolution ladder for an undefined symbol.
    fn resolve_undef(&self, sym: &ElfSymbol) -> Option<u64> {
        if let Some(&v) = self.sym_table.get(&sym.name) {
            return Some(v);
        }
        if let Some(&v) = self.func_table.get(&sym.name) {
            return Some(v);
        }
        // System.map, cross-checking ELF binding against the kind letter.
        let entries = self
            .view
            .vmem
            .specs()
            .system_map
            .entries_of(&sym.name);
        for e in entries {
            let matches = match sym.binding {
                SymBinding::Global | SymBinding::Weak => e.is_global(),
                SymBinding::Local => e.is_local(),
                SymBinding::Other => true,
            };
            if matches {
                return Some(e.address);
            }
        }
        // Debug symbols: a global variable, then a sized function.
        if let Some(var) = self.view.factory.find_var_by_name(&sym.name) {
            return Some(var.address);
        }
        for ty in self.view.factory.types_by_name(&sym.name) {
            if ty.real_type() == RealType::Function && ty.size > 0 {
                if let TypeKind::Function(f) = &ty.kind {
                    return Some(f.pc_low);
                }
            }
        }
        None
    }
}

/// Applies every RELA section whose target section is allocatable.
/// `section_mem` maps section indexes to their live guest addresses;
/// percpu-section symbols rebase onto the module's `percpu` pointer.
/// Returns the names of unresolved symbols.
pub(crate) fn apply_relocations(
    obj: &mut ObjectFile,
    section_mem: &HashMap<usize, u64>,
    percpu_section: Option<usize>,
    module: Option<&Instance<'_>>,
    resolver: &Resolver<'_, '_>,
) -> Vec<String> {
    use crate::instance::KnowledgeSources;
    use crate::symbols::RealTypeSet;

    let percpu_base = module.and_then(|m| {
        m.member("percpu", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty())
            .to_pointer()
    });

    let mut unresolved = Vec::new();
    let relas = obj.relas.clone();
    for rela in &relas {
        let Some(target) = obj.section(rela.target).cloned() else {
            continue;
        };
        if target.flags & super::module_elf::SHF_ALLOC == 0 {
            continue;
        }
        let target_mem = section_mem.get(&rela.target).copied().unwrap_or(0);
        let is_altinstructions = target.name == ".altinstructions";
        debug!(section = %target.name, entries = rela.entries.len(), "applying relocations");

        for r in &rela.entries {
            let Some(sym) = obj.symbols.get(r.sym).cloned() else {
                continue;
            };
            let loc_in_elf = target.offset + r.offset;
            let loc_in_mem = target_mem.wrapping_add(r.offset);

            // The symbol's section bases matter for the .altinstructions
            // special case below; they stay zero for external symbols.
            let mut sym_sec_mem = 0u64;
            let mut sym_sec_elf = 0u64;

            let st_value = match sym.shndx {
                SHN_UNDEF => match resolver.resolve_undef(&sym) {
                    Some(v) => v,
                    None => {
                        warn!(symbol = %sym.name, "unresolved relocation symbol");
                        unresolved.push(sym.name.clone());
                        continue;
                    }
                },
                SHN_ABS => sym.value,
                SHN_COMMON => continue,
                idx => {
                    let idx = idx as usize;
                    if percpu_section == Some(idx) {
                        sym_sec_mem = percpu_base.unwrap_or(0);
                    } else {
                        sym_sec_mem = section_mem.get(&idx).copied().unwrap_or(0);
                        sym_sec_elf = obj.section(idx).map(|s| s.offset).unwrap_or(0);
                    }
                    if sym.value < sym_sec_mem {
                        sym.value.wrapping_add(sym_sec_mem)
                    } else {
                        sym.value
                    }
                }
            };

            let val = st_value.wrapping_add(r.addend as u64);
            match r.rtype {
                R_X86_64_NONE => {}
                R_X86_64_64 => {
                    obj.write_u64_at(loc_in_elf, val);
                }
                R_X86_64_32 => {
                    obj.write_u32_at(loc_in_elf, val as u32);
                    if val != val as u32 as u64 {
                        warn!(symbol = %sym.name, val, "overflow in R_X86_64_32 relocation");
                    }
                }
                R_X86_64_32S => {
                    obj.write_u32_at(loc_in_elf, val as u32);
                    if val as i64 != val as i32 as i64 {
                        warn!(symbol = %sym.name, val,
                              "overflow in R_X86_64_32S relocation (not -mcmodel=kernel?)");
                    }
                }
                R_X86_64_PC32 => {
                    let rel = if is_altinstructions {
                        // Keep the offset file-relative so the alternative-
                        // instruction pass can follow it inside the object.
                        val.wrapping_sub(sym_sec_mem)
                            .wrapping_add(sym_sec_elf)
                            .wrapping_sub(loc_in_elf)
                    } else {
                        val.wrapping_sub(loc_in_mem)
                    };
                    obj.write_u32_at(loc_in_elf, rel as u32);
                }
                other => {
                    warn!(rtype = other, "unknown RELA relocation type");
                }
            }
        }
    }
    unresolved
}
