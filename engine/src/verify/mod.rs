//! Code-page integrity verification.
//!
//! Reconstructs, from on-disk ELF objects, the byte image the kernel holds
//! in each executable page at runtime. The same relocations and boot-time
//! patches the kernel applies itself (alternative instructions, paravirt
//! ops, SMP locks, ftrace NOPs, jump labels) are reproduced; live pages
//! from the dump are then hashed against the reconstruction.

pub mod module_elf;
pub mod nops;
pub mod pages;
pub mod patch;
pub mod reloc;

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::error::Result;
use crate::instance::{Instance, KnowledgeSources, Origin};
use crate::symbols::{BaseType, RealTypeSet, SymbolFactory};
use crate::vmem::VirtualMemory;

use module_elf::{find_module_file, normalize_module_name, ObjectFile};
use nops::NopFamily;

pub const MODULE_PAGE_SIZE: u64 = 4096;
pub const KERNEL_CODEPAGE_SIZE: u64 = 0x20_0000;

/// `X86_FEATURE_UP`: smp kernel running on a uniprocessor.
pub const X86_FEATURE_UP: u32 = 3 * 32 + 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Kernel,
    Module,
}

/// One reconstructed, hashed code page.
pub struct PageData {
    pub hash: [u8; 20],
    pub content: Vec<u8>,
}

/// A fully parsed and patched executable image.
pub struct ParsedImage {
    pub name: String,
    pub kind: ImageKind,
    pub obj: ObjectFile,
    /// Live address of `.text` in guest memory.
    pub text_mem: u64,
    pub text_file_off: u64,
    pub text_size: u64,
    /// `.text` followed by the other executable sections, fully patched.
    pub text_content: Vec<u8>,
    /// Initialized prefix length; the rest of the last page is undefined.
    pub text_initialized: u64,
    /// Offsets into `text_content` whose byte toggles with SMP state.
    pub smp_offsets: HashSet<u64>,
    /// Jump-label sites: offset into `text_content` -> rel32 of the
    /// enabled jump, kept per image so modules reverify independently.
    pub jump_entries: HashMap<u64, i32>,
    pub page_size: u64,
    pub pages: Vec<PageData>,
}

impl ParsedImage {
    /// Splits the patched text into zero-padded pages and hashes each.
    pub fn build_pages(&mut self) {
        self.pages.clear();
        let psize = self.page_size as usize;
        let mut off = 0usize;
        while off < self.text_content.len() {
            let end = (off + psize).min(self.text_content.len());
            let mut content = self.text_content[off..end].to_vec();
            content.resize(psize, 0);
            let hash: [u8; 20] = Sha1::digest(&content).into();
            self.pages.push(PageData { hash, content });
            off += psize;
        }
    }
}

/// Typed access into the running kernel of the dump under verification.
pub struct DumpView<'a> {
    pub factory: &'a SymbolFactory,
    pub vmem: &'a VirtualMemory,
}

impl<'a> DumpView<'a> {
    pub fn new(factory: &'a SymbolFactory, vmem: &'a VirtualMemory) -> DumpView<'a> {
        DumpView { factory, vmem }
    }

    /// Instance of a global, lexically resolved, no candidate resolution.
    pub fn var_instance(&self, name: &str) -> Option<Instance<'a>> {
        let var = self.factory.find_var_by_name(name)?;
        let inst =
            Instance::of_variable(self.factory, self.vmem, var, KnowledgeSources::empty());
        inst.is_valid().then_some(inst)
    }

    pub fn type_of(&self, name: &str) -> Option<&'a BaseType> {
        self.factory.find_base_type_by_name(name)
    }

    pub fn instance_at(&self, type_name: &str, address: u64) -> Option<Instance<'a>> {
        let ty = self.type_of(type_name)?;
        Some(Instance::new(
            self.factory,
            self.vmem,
            address,
            ty,
            type_name,
            Vec::new(),
            -1,
            Origin::External,
        ))
    }

    /// Tests a bit in the live `boot_cpu_data.x86_capability` array.
    pub fn boot_cpu_has(&self, bit: u32) -> bool {
        let Some(cpu) = self.var_instance("boot_cpu_data") else {
            return false;
        };
        let caps = cpu.member(
            "x86_capability",
            RealTypeSet::TR_LEXICAL,
            KnowledgeSources::empty(),
        );
        caps.array_elem((bit / 32) as i64)
            .to_uint32()
            .map(|word| (word >> (bit % 32)) & 1 == 1)
            .unwrap_or(false)
    }

    /// CPU family from the live `boot_cpu_data.x86`.
    pub fn cpu_family(&self) -> Option<u32> {
        let cpu = self.var_instance("boot_cpu_data")?;
        cpu.member("x86", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty())
            .to_uint64()
            .map(|v| v as u32)
    }

    /// Iterates the kernel's module list as `struct module` instances.
    pub fn modules(&self) -> Vec<Instance<'a>> {
        let mut out = Vec::new();
        let Some(list) = self.var_instance("modules") else {
            return out;
        };
        let Some(module_ty) = self.type_of("module") else {
            return out;
        };
        let Some(list_off) = self
            .instance_at("module", 0)
            .and_then(|m| m.member_offset("list"))
        else {
            return out;
        };
        let head = list.address();
        let Ok(mut next) = self.vmem.to_pointer(head) else {
            return out;
        };
        let mut guard = 0;
        while next != 0 && next != head && guard < 8192 {
            let maddr = next.wrapping_sub(list_off);
            out.push(Instance::new(
                self.factory,
                self.vmem,
                maddr,
                module_ty,
                "module",
                Vec::new(),
                -1,
                Origin::External,
            ));
            let Ok(n) = self.vmem.to_pointer(maddr + list_off) else {
                break;
            };
            next = n;
            guard += 1;
        }
        out
    }

    /// The live module's name string.
    pub fn module_name(&self, module: &Instance<'_>) -> String {
        let name = module.member("name", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty());
        self.vmem
            .read_c_string(name.address(), 64)
            .unwrap_or_default()
    }

    pub fn module_by_name(&self, name: &str) -> Option<Instance<'a>> {
        let want = normalize_module_name(name);
        self.modules()
            .into_iter()
            .find(|m| normalize_module_name(&self.module_name(m)) == want)
    }

    /// Live address of a named section of a loaded module, from its
    /// `sect_attrs` table.
    pub fn section_mem_addr(&self, module: &Instance<'a>, section: &str) -> Option<u64> {
        let attrs = module
            .member("sect_attrs", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty())
            .dereference(RealTypeSet::TR_LEXICAL_POINTERS);
        if !attrs.is_valid() || attrs.is_null() {
            return None;
        }
        let count = attrs
            .member("nsections", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty())
            .to_uint32()?;
        let arr = attrs.member("attrs", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty());
        for j in 0..count {
            let attr = arr.array_elem(j as i64);
            let name_inst =
                attr.member("name", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty());
            let name = name_inst
                .to_pointer()
                .and_then(|p| self.vmem.read_c_string(p, 64).ok())
                .unwrap_or_default();
            if name.trim_matches('"') == section {
                return attr
                    .member("address", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty())
                    .to_uint64();
            }
        }
        None
    }
}

// ---- report --------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ByteChange {
    /// Offset within the page.
    pub offset: usize,
    pub expected: u8,
    pub found: u8,
    /// 30-byte windows around the change.
    pub context_expected: Vec<u8>,
    pub context_found: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PageFinding {
    pub address: u64,
    pub image: String,
    pub page_index: u64,
    pub change_count: u32,
    pub first_change: Option<ByteChange>,
    pub note: Option<String>,
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub processed_pages: u64,
    pub executable_pages: u64,
    pub nonexecutable_pages: u64,
    pub nonsupervisor_pages: u64,
    pub kernel_code_pages: u64,
    pub kernel_data_pages: u64,
    pub module_pages: u64,
    pub vmap_pages: u64,
    pub lazy_pages: u64,
    pub vsyscall_pages: u64,
    pub unknown_pages: u64,
    pub findings: Vec<PageFinding>,
    pub missing_modules: Vec<String>,
    pub unresolved_symbols: Vec<(String, String)>,
    pub interrupted: bool,
}

impl VerifyReport {
    /// Pages whose deltas survived every benign-difference filter.
    pub fn mismatch_count(&self) -> usize {
        self.findings.iter().filter(|f| f.change_count > 0).count()
    }
}

// ---- the verifier --------------------------------------------------------

pub struct PageVerifier<'a> {
    pub(crate) view: DumpView<'a>,
    kernel_image: PathBuf,
    module_dir: PathBuf,
    pub(crate) parsed: HashMap<String, ParsedImage>,
    /// Global symbols accumulated across parsed modules.
    pub(crate) sym_table: HashMap<String, u64>,
    /// Function symbols of the kernel and parsed modules.
    pub(crate) func_table: HashMap<String, u64>,
    /// Paravirt destinations patched as jumps / calls (for later
    /// function-pointer whitelisting).
    pub(crate) paravirt_jump: Vec<u64>,
    pub(crate) paravirt_call: Vec<u64>,
    pub(crate) nop_family: NopFamily,
    pub(crate) report: VerifyReport,
}

impl<'a> PageVerifier<'a> {
    pub fn new(
        factory: &'a SymbolFactory,
        vmem: &'a VirtualMemory,
        kernel_image: &Path,
        module_dir: &Path,
    ) -> PageVerifier<'a> {
        let view = DumpView::new(factory, vmem);
        let nop_family = NopFamily::from_cpu_family(view.cpu_family());
        PageVerifier {
            view,
            kernel_image: kernel_image.to_path_buf(),
            module_dir: module_dir.to_path_buf(),
            parsed: HashMap::new(),
            sym_table: HashMap::new(),
            func_table: HashMap::new(),
            paravirt_jump: Vec::new(),
            paravirt_call: Vec::new(),
            nop_family,
            report: VerifyReport::default(),
        }
    }

    pub fn report(&self) -> &VerifyReport {
        &self.report
    }

    pub fn nop_family(&self) -> NopFamily {
        self.nop_family
    }

    /// Parses and patches the kernel image itself.
    pub fn load_kernel(&mut self) -> Result<()> {
        if self.parsed.contains_key("kernel") {
            return Ok(());
        }
        let obj = ObjectFile::open(&self.kernel_image)?;
        let image = patch::prepare_kernel_image(self, obj)?;
        self.collect_symbols(&image);
        self.parsed.insert("kernel".into(), image);
        Ok(())
    }

    /// Parses a module's `.ko`, loading declared dependencies first. A
    /// missing file is recorded and skipped. A module found relocated to a
    /// new base (reloaded) is re-parsed.
    pub fn load_module(&mut self, name: &str, module: &Instance<'a>) -> Result<()> {
        let key = normalize_module_name(name);
        if let Some(existing) = self.parsed.get(&key) {
            let live_text = self.view.section_mem_addr(module, ".text").unwrap_or(0);
            if live_text == existing.text_mem || live_text == 0 {
                return Ok(());
            }
            warn!(module = %key, old = format_args!("{:#x}", existing.text_mem),
                  new = format_args!("{live_text:#x}"), "module reloaded, re-parsing");
            self.parsed.remove(&key);
        }
        let Some(path) = find_module_file(&self.module_dir, name) else {
            debug!(module = %key, "module object file not found");
            self.report.missing_modules.push(key);
            return Ok(());
        };
        let obj = ObjectFile::open(&path)?;
        for dep in obj.modinfo_depends() {
            if self.parsed.contains_key(&normalize_module_name(&dep)) {
                continue;
            }
            match self.view.module_by_name(&dep) {
                Some(dep_inst) => self.load_module(&dep, &dep_inst)?,
                None => warn!(module = %dep, "dependency not loaded in the guest"),
            }
        }
        let image = patch::prepare_module_image(self, obj, &key, module)?;
        self.collect_symbols(&image);
        self.parsed.insert(key, image);
        Ok(())
    }

    /// Parses every module on the guest's module list.
    pub fn load_all_modules(&mut self) -> Result<()> {
        for module in self.view.modules() {
            let name = self.view.module_name(&module);
            if name.is_empty() {
                continue;
            }
            self.load_module(&name, &module)?;
        }
        Ok(())
    }

    fn collect_symbols(&mut self, image: &ParsedImage) {
        for sym in &image.obj.symbols {
            if sym.name.is_empty() || sym.shndx == module_elf::SHN_UNDEF {
                continue;
            }
            if sym.binding != module_elf::SymBinding::Global {
                continue;
            }
            if sym.is_object || sym.is_func {
                self.sym_table.entry(sym.name.clone()).or_insert(sym.value);
            }
            if sym.is_func {
                self.func_table.entry(sym.name.clone()).or_insert(sym.value);
            }
        }
    }

    pub(crate) fn record_unresolved(&mut self, image: &str, symbol: &str) {
        self.report
            .unresolved_symbols
            .push((image.to_owned(), symbol.to_owned()));
    }

    pub(crate) fn system_map_value(&self, name: &str) -> Option<u64> {
        self.view.vmem.specs().system_map.address_of(name)
    }
}
