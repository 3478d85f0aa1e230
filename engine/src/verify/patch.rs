//! Reproduction of the kernel's boot-time code patching on the parsed
//! ELF images: alternative instructions, paravirt ops, SMP locks, ftrace
//! call sites and jump labels, in the kernel's own application order.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::{InsightError, Result};
use crate::instance::{Instance, KnowledgeSources};
use crate::symbols::{RealType, RealTypeSet, TypeKind};

use super::module_elf::{ObjectFile, SectionInfo};
use super::nops::NopFamily;
use super::reloc::{self, Resolver};
use super::{
    DumpView, ImageKind, PageVerifier, ParsedImage, KERNEL_CODEPAGE_SIZE, MODULE_PAGE_SIZE,
    X86_FEATURE_UP,
};

const ALT_INSTR_SIZE: u64 = 12;
const PV_PATCH_SITE_SIZE: u64 = 16;
const JUMP_ENTRY_SIZE: u64 = 24;

/// Everything callers may clobber; the call patch assumes the worst.
const CLBR_ANY: u16 = (1 << 4) - 1;

struct ImageLayout {
    kind: ImageKind,
    text: SectionInfo,
    text_mem: u64,
    /// Live address of a section by name.
    section_mem: HashMap<String, u64>,
}

impl ImageLayout {
    fn mem_of(&self, s: &SectionInfo) -> u64 {
        match self.kind {
            ImageKind::Kernel => s.addr,
            ImageKind::Module => self.section_mem.get(&s.name).copied().unwrap_or(0),
        }
    }

    /// File position of the instruction at guest address `mem`.
    fn text_filepos(&self, mem: u64) -> u64 {
        self.text.offset + mem.wrapping_sub(self.text_mem)
    }
}

// ---- kernel / module preparation -----------------------------------------

pub(crate) fn prepare_kernel_image(
    verifier: &mut PageVerifier<'_>,
    mut obj: ObjectFile,
) -> Result<ParsedImage> {
    let text = obj
        .section_by_name(".text")
        .cloned()
        .ok_or_else(|| InsightError::SymbolParse("kernel image has no .text".into()))?;
    let layout = ImageLayout {
        kind: ImageKind::Kernel,
        text_mem: text.addr,
        text: text.clone(),
        section_mem: HashMap::new(),
    };

    apply_altinstr(&mut obj, &verifier.view, &layout, verifier.nop_family);
    apply_parainstr(
        &mut obj,
        &verifier.view,
        &layout,
        verifier.nop_family,
        &mut verifier.paravirt_jump,
        &mut verifier.paravirt_call,
    );
    let smp_offsets = apply_smp_locks(&mut obj, &verifier.view, &layout);

    let mut text_content = obj.section_bytes(&text).to_vec();
    let extra: Vec<SectionInfo> = obj.extra_exec_sections().cloned().collect();
    for s in &extra {
        text_content.extend_from_slice(obj.section_bytes(s));
    }
    let text_initialized = text_content.len() as u64;

    apply_mcount(&obj, &layout, verifier.nop_family, &mut text_content);

    let jump_start = verifier.system_map_value("__start___jump_table");
    let jump_stop = verifier.system_map_value("__stop___jump_table");
    let jump_entries = apply_kernel_jump_entries(
        &obj,
        &verifier.view,
        &layout,
        verifier.nop_family,
        &mut text_content,
        jump_start,
        jump_stop,
        text.size,
    );

    let mut image = ParsedImage {
        name: "kernel".into(),
        kind: ImageKind::Kernel,
        text_mem: layout.text_mem,
        text_file_off: text.offset,
        text_size: text.size,
        text_content,
        text_initialized,
        smp_offsets,
        jump_entries,
        page_size: KERNEL_CODEPAGE_SIZE,
        pages: Vec::new(),
        obj,
    };
    image.build_pages();
    debug!(pages = image.pages.len(), "kernel image prepared");
    Ok(image)
}

pub(crate) fn prepare_module_image<'a>(
    verifier: &mut PageVerifier<'a>,
    mut obj: ObjectFile,
    name: &str,
    module: &Instance<'a>,
) -> Result<ParsedImage> {
    let text = obj
        .section_by_name(".text")
        .cloned()
        .ok_or_else(|| InsightError::SymbolParse(format!("module {name} has no .text")))?;

    // Live addresses of the module's allocatable sections.
    let mut section_mem_by_index: HashMap<usize, u64> = HashMap::new();
    let mut section_mem: HashMap<String, u64> = HashMap::new();
    for s in &obj.sections {
        if s.flags & super::module_elf::SHF_ALLOC == 0 || s.name.is_empty() {
            continue;
        }
        if let Some(addr) = verifier.view.section_mem_addr(module, &s.name) {
            section_mem_by_index.insert(s.index, addr);
            section_mem.insert(s.name.clone(), addr);
        }
    }
    let text_mem = section_mem.get(".text").copied().or_else(|| {
        module
            .member("module_core", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty())
            .to_pointer()
    });
    let Some(text_mem) = text_mem else {
        return Err(InsightError::SymbolParse(format!(
            "cannot locate .text of module {name} in the guest"
        )));
    };

    let percpu_section = obj
        .section_by_name(".data..percpu")
        .map(|s| s.index);

    let unresolved = {
        let resolver = Resolver {
            view: &verifier.view,
            sym_table: &verifier.sym_table,
            func_table: &verifier.func_table,
        };
        reloc::apply_relocations(
            &mut obj,
            &section_mem_by_index,
            percpu_section,
            Some(module),
            &resolver,
        )
    };
    for sym in unresolved {
        verifier.record_unresolved(name, &sym);
    }

    let layout = ImageLayout {
        kind: ImageKind::Module,
        text: text.clone(),
        text_mem,
        section_mem,
    };

    apply_altinstr(&mut obj, &verifier.view, &layout, verifier.nop_family);
    apply_parainstr(
        &mut obj,
        &verifier.view,
        &layout,
        verifier.nop_family,
        &mut verifier.paravirt_jump,
        &mut verifier.paravirt_call,
    );
    let smp_offsets = apply_smp_locks(&mut obj, &verifier.view, &layout);

    let mut text_content = obj.section_bytes(&text).to_vec();
    let extra: Vec<SectionInfo> = obj.extra_exec_sections().cloned().collect();
    for s in &extra {
        text_content.extend_from_slice(obj.section_bytes(s));
    }
    let text_initialized = text_content.len() as u64;

    apply_mcount(&obj, &layout, verifier.nop_family, &mut text_content);
    let jump_entries = apply_module_jump_entries(
        &obj,
        &verifier.view,
        &layout,
        verifier.nop_family,
        &mut text_content,
        module,
    );

    let mut image = ParsedImage {
        name: name.to_owned(),
        kind: ImageKind::Module,
        text_mem,
        text_file_off: text.offset,
        text_size: text.size,
        text_content,
        text_initialized,
        smp_offsets,
        jump_entries,
        page_size: MODULE_PAGE_SIZE,
        pages: Vec::new(),
        obj,
    };
    image.build_pages();
    debug!(module = name, pages = image.pages.len(), "module image prepared");
    Ok(image)
}

// ---- alternative instructions --------------------------------------------

fn apply_altinstr(obj: &mut ObjectFile, view: &DumpView<'_>, layout: &ImageLayout, nops: NopFamily) {
    let Some(alt) = obj.section_by_name(".altinstructions").cloned() else {
        return;
    };
    let repl = obj.section_by_name(".altinstr_replacement").cloned();

    let mut rec = 0u64;
    while rec + ALT_INSTR_SIZE <= alt.size {
        let base = alt.offset + rec;
        let (Some(instr_off), Some(repl_off), Some(cpuid), Some(instrlen), Some(replacementlen)) = (
            obj.read_i32_at(base),
            obj.read_i32_at(base + 4),
            obj.read_u16_at(base + 8),
            obj.read_u8_at(base + 10),
            obj.read_u8_at(base + 11),
        ) else {
            break;
        };
        rec += ALT_INSTR_SIZE;

        if !view.boot_cpu_has(cpuid as u32) {
            continue;
        }

        let (instr_filepos, instr_mem, repl_filepos, repl_mem) = match layout.kind {
            ImageKind::Module => {
                // Relocations kept these offsets file-relative.
                let ip = (base as i64 + instr_off as i64) as u64;
                let rp = (base as i64 + 4 + repl_off as i64) as u64;
                let im = layout.text_mem + ip.wrapping_sub(layout.text.offset);
                let rm = repl
                    .as_ref()
                    .map(|r| layout.mem_of(r) + rp.wrapping_sub(r.offset))
                    .unwrap_or(0);
                (ip, im, rp, rm)
            }
            ImageKind::Kernel => {
                let field_mem = alt.addr + (base - alt.offset);
                let im = (field_mem as i64 + instr_off as i64) as u64;
                let rm = (field_mem as i64 + 4 + repl_off as i64) as u64;
                let ip = layout.text_filepos(im);
                let rp = repl
                    .as_ref()
                    .map(|r| r.offset + rm.wrapping_sub(r.addr))
                    .unwrap_or(0);
                (ip, im, rp, rm)
            }
        };

        let instrlen = instrlen as usize;
        let replacementlen = (replacementlen as usize).min(instrlen);
        let mut insnbuf = vec![0u8; instrlen];
        for (i, b) in insnbuf.iter_mut().take(replacementlen).enumerate() {
            *b = obj.read_u8_at(repl_filepos + i as u64).unwrap_or(0x90);
        }

        // Fix up a relative call whose target lies inside the replacement
        // section: its displacement must follow the copy.
        let in_repl = repl
            .as_ref()
            .is_some_and(|r| repl_filepos >= r.offset && repl_filepos < r.offset + r.size);
        if insnbuf.first() == Some(&0xe8) && replacementlen == 5 && in_repl {
            let old = i32::from_le_bytes(insnbuf[1..5].try_into().unwrap_or([0; 4]));
            let fixed = old.wrapping_add(repl_mem.wrapping_sub(instr_mem) as i32);
            insnbuf[1..5].copy_from_slice(&fixed.to_le_bytes());
        }

        nops.add_nops(&mut insnbuf[replacementlen..]);
        obj.write_bytes_at(instr_filepos, &insnbuf);
    }
}

// ---- paravirt ------------------------------------------------------------

fn apply_parainstr(
    obj: &mut ObjectFile,
    view: &DumpView<'_>,
    layout: &ImageLayout,
    nops: NopFamily,
    pv_jump: &mut Vec<u64>,
    pv_call: &mut Vec<u64>,
) {
    let Some(para) = obj.section_by_name(".parainstructions").cloned() else {
        return;
    };

    let mut rec = 0u64;
    while rec + PV_PATCH_SITE_SIZE <= para.size {
        let base = para.offset + rec;
        let (Some(instr_mem), Some(ptype), Some(len), Some(clobbers)) = (
            obj.read_u64_at(base),
            obj.read_u8_at(base + 8),
            obj.read_u8_at(base + 9),
            obj.read_u16_at(base + 10),
        ) else {
            break;
        };
        rec += PV_PATCH_SITE_SIZE;

        let len = len as usize;
        if len > 254 {
            warn!("parainstructions: impossible length {len}");
            continue;
        }
        let filepos = layout.text_filepos(instr_mem);
        let mut insnbuf = vec![0u8; len];
        for (i, b) in insnbuf.iter_mut().enumerate() {
            *b = obj.read_u8_at(filepos + i as u64).unwrap_or(0x90);
        }

        // instrtype indexes the paravirt ops vectors in pointer strides.
        let used = paravirt_native_patch(
            view,
            ptype as u32 * 8,
            clobbers,
            &mut insnbuf,
            instr_mem,
            pv_jump,
            pv_call,
        );
        nops.add_nops(&mut insnbuf[used..]);
        obj.write_bytes_at(filepos, &insnbuf);
    }
}

/// Byte offset of `member` inside the ops vector `ops` as laid out in
/// `struct paravirt_patch_template`.
fn pv_slot_offset(view: &DumpView<'_>, ops: &str, member: &str) -> Option<u32> {
    let ppt = view.type_of("paravirt_patch_template")?;
    let ops_off = ppt.structured()?.member(ops)?.offset;
    let ops_ty = view.type_of(ops)?;
    let member_off = ops_ty.structured()?.member(member)?.offset;
    Some(ops_off + member_off)
}

/// Native instruction sequences for patchable paravirt slots.
const NATIVE_SITES: &[(&str, &str, &[u8])] = &[
    ("pv_irq_ops", "restore_fl", &[0x57, 0x9d]),
    ("pv_irq_ops", "save_fl", &[0x9c, 0x58]),
    ("pv_irq_ops", "irq_enable", &[0xfb]),
    ("pv_irq_ops", "irq_disable", &[0xfa]),
    ("pv_cpu_ops", "iret", &[0x48, 0xcf]),
    ("pv_cpu_ops", "irq_enable_sysexit", &[0x0f, 0x01, 0xf8, 0xfb, 0x0f, 0x35]),
    ("pv_cpu_ops", "usergs_sysret32", &[0x0f, 0x01, 0xf8, 0x0f, 0x07]),
    ("pv_cpu_ops", "usergs_sysret64", &[0x0f, 0x01, 0xf8, 0x48, 0x0f, 0x07]),
    ("pv_cpu_ops", "swapgs", &[0x0f, 0x01, 0xf8]),
    ("pv_mmu_ops", "read_cr2", &[0x0f, 0x20, 0xd0]),
    ("pv_mmu_ops", "read_cr3", &[0x0f, 0x20, 0xd8]),
    ("pv_mmu_ops", "write_cr3", &[0x0f, 0x22, 0xdf]),
    ("pv_cpu_ops", "clts", &[0x0f, 0x06]),
    ("pv_mmu_ops", "flush_tlb_single", &[0x0f, 0x01, 0x3f]),
    ("pv_cpu_ops", "wbinvd", &[0x0f, 0x09]),
];

const MOV32: &[u8] = &[0x89, 0xf8]; // mov %edi, %eax
const MOV64: &[u8] = &[0x48, 0x89, 0xf8]; // mov %rdi, %rax

fn patch_insns(buf: &mut [u8], insns: &[u8]) -> usize {
    if insns.len() > buf.len() {
        return buf.len();
    }
    buf[..insns.len()].copy_from_slice(insns);
    insns.len()
}

fn paravirt_native_patch(
    view: &DumpView<'_>,
    ptype: u32,
    clobbers: u16,
    buf: &mut [u8],
    addr: u64,
    pv_jump: &mut Vec<u64>,
    pv_call: &mut Vec<u64>,
) -> usize {
    for (ops, member, insns) in NATIVE_SITES {
        if pv_slot_offset(view, ops, member) == Some(ptype) {
            return patch_insns(buf, insns);
        }
    }
    paravirt_patch_default(view, ptype, clobbers, buf, addr, pv_jump, pv_call)
}

/// The live call target of a paravirt ops slot: the ops structures lie
/// consecutively in memory, so `ptype` indexes across them.
fn get_call_destination(view: &DumpView<'_>, ptype: u32) -> u64 {
    const OPS: &[&str] = &[
        "pv_init_ops",
        "pv_time_ops",
        "pv_cpu_ops",
        "pv_irq_ops",
        "pv_apic_ops",
        "pv_mmu_ops",
        "pv_lock_ops",
    ];
    let mut offset = ptype as u64;
    for name in OPS {
        let Some(inst) = view.var_instance(name) else {
            continue;
        };
        let size = inst.size();
        if offset < size {
            return view.vmem.to_pointer(inst.address() + offset).unwrap_or(0);
        }
        offset -= size;
    }
    0
}

fn function_address(view: &DumpView<'_>, name: &str) -> Option<u64> {
    for ty in view.factory.types_by_name(name) {
        if ty.real_type() == RealType::Function && ty.size > 0 {
            if let TypeKind::Function(f) = &ty.kind {
                return Some(f.pc_low);
            }
        }
    }
    None
}

fn paravirt_patch_default(
    view: &DumpView<'_>,
    ptype: u32,
    clobbers: u16,
    buf: &mut [u8],
    addr: u64,
    pv_jump: &mut Vec<u64>,
    pv_call: &mut Vec<u64>,
) -> usize {
    let opfunc = get_call_destination(view, ptype);

    if opfunc == 0 {
        // A null op gets NOPed out entirely.
        return 0;
    }
    if Some(opfunc) == function_address(view, "_paravirt_nop") {
        return 0;
    }
    if Some(opfunc) == function_address(view, "_paravirt_ident_32") {
        return patch_insns(buf, MOV32);
    }
    if Some(opfunc) == function_address(view, "_paravirt_ident_64") {
        return patch_insns(buf, MOV64);
    }

    let jump_slots = [
        pv_slot_offset(view, "pv_cpu_ops", "iret"),
        pv_slot_offset(view, "pv_cpu_ops", "irq_enable_sysexit"),
        pv_slot_offset(view, "pv_cpu_ops", "usergs_sysret32"),
        pv_slot_offset(view, "pv_cpu_ops", "usergs_sysret64"),
    ];
    if jump_slots.contains(&Some(ptype)) {
        // The operation requires a jump.
        if buf.len() < 5 {
            return buf.len();
        }
        let delta = opfunc.wrapping_sub(addr + 5) as u32;
        buf[0] = 0xe9;
        buf[1..5].copy_from_slice(&delta.to_le_bytes());
        if !pv_jump.contains(&opfunc) {
            pv_jump.push(opfunc);
        }
        return 5;
    }

    // Otherwise call the function; the target may clobber any caller-save
    // register, so only patch when the site tolerates that.
    if CLBR_ANY & !clobbers != 0 || buf.len() < 5 {
        return buf.len();
    }
    let delta = opfunc.wrapping_sub(addr + 5) as u32;
    buf[0] = 0xe8;
    buf[1..5].copy_from_slice(&delta.to_le_bytes());
    if !pv_call.contains(&opfunc) {
        pv_call.push(opfunc);
    }
    5
}

// ---- SMP lock prefixes ---------------------------------------------------

fn apply_smp_locks(obj: &mut ObjectFile, view: &DumpView<'_>, layout: &ImageLayout) -> HashSet<u64> {
    let mut offsets = HashSet::new();
    let Some(smp) = obj.section_by_name(".smp_locks").cloned() else {
        return offsets;
    };
    let smp_mem = layout.mem_of(&smp);
    let lock = if view.boot_cpu_has(X86_FEATURE_UP) {
        0xf0 // LOCK prefix
    } else {
        0x3e // DS segment override, the unlock-on-UP transform
    };
    let mut rec = 0u64;
    while rec + 4 <= smp.size {
        let Some(rel) = obj.read_i32_at(smp.offset + rec) else {
            break;
        };
        let field_mem = smp_mem + rec;
        let target_mem = (field_mem as i64 + rel as i64) as u64;
        let filepos = layout.text_filepos(target_mem);
        obj.write_u8_at(filepos, lock);
        offsets.insert(target_mem.wrapping_sub(layout.text_mem));
        rec += 4;
    }
    offsets
}

// ---- ftrace call sites ---------------------------------------------------

fn apply_mcount(
    obj: &ObjectFile,
    layout: &ImageLayout,
    nops: NopFamily,
    text_content: &mut [u8],
) {
    let Some(mc) = obj.section_by_name("__mcount_loc") else {
        return;
    };
    let mut rec = 0u64;
    while rec + 8 <= mc.size {
        let Some(target_mem) = obj.read_u64_at(mc.offset + rec) else {
            break;
        };
        rec += 8;
        let off = target_mem.wrapping_sub(layout.text_mem) as usize;
        if let Some(slice) = text_content.get_mut(off..off + 5) {
            nops.add_nops(slice);
        }
    }
}

// ---- jump labels ---------------------------------------------------------

fn patch_jump_site(
    text_content: &mut [u8],
    off: usize,
    dest: i32,
    enabled: bool,
    nops: NopFamily,
) {
    let Some(site) = text_content.get_mut(off..off + 5) else {
        return;
    };
    if enabled {
        site[0] = 0xe9;
        site[1..5].copy_from_slice(&dest.to_le_bytes());
    } else {
        nops.add_nops(site);
    }
}

/// Scans the object's `__jump_table` for the site matching a live entry
/// and patches it according to the live key. Returns offset -> rel32.
fn apply_jump_table(
    obj: &ObjectFile,
    view: &DumpView<'_>,
    layout: &ImageLayout,
    nops: NopFamily,
    text_content: &mut [u8],
    live_entries: &[(u64, u64)], // (code address, key address)
) -> HashMap<u64, i32> {
    let mut recorded = HashMap::new();
    let Some(table) = obj.section_by_name("__jump_table") else {
        return recorded;
    };
    for &(live_code, key_addr) in live_entries {
        let enabled = view.vmem.read_u32(key_addr).map(|v| v != 0).unwrap_or(false);
        let mut rec = 0u64;
        while rec + JUMP_ENTRY_SIZE <= table.size {
            let base = table.offset + rec;
            rec += JUMP_ENTRY_SIZE;
            let (Some(code), Some(target)) =
                (obj.read_u64_at(base), obj.read_u64_at(base + 8))
            else {
                break;
            };
            if code != live_code {
                continue;
            }
            let off = code.wrapping_sub(layout.text_mem);
            let dest = target.wrapping_sub(code + 5) as i32;
            recorded.insert(off, dest);
            patch_jump_site(text_content, off as usize, dest, enabled, nops);
        }
    }
    recorded
}

fn apply_kernel_jump_entries(
    obj: &ObjectFile,
    view: &DumpView<'_>,
    layout: &ImageLayout,
    nops: NopFamily,
    text_content: &mut [u8],
    jump_start: Option<u64>,
    jump_stop: Option<u64>,
    text_size: u64,
) -> HashMap<u64, i32> {
    let (Some(start), Some(stop)) = (jump_start, jump_stop) else {
        return HashMap::new();
    };
    let count = (stop.saturating_sub(start)) / JUMP_ENTRY_SIZE;
    let mut live = Vec::new();
    for i in 0..count {
        let base = start + i * JUMP_ENTRY_SIZE;
        let (Ok(code), Ok(key)) = (view.vmem.read_u64(base), view.vmem.read_u64(base + 16))
        else {
            continue;
        };
        // Jump entries into .init.text are gone after boot.
        if code > layout.text_mem + text_size {
            continue;
        }
        live.push((code, key));
    }
    apply_jump_table(obj, view, layout, nops, text_content, &live)
}

fn apply_module_jump_entries(
    obj: &ObjectFile,
    view: &DumpView<'_>,
    layout: &ImageLayout,
    nops: NopFamily,
    text_content: &mut [u8],
    module: &Instance<'_>,
) -> HashMap<u64, i32> {
    let count = module
        .member("num_jump_entries", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty())
        .to_uint32()
        .unwrap_or(0);
    let base = module
        .member("jump_entries", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty())
        .to_pointer()
        .unwrap_or(0);
    if count == 0 || base == 0 {
        return HashMap::new();
    }
    let mut live = Vec::new();
    for i in 0..count as u64 {
        let entry = base + i * JUMP_ENTRY_SIZE;
        let (Ok(code), Ok(key)) = (view.vmem.read_u64(entry), view.vmem.read_u64(entry + 16))
        else {
            continue;
        };
        live.push((code, key));
    }
    apply_jump_table(obj, view, layout, nops, text_content, &live)
}
