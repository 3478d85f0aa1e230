//! The per-dump verification pass: walk every mapped kernel page, classify
//! executable ones, hash them against the reconstructed images and filter
//! the benign byte deltas the kernel itself produces at runtime.

use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::instance::KnowledgeSources;
use crate::interrupt;
use crate::symbols::RealTypeSet;
use crate::vmem::PageTableEntries;

use super::nops::NOP_ATOMIC5;
use super::{ByteChange, DumpView, ImageKind, PageFinding, PageVerifier, ParsedImage};

/// vmap_area flag bits marking an area on the lazy-free path.
const VM_LAZY_BITS: u64 = 0x3;

const CONTEXT_WINDOW: usize = 15;

impl<'a> PageVerifier<'a> {
    /// Scans all of kernel space. Loads the kernel image and every listed
    /// module first if that has not happened yet.
    pub fn verify_dump(&mut self) -> Result<&super::VerifyReport> {
        self.load_kernel()?;
        self.load_all_modules()?;

        let specs = self.view.vmem.specs().clone();
        let smap = &specs.system_map;
        let kernel_code_begin = smap.address_of("_text").unwrap_or(0);
        let kernel_code_end = smap.address_of("_etext").unwrap_or(0);
        let kernel_data_exec_end = smap.address_of("__bss_stop").unwrap_or(0);
        let vsyscall_page = smap.address_of("VDSO64_PRELINK").unwrap_or(0);
        if kernel_code_begin == 0 || kernel_code_end == 0 || kernel_data_exec_end == 0 {
            warn!(
                code_begin = format_args!("{kernel_code_begin:#x}"),
                code_end = format_args!("{kernel_code_end:#x}"),
                data_end = format_args!("{kernel_data_exec_end:#x}"),
                "System.map lacks some kernel layout symbols"
            );
        }

        // On x86-64 the direct mapping aliases every page; start behind it.
        let begin = if specs.is_64bit() {
            0xffff_c7ff_ffff_ffffu64 + 1
        } else {
            specs.page_offset & !(super::MODULE_PAGE_SIZE - 1)
        };
        let end = specs.vaddr_space_end();

        // Live module text ranges, resolved once.
        let module_ranges: Vec<(String, u64, u64)> = self
            .view
            .modules()
            .iter()
            .filter_map(|m| {
                let core = m
                    .member("module_core", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty())
                    .to_pointer()?;
                let text_size = m
                    .member("core_text_size", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty())
                    .to_uint64()
                    .unwrap_or(0);
                Some((self.view.module_name(m), core, core + text_size))
            })
            .collect();

        let mut entries = PageTableEntries::default();
        let mut addr = begin;
        while addr < end {
            if interrupt::interrupted() {
                self.report.interrupted = true;
                break;
            }
            entries.reset();
            let _ = self.view.vmem.walk_page_tables(addr, &mut entries);
            let step = entries.next_page_offset(&specs);

            if entries.is_present() {
                self.report.processed_pages += 1;
                if !entries.is_executable(&specs) {
                    self.report.nonexecutable_pages += 1;
                } else if !entries.is_supervisor() {
                    self.report.nonsupervisor_pages += 1;
                } else {
                    self.report.executable_pages += 1;
                    self.classify_and_check(
                        addr,
                        step,
                        kernel_code_begin,
                        kernel_code_end,
                        kernel_data_exec_end,
                        vsyscall_page,
                        &module_ranges,
                    );
                }
            }

            match addr.checked_add(step) {
                Some(next) => addr = next,
                None => break,
            }
        }

        info!(
            processed = self.report.processed_pages,
            executable = self.report.executable_pages,
            kernel_code = self.report.kernel_code_pages,
            module = self.report.module_pages,
            vmap = self.report.vmap_pages,
            lazy = self.report.lazy_pages,
            unknown = self.report.unknown_pages,
            mismatches = self.report.mismatch_count(),
            "page verification finished"
        );
        Ok(&self.report)
    }

    #[allow(clippy::too_many_arguments)]
    fn classify_and_check(
        &mut self,
        addr: u64,
        page_size: u64,
        kernel_code_begin: u64,
        kernel_code_end: u64,
        kernel_data_exec_end: u64,
        vsyscall_page: u64,
        module_ranges: &[(String, u64, u64)],
    ) {
        let mut data = vec![0u8; page_size as usize];
        if self.view.vmem.read_atomic(addr, &mut data).is_err() {
            self.report.findings.push(PageFinding {
                address: addr,
                image: "<unreadable>".into(),
                page_index: 0,
                change_count: 0,
                first_change: None,
                note: Some("could not read page data".into()),
            });
            return;
        }

        if addr >= kernel_code_begin && addr <= kernel_code_end && kernel_code_begin != 0 {
            self.report.kernel_code_pages += 1;
            self.check_image_page("kernel", addr, &data);
            return;
        }
        if addr > kernel_code_end && addr <= kernel_data_exec_end && kernel_code_end != 0 {
            // Executable kernel data; nothing on disk to rebuild it from.
            self.report.kernel_data_pages += 1;
            return;
        }
        if addr == vsyscall_page && vsyscall_page != 0 {
            self.report.vsyscall_pages += 1;
            return;
        }
        for (name, lo, hi) in module_ranges {
            if addr >= *lo && addr <= *hi {
                self.report.module_pages += 1;
                let key = super::module_elf::normalize_module_name(name);
                self.check_image_page(&key, addr, &data);
                return;
            }
        }
        let vmap_flags = self.in_vmap(addr);
        if vmap_flags != 0 {
            self.report.vmap_pages += 1;
            if vmap_flags & VM_LAZY_BITS != 0 {
                self.report.lazy_pages += 1;
            }
            return;
        }
        self.report.unknown_pages += 1;
        self.report.findings.push(PageFinding {
            address: addr,
            image: "<unknown>".into(),
            page_index: 0,
            change_count: 0,
            first_change: None,
            note: Some("executable page not attributable to kernel or modules".into()),
        });
    }

    fn check_image_page(&mut self, image_name: &str, addr: u64, live: &[u8]) {
        let Some(image) = self.parsed.get(image_name) else {
            // Already reported as missing at load time.
            return;
        };
        let page_index = addr.wrapping_sub(image.text_mem) / image.page_size;
        if let Some(finding) = check_code_page(image, page_index, live, addr, self.nop_family) {
            self.report.findings.push(finding);
        }
    }

    /// Red-black-tree lookup in the kernel's `vmap_area_root`; returns the
    /// matching area's flags word or zero.
    fn in_vmap(&self, addr: u64) -> u64 {
        in_vmap(&self.view, addr)
    }
}

pub(crate) fn in_vmap(view: &DumpView<'_>, addr: u64) -> u64 {
    let Some(root) = view.var_instance("vmap_area_root") else {
        return 0;
    };
    let Some(va_ty) = view.type_of("vmap_area") else {
        return 0;
    };
    let Some(probe) = view.instance_at("vmap_area", 0) else {
        return 0;
    };
    let (Some(rb_off), Some(start_off), Some(end_off), Some(flags_off)) = (
        probe.member_offset("rb_node"),
        probe.member_offset("va_start"),
        probe.member_offset("va_end"),
        probe.member_offset("flags"),
    ) else {
        return 0;
    };
    let Some(rb_probe) = view.instance_at("rb_node", 0) else {
        return 0;
    };
    let (Some(left_off), Some(right_off)) = (
        rb_probe.member_offset("rb_left"),
        rb_probe.member_offset("rb_right"),
    ) else {
        return 0;
    };
    let _ = va_ty;

    let Ok(mut node) = view.vmem.to_pointer(root.address()) else {
        return 0;
    };
    let mut guard = 0;
    while node != 0 && guard < 64 {
        let va = node.wrapping_sub(rb_off);
        let (Ok(va_start), Ok(va_end)) = (
            view.vmem.to_pointer(va + start_off),
            view.vmem.to_pointer(va + end_off),
        ) else {
            return 0;
        };
        if addr >= va_start && addr <= va_end {
            return view.vmem.to_pointer(va + flags_off).unwrap_or(0);
        }
        let next = if addr > va_end {
            view.vmem.to_pointer(node + right_off)
        } else {
            view.vmem.to_pointer(node + left_off)
        };
        match next {
            Ok(n) => node = n,
            Err(_) => return 0,
        }
        guard += 1;
    }
    0
}

/// Hashes one live page against the reconstruction and, on mismatch, runs
/// the byte diff with the benign-difference filters. Returns a finding if
/// anything unexplained remains (or bookkeeping noise worth reporting).
pub(crate) fn check_code_page(
    image: &ParsedImage,
    page_index: u64,
    live: &[u8],
    addr: u64,
    nops: super::nops::NopFamily,
) -> Option<PageFinding> {
    let Some(page) = image.pages.get(page_index as usize) else {
        return Some(PageFinding {
            address: addr,
            image: image.name.clone(),
            page_index,
            change_count: 0,
            first_change: None,
            note: Some(format!(
                "page index {page_index} beyond reconstructed image ({} pages)",
                image.pages.len()
            )),
        });
    };
    let live_hash: [u8; 20] = Sha1::digest(live).into();
    if live_hash == page.hash {
        return None;
    }

    let expected = &page.content;
    let nop5 = nops.nop(5);
    let atomic5 = nops.table()[NOP_ATOMIC5];
    let mut change_count = 0u32;
    let mut first_change: Option<ByteChange> = None;
    let mut note = None;

    let len = live.len().min(expected.len());
    let mut i = 0usize;
    while i < len {
        if expected[i] == live[i] {
            i += 1;
            continue;
        }
        // Only judge the first byte of each differing run.
        if i > 0 && expected[i - 1] != live[i - 1] {
            i += 1;
            continue;
        }

        // Atomic-NOP exchange around jump-label sites.
        if i > 1
            && expected.get(i - 2..i + 3) == Some(nop5)
            && live.get(i - 2..i + 3) == Some(atomic5)
        {
            i += 5;
            continue;
        }
        // Two-byte NOP vs. its swapped encoding at a page head.
        if i <= 1
            && ((expected[i] == 0x66 && live[i] == 0x90)
                || (expected[i] == 0x90 && live[i] == 0x66))
        {
            i += 1;
            continue;
        }
        // A jump label we reconstructed enabled but the guest has since
        // disabled: the recorded rel32 identifies the site.
        if expected[i] == 0xe9
            && (live.get(i..i + 5) == Some(nop5) || live.get(i..i + 5) == Some(atomic5))
        {
            let site = page_index * image.page_size + i as u64;
            if let Some(&dest) = image.jump_entries.get(&site) {
                let rel = expected
                    .get(i + 1..i + 5)
                    .map(|b| i32::from_le_bytes(b.try_into().unwrap()));
                if rel == Some(dest) {
                    i += 5;
                    continue;
                }
            }
        }
        // SMP lock prefix toggled the other way at a recorded site.
        if image.smp_offsets.contains(&(page_index * image.page_size + i as u64))
            && ((expected[i] == 0x3e && live[i] == 0xf0)
                || (expected[i] == 0xf0 && live[i] == 0x3e))
        {
            i += 1;
            continue;
        }
        // Tail of the last page beyond the initialized text length.
        if image.kind == ImageKind::Kernel
            && page_index as usize == image.pages.len() - 1
            && i as u64 >= image.text_initialized % image.page_size
        {
            note = Some(format!(
                "uninitialized tail beyond {:#x} bytes of text",
                image.text_initialized
            ));
            break;
        }

        if first_change.is_none() {
            let lo = i.saturating_sub(CONTEXT_WINDOW);
            let hi = (i + CONTEXT_WINDOW).min(len);
            first_change = Some(ByteChange {
                offset: i,
                expected: expected[i],
                found: live[i],
                context_expected: expected[lo..hi].to_vec(),
                context_found: live[lo..hi].to_vec(),
            });
        }
        change_count += 1;
        i += 1;
    }

    if change_count == 0 && note.is_none() {
        debug!(
            image = %image.name,
            page = page_index,
            "hash mismatch fully explained by benign differences"
        );
        return None;
    }
    Some(PageFinding {
        address: addr,
        image: image.name.clone(),
        page_index,
        change_count,
        first_change,
        note,
    })
}

#[cfg(test)]
mod tests {
    use super::super::module_elf::ObjectFile;
    use super::super::nops::NopFamily;
    use super::super::{ImageKind, ParsedImage, MODULE_PAGE_SIZE};
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn dummy_obj() -> ObjectFile {
        ObjectFile {
            bytes: Vec::new(),
            sections: Vec::new(),
            symbols: Vec::new(),
            relas: Vec::new(),
            is_relocatable: true,
        }
    }

    fn image_with(content: Vec<u8>) -> ParsedImage {
        let mut image = ParsedImage {
            name: "test".into(),
            kind: ImageKind::Module,
            obj: dummy_obj(),
            text_mem: 0xffff_ffff_a000_0000,
            text_file_off: 0,
            text_size: content.len() as u64,
            text_initialized: content.len() as u64,
            text_content: content,
            smp_offsets: HashSet::new(),
            jump_entries: HashMap::new(),
            page_size: MODULE_PAGE_SIZE,
            pages: Vec::new(),
        };
        image.build_pages();
        image
    }

    #[test]
    fn identical_page_passes() {
        let image = image_with(vec![0xcc; 64]);
        let live = image.pages[0].content.clone();
        assert!(check_code_page(&image, 0, &live, 0, NopFamily::K8).is_none());
    }

    #[test]
    fn injected_hook_is_reported() {
        let image = image_with(vec![0xcc; 64]);
        let mut live = image.pages[0].content.clone();
        // A planted 5-byte jump at offset 16.
        live[16] = 0xe9;
        live[17..21].copy_from_slice(&0x1234i32.to_le_bytes());
        let f = check_code_page(&image, 0, &live, 0xffff_ffff_a000_0000, NopFamily::K8)
            .expect("finding");
        assert_eq!(f.change_count, 1);
        let change = f.first_change.expect("first change");
        assert_eq!(change.offset, 16);
        assert_eq!(change.expected, 0xcc);
        assert_eq!(change.found, 0xe9);
        assert!(change.context_expected.len() <= 30);
    }

    #[test]
    fn disabled_jump_label_is_benign() {
        let mut content = vec![0x90u8; 64];
        // Reconstructed with an enabled jump at offset 8.
        content[8] = 0xe9;
        content[9..13].copy_from_slice(&0x42i32.to_le_bytes());
        let mut image = image_with(content);
        image.jump_entries.insert(8, 0x42);
        image.build_pages();

        let mut live = image.pages[0].content.clone();
        live[8..13].copy_from_slice(NopFamily::K8.nop(5));
        assert!(check_code_page(&image, 0, &live, 0, NopFamily::K8).is_none());
    }

    #[test]
    fn smp_lock_toggle_is_benign() {
        let mut content = vec![0x90u8; 64];
        content[20] = 0xf0;
        let mut image = image_with(content);
        image.smp_offsets.insert(20);
        image.build_pages();
        let mut live = image.pages[0].content.clone();
        live[20] = 0x3e;
        assert!(check_code_page(&image, 0, &live, 0, NopFamily::K8).is_none());
    }

    #[test]
    fn atomic_nop_swap_is_benign() {
        let mut content = vec![0xccu8; 64];
        content[10..15].copy_from_slice(NopFamily::K8.nop(5));
        let image = image_with(content);
        let mut live = image.pages[0].content.clone();
        live[10..15].copy_from_slice(NopFamily::K8.atomic5());
        assert!(check_code_page(&image, 0, &live, 0, NopFamily::K8).is_none());
    }
}
