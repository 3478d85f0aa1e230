//! Read-only virtual-memory view over a raw physical-memory image.
//!
//! Layers on-demand address translation over a seek/read byte source. The
//! kernel's linear mappings are translated arithmetically; everything else
//! goes through the page-table walker with a translation cache in front.
//! The byte source has a single cursor, so all access is serialized through
//! one mutex; the thread-safety flag only records whether concurrent
//! callers are expected.

pub mod cache;
pub mod translate;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{InsightError, Result};
use crate::memspecs::MemSpecs;

use cache::TlbCache;
pub use translate::{PageTableEntries, PhysReader, PteFlags, Translation};
pub use translate::{PAGE_SIZE_1G, PAGE_SIZE_2M, PAGE_SIZE_4K, PAGE_SIZE_4M};

/// A seekable byte source holding the guest's physical memory.
pub trait MemSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> MemSource for T {}

struct Inner {
    source: Box<dyn MemSource>,
    size: u64,
    tlb: TlbCache,
}

impl PhysReader for Inner {
    fn read_phys(&mut self, paddr: u64, buf: &mut [u8]) -> Result<()> {
        if paddr >= self.size {
            return Err(InsightError::ShortRead {
                addr: paddr,
                got: 0,
                wanted: buf.len(),
            });
        }
        self.source.seek(SeekFrom::Start(paddr))?;
        let mut done = 0;
        while done < buf.len() {
            let n = self.source.read(&mut buf[done..])?;
            if n == 0 {
                return Err(InsightError::ShortRead {
                    addr: paddr,
                    got: done,
                    wanted: buf.len(),
                });
            }
            done += n;
        }
        Ok(())
    }
}

pub struct VirtualMemory {
    specs: MemSpecs,
    index: usize,
    thread_safe: AtomicBool,
    inner: Mutex<Inner>,
}

impl VirtualMemory {
    pub fn new(specs: MemSpecs, mut source: Box<dyn MemSource>, index: usize) -> Result<Self> {
        let size = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(0))?;
        Ok(VirtualMemory {
            specs,
            index,
            thread_safe: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                source,
                size,
                tlb: TlbCache::default(),
            }),
        })
    }

    pub fn open_file(specs: MemSpecs, path: &Path, index: usize) -> Result<Self> {
        let file = File::open(path)
            .map_err(|_| InsightError::FileNotFound(path.display().to_string()))?;
        Self::new(specs, Box::new(file), index)
    }

    pub fn specs(&self) -> &MemSpecs {
        &self.specs
    }

    /// Applies runtime-read values (`high_memory`, `vmalloc_earlyreserve`)
    /// once the dump is open.
    pub fn specs_mut(&mut self) -> &mut MemSpecs {
        &mut self.specs
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Length of the underlying physical image in bytes.
    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn set_thread_safety(&self, enabled: bool) -> bool {
        self.thread_safe.swap(enabled, Ordering::Relaxed)
    }

    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drops all cached translations.
    pub fn flush(&self) {
        self.lock().tlb.flush();
    }

    // ---- translation -----------------------------------------------------

    /// Kernel-space translation: linear mappings are computed directly,
    /// the rest walks the kernel page tables with the cache in front.
    pub fn translate(&self, vaddr: u64) -> Result<Translation> {
        let mut inner = self.lock();
        self.translate_locked(&mut inner, vaddr)
    }

    fn translate_locked(&self, inner: &mut Inner, vaddr: u64) -> Result<Translation> {
        let specs = &self.specs;
        if specs.is_64bit() {
            translate::check_canonical(vaddr)?;
            if specs.start_kernel_map != 0 && vaddr >= specs.start_kernel_map {
                return Ok(Translation {
                    paddr: vaddr - specs.start_kernel_map,
                    page_size: PAGE_SIZE_4K,
                    flags: PteFlags::PRESENT,
                });
            }
            if vaddr >= specs.page_offset && vaddr < specs.vmalloc_start {
                return Ok(Translation {
                    paddr: vaddr - specs.page_offset,
                    page_size: PAGE_SIZE_4K,
                    flags: PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::NX,
                });
            }
        } else {
            if vaddr < specs.page_offset {
                // User-space needs a caller-supplied page directory.
                return Err(InsightError::NonPresentPage { addr: vaddr });
            }
            let linear_end = if self.specs.high_memory != 0 {
                self.specs.high_memory
            } else {
                self.specs.vmalloc_start
            };
            if vaddr < linear_end {
                return Ok(Translation {
                    paddr: vaddr - specs.page_offset,
                    page_size: PAGE_SIZE_4K,
                    flags: PteFlags::PRESENT | PteFlags::WRITABLE,
                });
            }
        }
        let root = specs.pgd_root();
        if let Some(hit) = inner.tlb.lookup(root, vaddr) {
            return Ok(hit);
        }
        let t = translate::translate(inner, specs, root, vaddr)?;
        inner.tlb.insert(root, vaddr, t);
        Ok(t)
    }

    /// User-space translation through a caller-supplied CR3-equivalent
    /// (physical address of the page-directory root).
    pub fn translate_user(&self, vaddr: u64, pgd_root: u64) -> Result<Translation> {
        let mut inner = self.lock();
        if let Some(hit) = inner.tlb.lookup(pgd_root, vaddr) {
            return Ok(hit);
        }
        let t = translate::translate(&mut *inner, &self.specs, pgd_root, vaddr)?;
        inner.tlb.insert(pgd_root, vaddr, t);
        Ok(t)
    }

    /// Uncached full walk exposing the raw entries; the page verifier uses
    /// this to see presence, NX and supervisor bits per level.
    pub fn walk_page_tables(&self, vaddr: u64, entries: &mut PageTableEntries) -> Result<Translation> {
        let mut inner = self.lock();
        let root = self.specs.pgd_root();
        translate::walk(&mut *inner, &self.specs, root, vaddr, entries)
    }

    /// Cheap predicate: does `vaddr` currently translate to a physical
    /// address inside the image?
    pub fn safe_seek(&self, vaddr: u64) -> bool {
        let mut inner = self.lock();
        match self.translate_locked(&mut inner, vaddr) {
            Ok(t) => t.paddr < inner.size,
            Err(_) => false,
        }
    }

    // ---- reads -----------------------------------------------------------

    /// Reads `buf.len()` bytes at `vaddr`, crossing page boundaries. On a
    /// translation failure or image end the error reports how much arrived;
    /// the prefix of `buf` holds the bytes read so far.
    pub fn read_atomic(&self, vaddr: u64, buf: &mut [u8]) -> Result<usize> {
        let wanted = buf.len();
        let mut inner = self.lock();
        let mut done = 0usize;
        while done < wanted {
            let v = vaddr + done as u64;
            let t = match self.translate_locked(&mut inner, v) {
                Ok(t) => t,
                Err(_) => {
                    return Err(InsightError::ShortRead {
                        addr: v,
                        got: done,
                        wanted,
                    })
                }
            };
            let page_remaining = (t.page_size - (v & (t.page_size - 1))) as usize;
            let chunk = page_remaining.min(wanted - done);
            match inner.read_phys(t.paddr, &mut buf[done..done + chunk]) {
                Ok(()) => done += chunk,
                Err(InsightError::ShortRead { got, .. }) => {
                    return Err(InsightError::ShortRead {
                        addr: v,
                        got: done + got,
                        wanted,
                    })
                }
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    /// Reads raw physical bytes without translation; returns the number of
    /// bytes available (short at the image end).
    pub fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.lock();
        if paddr >= inner.size {
            return Ok(0);
        }
        let avail = ((inner.size - paddr) as usize).min(buf.len());
        inner.source.seek(SeekFrom::Start(paddr))?;
        let mut done = 0;
        while done < avail {
            let n = inner.source.read(&mut buf[done..avail])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    pub fn read_u8(&self, vaddr: u64) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_atomic(vaddr, &mut b)?;
        Ok(b[0])
    }

    pub fn read_u16(&self, vaddr: u64) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_atomic(vaddr, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_u32(&self, vaddr: u64) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_atomic(vaddr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_u64(&self, vaddr: u64) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_atomic(vaddr, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn read_i8(&self, vaddr: u64) -> Result<i8> {
        Ok(self.read_u8(vaddr)? as i8)
    }

    pub fn read_i16(&self, vaddr: u64) -> Result<i16> {
        Ok(self.read_u16(vaddr)? as i16)
    }

    pub fn read_i32(&self, vaddr: u64) -> Result<i32> {
        Ok(self.read_u32(vaddr)? as i32)
    }

    pub fn read_i64(&self, vaddr: u64) -> Result<i64> {
        Ok(self.read_u64(vaddr)? as i64)
    }

    pub fn read_f32(&self, vaddr: u64) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32(vaddr)?))
    }

    pub fn read_f64(&self, vaddr: u64) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64(vaddr)?))
    }

    /// Reads a native-width pointer, widened to 64 bits.
    pub fn to_pointer(&self, vaddr: u64) -> Result<u64> {
        if self.specs.sizeof_pointer == 8 {
            self.read_u64(vaddr)
        } else {
            Ok(self.read_u32(vaddr)? as u64)
        }
    }

    /// Reads a NUL-terminated C string of at most `max` bytes.
    pub fn read_c_string(&self, vaddr: u64, max: usize) -> Result<String> {
        let mut out = Vec::new();
        let mut addr = vaddr;
        let mut chunk = [0u8; 64];
        while out.len() < max {
            let want = chunk.len().min(max - out.len());
            let got = match self.read_atomic(addr, &mut chunk[..want]) {
                Ok(n) => n,
                Err(InsightError::ShortRead { got, .. }) if got > 0 => got,
                Err(e) => return Err(e),
            };
            if let Some(nul) = chunk[..got].iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.extend_from_slice(&chunk[..got]);
            addr += got as u64;
            if got < want {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::translate::tests::{build_tables, FakePhys};
    use super::*;
    use crate::memspecs::tests::x86_64_specs;
    use std::io::Cursor;

    pub(crate) fn fake_vmem() -> VirtualMemory {
        let mut phys = FakePhys::new(0x10000);
        build_tables(&mut phys);
        // Some data behind the 4 KiB mapping at 0xffffc90000000000 -> 0x6000.
        phys.mem[0x6000..0x6006].copy_from_slice(b"hello\0");
        phys.mem[0x6100..0x6108].copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
        let mut specs = x86_64_specs();
        // Route everything through the page tables in tests.
        specs.start_kernel_map = 0xffff_fff0_0000_0000;
        specs.page_offset = 0xffff_8880_0000_0000;
        specs.vmalloc_start = 0xffff_c900_0000_0000;
        // PGD root at physical 0x1000.
        specs.init_level4_pgt = specs.start_kernel_map + 0x1000;
        VirtualMemory::new(specs, Box::new(Cursor::new(phys.mem)), 0).unwrap()
    }

    #[test]
    fn typed_reads_through_tables() {
        let vm = fake_vmem();
        let v = 0xffff_c900_0000_0100;
        assert_eq!(vm.read_u64(v).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(vm.read_u32(v).unwrap(), 0x5566_7788);
        assert_eq!(vm.to_pointer(v).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn safe_seek_matches_read() {
        let vm = fake_vmem();
        let mapped = 0xffff_c900_0000_0000u64;
        assert!(vm.safe_seek(mapped));
        let mut b = [0u8; 1];
        assert!(vm.read_atomic(mapped, &mut b).is_ok());
        assert!(!vm.safe_seek(0xffff_c900_0020_0000), "absent page");
    }

    #[test]
    fn short_read_across_absent_boundary() {
        let vm = fake_vmem();
        // The 4 KiB page ends at +0x1000; the next page is absent.
        let v = 0xffff_c900_0000_0ff8;
        let mut buf = [0u8; 16];
        match vm.read_atomic(v, &mut buf) {
            Err(InsightError::ShortRead { got, wanted, .. }) => {
                assert_eq!(got, 8);
                assert_eq!(wanted, 16);
            }
            other => panic!("expected short read, got {other:?}"),
        }
    }

    #[test]
    fn c_string_reads() {
        let vm = fake_vmem();
        let s = vm.read_c_string(0xffff_c900_0000_0000, 64).unwrap();
        assert_eq!(s, "hello");
    }

    #[test]
    fn linear_mapping_is_arithmetic() {
        let vm = fake_vmem();
        // Direct-map region translates without page tables.
        let t = vm.translate(0xffff_8880_0000_4321).unwrap();
        assert_eq!(t.paddr, 0x4321);
        assert!(t.flags.contains(PteFlags::NX));
    }

    #[test]
    fn cache_hit_equals_cold_walk() {
        let vm = fake_vmem();
        let v = 0xffff_c900_0000_0042;
        let cold = vm.translate(v).unwrap();
        let warm = vm.translate(v).unwrap();
        assert_eq!(cold, warm);
        vm.flush();
        assert_eq!(vm.translate(v).unwrap(), cold);
    }
}
