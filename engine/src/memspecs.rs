//! Architecture constants of the analyzed kernel build.
//!
//! A `MemSpecs` value is produced by the external probe helper (which
//! compiles a small program against the kernel headers and prints the
//! constants); the engine only deserializes its JSON output and attaches the
//! `System.map` symbol table. The runtime fields `high_memory` and
//! `vmalloc_earlyreserve` stay zero until a memory dump is opened.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{InsightError, Result};
use crate::systemmap::SystemMap;

/// Fallback for `high_memory` on 64-bit guests whose symbols do not carry
/// the variable: the end of the direct mapping.
pub const HIGH_MEMORY_FAILSAFE_X86_64: u64 = 0xffff_c7ff_ffff_ffff;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Arch: u32 {
        const I386 = 1 << 0;
        const X86_64 = 1 << 1;
        const PAE = 1 << 2;
    }
}

impl Serialize for Arch {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        let name = if self.contains(Arch::X86_64) {
            "x86_64"
        } else if self.contains(Arch::PAE) {
            "i386_pae"
        } else {
            "i386"
        };
        s.serialize_str(name)
    }
}

impl<'de> Deserialize<'de> for Arch {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        match s.as_str() {
            "x86_64" => Ok(Arch::X86_64),
            "i386" => Ok(Arch::I386),
            "i386_pae" | "pae" => Ok(Arch::I386 | Arch::PAE),
            other => Err(serde::de::Error::custom(format!("unknown arch \"{other}\""))),
        }
    }
}

/// Kernel identification strings, cross-checked against the live
/// `init_uts_ns` of a dump on first use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelVersion {
    #[serde(default)]
    pub sysname: String,
    #[serde(default)]
    pub release: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub machine: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemSpecs {
    pub arch: Arch,
    pub sizeof_pointer: u32,
    pub sizeof_long: u32,
    pub page_offset: u64,
    pub vmalloc_start: u64,
    pub vmalloc_end: u64,
    #[serde(default)]
    pub vmemmap_start: u64,
    #[serde(default)]
    pub vmemmap_end: u64,
    #[serde(default)]
    pub modules_vaddr: u64,
    #[serde(default)]
    pub modules_end: u64,
    #[serde(default)]
    pub start_kernel_map: u64,
    /// Page-global-directory root symbol: `init_level4_pgt` on x86-64.
    #[serde(default)]
    pub init_level4_pgt: u64,
    /// Page-directory root symbol: `swapper_pg_dir` on i386.
    #[serde(default)]
    pub swapper_pg_dir: u64,
    /// Read at runtime from the dump; zero until then.
    #[serde(default)]
    pub high_memory: u64,
    /// Read at runtime from the dump on i386 kernels that export it.
    #[serde(default)]
    pub vmalloc_earlyreserve: u64,
    #[serde(default)]
    pub version: KernelVersion,
    #[serde(skip)]
    pub system_map: SystemMap,
}

impl MemSpecs {
    /// Loads the probe helper's JSON output.
    pub fn load_json(path: &Path) -> Result<MemSpecs> {
        let file = File::open(path)
            .map_err(|_| InsightError::FileNotFound(path.display().to_string()))?;
        let specs: MemSpecs = serde_json::from_reader(BufReader::new(file))?;
        specs.validate()?;
        Ok(specs)
    }

    fn validate(&self) -> Result<()> {
        if self.sizeof_pointer != 4 && self.sizeof_pointer != 8 {
            return Err(InsightError::MemSpecsUnresolved(format!(
                "sizeof_pointer is {}, expected 4 or 8",
                self.sizeof_pointer
            )));
        }
        // The PGD root symbols may be absent here; they arrive with the
        // System.map (attach_system_map enforces them).
        Ok(())
    }

    /// Attaches the parsed `System.map` and captures the page-directory
    /// root symbols from it.
    pub fn attach_system_map(&mut self, map: SystemMap) -> Result<()> {
        if let Some(addr) = map.address_of("init_level4_pgt") {
            self.init_level4_pgt = addr;
        }
        if let Some(addr) = map.address_of("swapper_pg_dir") {
            self.swapper_pg_dir = addr;
        }
        if self.arch.contains(Arch::X86_64) && self.init_level4_pgt == 0 {
            return Err(InsightError::MemSpecsUnresolved(
                "System.map does not contain \"init_level4_pgt\"".into(),
            ));
        }
        if self.arch.contains(Arch::I386) && self.swapper_pg_dir == 0 {
            return Err(InsightError::MemSpecsUnresolved(
                "System.map does not contain \"swapper_pg_dir\"".into(),
            ));
        }
        self.system_map = map;
        Ok(())
    }

    /// Physical address of the active kernel page-directory root.
    pub fn pgd_root(&self) -> u64 {
        let virt = if self.arch.contains(Arch::X86_64) {
            self.init_level4_pgt
        } else {
            self.swapper_pg_dir
        };
        self.kernel_virt_to_phys(virt)
    }

    /// Static translation for addresses inside the kernel mapping; used to
    /// locate the page tables themselves.
    pub fn kernel_virt_to_phys(&self, vaddr: u64) -> u64 {
        if self.start_kernel_map != 0 && vaddr >= self.start_kernel_map {
            vaddr - self.start_kernel_map
        } else if vaddr >= self.page_offset {
            vaddr - self.page_offset
        } else {
            vaddr
        }
    }

    /// Last byte of the guest's virtual address space.
    pub fn vaddr_space_end(&self) -> u64 {
        if self.arch.contains(Arch::X86_64) {
            u64::MAX
        } else {
            u32::MAX as u64
        }
    }

    pub fn is_64bit(&self) -> bool {
        self.arch.contains(Arch::X86_64)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn x86_64_specs() -> MemSpecs {
        MemSpecs {
            arch: Arch::X86_64,
            sizeof_pointer: 8,
            sizeof_long: 8,
            page_offset: 0xffff_8800_0000_0000,
            vmalloc_start: 0xffff_c900_0000_0000,
            vmalloc_end: 0xffff_e8ff_ffff_ffff,
            vmemmap_start: 0xffff_ea00_0000_0000,
            vmemmap_end: 0xffff_eaff_ffff_ffff,
            modules_vaddr: 0xffff_ffff_a000_0000,
            modules_end: 0xffff_ffff_ff00_0000,
            start_kernel_map: 0xffff_ffff_8000_0000,
            init_level4_pgt: 0xffff_ffff_8160_b000,
            swapper_pg_dir: 0,
            high_memory: 0,
            vmalloc_earlyreserve: 0,
            version: KernelVersion::default(),
            system_map: SystemMap::default(),
        }
    }

    #[test]
    fn json_round_trip() {
        let specs = x86_64_specs();
        let text = serde_json::to_string(&specs).unwrap();
        let back: MemSpecs = serde_json::from_str(&text).unwrap();
        assert_eq!(back.arch, Arch::X86_64);
        assert_eq!(back.page_offset, specs.page_offset);
        assert_eq!(back.init_level4_pgt, specs.init_level4_pgt);
    }

    #[test]
    fn pgd_root_is_physical() {
        let specs = x86_64_specs();
        assert_eq!(specs.pgd_root(), 0x160_b000);
    }
}
