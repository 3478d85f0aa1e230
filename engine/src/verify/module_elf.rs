//! ELF object access for the page verifier.
//!
//! `xmas-elf` parses the headers; everything the verifier needs (section
//! table, symbols, RELA records) is copied into owned structures so the
//! raw bytes can be patched in place afterwards.

use std::fs;
use std::path::{Path, PathBuf};

use xmas_elf::header;
use xmas_elf::sections::{SectionData, ShType};
use xmas_elf::symbol_table::{Binding, Entry, Type as SymType};
use xmas_elf::ElfFile;

/// ELF symbol binding, mirrored so comparisons stay in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymBinding {
    Local,
    Global,
    Weak,
    Other,
}

impl SymBinding {
    fn from_elf(b: std::result::Result<Binding, &'static str>) -> SymBinding {
        match b {
            Ok(Binding::Local) => SymBinding::Local,
            Ok(Binding::Global) => SymBinding::Global,
            Ok(Binding::Weak) => SymBinding::Weak,
            _ => SymBinding::Other,
        }
    }
}

use crate::error::{InsightError, Result};

pub const SHN_UNDEF: u16 = 0;
pub const SHN_ABS: u16 = 0xfff1;
pub const SHN_COMMON: u16 = 0xfff2;

pub const SHF_ALLOC: u64 = 0x2;
pub const SHF_EXECINSTR: u64 = 0x4;

pub const R_X86_64_NONE: u32 = 0;
pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_PC32: u32 = 2;
pub const R_X86_64_32: u32 = 10;
pub const R_X86_64_32S: u32 = 11;

#[derive(Debug, Clone)]
pub struct SectionInfo {
    pub index: usize,
    pub name: String,
    /// Byte offset of the section contents within the file.
    pub offset: u64,
    pub size: u64,
    /// Link-time address (zero in relocatable objects).
    pub addr: u64,
    pub flags: u64,
    pub is_rela: bool,
    /// For RELA sections: the section the relocations apply to.
    pub info: u32,
}

#[derive(Debug, Clone)]
pub struct ElfSymbol {
    pub name: String,
    pub value: u64,
    pub shndx: u16,
    pub binding: SymBinding,
    pub is_func: bool,
    pub is_object: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RelaEntry {
    pub offset: u64,
    pub addend: i64,
    pub sym: usize,
    pub rtype: u32,
}

#[derive(Debug, Clone)]
pub struct RelaSection {
    /// Index of the section being relocated.
    pub target: usize,
    pub entries: Vec<RelaEntry>,
}

/// An ELF object with owned, patchable contents.
pub struct ObjectFile {
    pub bytes: Vec<u8>,
    pub sections: Vec<SectionInfo>,
    pub symbols: Vec<ElfSymbol>,
    pub relas: Vec<RelaSection>,
    pub is_relocatable: bool,
}

impl ObjectFile {
    pub fn open(path: &Path) -> Result<ObjectFile> {
        let bytes = fs::read(path)
            .map_err(|_| InsightError::FileNotFound(path.display().to_string()))?;
        Self::parse(bytes)
    }

    pub fn parse(bytes: Vec<u8>) -> Result<ObjectFile> {
        let mut sections = Vec::new();
        let mut symbols = Vec::new();
        let mut relas = Vec::new();
        let is_relocatable;
        {
            let elf = ElfFile::new(&bytes)
                .map_err(|e| InsightError::SymbolParse(format!("bad ELF object: {e}")))?;
            is_relocatable = matches!(
                elf.header.pt2.type_().as_type(),
                header::Type::Relocatable
            );

            for (index, sect) in elf.section_iter().enumerate() {
                let name = sect.get_name(&elf).unwrap_or("").to_owned();
                let sh_type = sect.get_type().unwrap_or(ShType::Null);
                sections.push(SectionInfo {
                    index,
                    name,
                    offset: sect.offset(),
                    size: sect.size(),
                    addr: sect.address(),
                    flags: sect.flags(),
                    is_rela: matches!(sh_type, ShType::Rela),
                    info: sect.info(),
                });
                match sect.get_data(&elf) {
                    Ok(SectionData::SymbolTable64(entries)) => {
                        for e in entries {
                            symbols.push(ElfSymbol {
                                name: e.get_name(&elf).unwrap_or("").to_owned(),
                                value: e.value(),
                                shndx: e.shndx(),
                                binding: SymBinding::from_elf(e.get_binding()),
                                is_func: matches!(e.get_type(), Ok(SymType::Func)),
                                is_object: matches!(e.get_type(), Ok(SymType::Object)),
                            });
                        }
                    }
                    Ok(SectionData::Rela64(entries)) => {
                        relas.push(RelaSection {
                            target: sect.info() as usize,
                            entries: entries
                                .iter()
                                .map(|r| RelaEntry {
                                    offset: r.get_offset(),
                                    addend: r.get_addend() as i64,
                                    sym: r.get_symbol_table_index() as usize,
                                    rtype: r.get_type(),
                                })
                                .collect(),
                        });
                    }
                    _ => {}
                }
            }
        }
        Ok(ObjectFile {
            bytes,
            sections,
            symbols,
            relas,
            is_relocatable,
        })
    }

    pub fn section_by_name(&self, name: &str) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section(&self, index: usize) -> Option<&SectionInfo> {
        self.sections.get(index)
    }

    pub fn section_bytes(&self, s: &SectionInfo) -> &[u8] {
        let start = s.offset as usize;
        let end = (s.offset + s.size) as usize;
        self.bytes.get(start..end).unwrap_or(&[])
    }

    /// Executable sections that follow `.text` in the reconstructed image.
    pub fn extra_exec_sections(&self) -> impl Iterator<Item = &SectionInfo> {
        self.sections.iter().filter(|s| {
            s.flags == (SHF_ALLOC | SHF_EXECINSTR)
                && s.name != ".text"
                && s.name != ".init.text"
        })
    }

    // ---- raw accessors over file offsets ---------------------------------

    pub fn read_u64_at(&self, off: u64) -> Option<u64> {
        let o = off as usize;
        self.bytes
            .get(o..o + 8)
            .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u32_at(&self, off: u64) -> Option<u32> {
        let o = off as usize;
        self.bytes
            .get(o..o + 4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_i32_at(&self, off: u64) -> Option<i32> {
        self.read_u32_at(off).map(|v| v as i32)
    }

    pub fn read_u16_at(&self, off: u64) -> Option<u16> {
        let o = off as usize;
        self.bytes
            .get(o..o + 2)
            .map(|b| u16::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u8_at(&self, off: u64) -> Option<u8> {
        self.bytes.get(off as usize).copied()
    }

    pub fn write_u64_at(&mut self, off: u64, v: u64) -> bool {
        let o = off as usize;
        match self.bytes.get_mut(o..o + 8) {
            Some(b) => {
                b.copy_from_slice(&v.to_le_bytes());
                true
            }
            None => false,
        }
    }

    pub fn write_u32_at(&mut self, off: u64, v: u32) -> bool {
        let o = off as usize;
        match self.bytes.get_mut(o..o + 4) {
            Some(b) => {
                b.copy_from_slice(&v.to_le_bytes());
                true
            }
            None => false,
        }
    }

    pub fn write_u8_at(&mut self, off: u64, v: u8) -> bool {
        match self.bytes.get_mut(off as usize) {
            Some(b) => {
                *b = v;
                true
            }
            None => false,
        }
    }

    pub fn write_bytes_at(&mut self, off: u64, data: &[u8]) -> bool {
        let o = off as usize;
        match self.bytes.get_mut(o..o + data.len()) {
            Some(b) => {
                b.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Module names this object declares as dependencies in `.modinfo`.
    pub fn modinfo_depends(&self) -> Vec<String> {
        let Some(sec) = self.section_by_name(".modinfo") else {
            return Vec::new();
        };
        for item in self.section_bytes(sec).split(|&b| b == 0) {
            if let Ok(text) = std::str::from_utf8(item) {
                if let Some(list) = text.strip_prefix("depends=") {
                    return list
                        .split(',')
                        .filter(|d| !d.is_empty())
                        .map(str::to_owned)
                        .collect();
                }
            }
        }
        Vec::new()
    }
}

/// Normalizes a module name the way the kernel does: dashes become
/// underscores.
pub fn normalize_module_name(name: &str) -> String {
    name.replace('-', "_")
}

/// Locates `<name>.ko` below `dir`, tolerating `-`/`_` substitution.
pub fn find_module_file(dir: &Path, name: &str) -> Option<PathBuf> {
    let want = normalize_module_name(name);
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        let entries = match fs::read_dir(&d) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("ko") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if normalize_module_name(stem) == want {
                    return Some(path);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_name_normalization() {
        assert_eq!(normalize_module_name("snd-pcm"), "snd_pcm");
        assert_eq!(normalize_module_name("e1000"), "e1000");
    }

    #[test]
    fn find_module_tolerates_dash_underscore() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("kernel/sound");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("snd_pcm.ko"), b"x").unwrap();
        let hit = find_module_file(dir.path(), "snd-pcm").unwrap();
        assert!(hit.ends_with("snd_pcm.ko"));
        assert!(find_module_file(dir.path(), "missing").is_none());
    }
}
