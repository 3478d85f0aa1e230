//! Serialization of the symbol graph to the versioned container format.
//!
//! Record order follows assembly order: MemSpecs, System.map, type count,
//! types in ascending id order, variables, then alternative-type lists
//! (which need both types and variables resolvable). Reading is the strict
//! inverse; symbol files written before guard expressions existed (minor
//! version 0) load with trivially true guards.

use std::io::{Read, Write};

use crate::codec::{Payload, PayloadWriter, RecordKind, RecordReader, RecordWriter};
use crate::error::{InsightError, Result};
use crate::memspecs::{Arch, KernelVersion, MemSpecs};
use crate::systemmap::{SystemMap, SystemMapEntry};

use super::alt::{AltRefType, GuardExpr, GuardOp};
use super::basetype::{BaseType, TypeKind, Variable};
use super::factory::{FinalizeReason, SymbolFactory};
use super::realtype::RealType;
use super::typeinfo::{MemberRecord, TypeInfo, TypeRecord};

pub fn write<W: Write>(specs: &MemSpecs, factory: &SymbolFactory, out: W) -> Result<()> {
    let mut w = RecordWriter::new(out)?;

    w.record(RecordKind::MemSpecs, |p| {
        write_memspecs(p, specs);
        Ok(())
    })?;
    w.record(RecordKind::SystemMap, |p| {
        write_system_map(p, &specs.system_map);
        Ok(())
    })?;
    w.record(RecordKind::TypeCount, |p| {
        p.u32(factory.type_count() as u32);
        Ok(())
    })?;
    for id in factory.sorted_type_ids() {
        let Some(bt) = factory.find_base_type_by_id(id) else {
            continue;
        };
        w.record(RecordKind::BaseType, |p| {
            write_base_type(p, bt);
            Ok(())
        })?;
    }
    w.record(RecordKind::VariableCount, |p| {
        p.u32(factory.var_count() as u32);
        Ok(())
    })?;
    for id in factory.sorted_var_ids() {
        let Some(var) = factory.find_var_by_id(id) else {
            continue;
        };
        w.record(RecordKind::Variable, |p| {
            p.i32(var.id);
            p.str(&var.name);
            p.u64(var.address);
            p.i32(var.ref_type_id);
            p.i32(var.src_line);
            Ok(())
        })?;
    }
    // Alternative-type lists, one record per non-empty owner.
    for id in factory.sorted_var_ids() {
        let Some(var) = factory.find_var_by_id(id) else {
            continue;
        };
        if !var.alt_ref_types.is_empty() {
            w.record(RecordKind::AltTypes, |p| {
                p.u8(ALT_OWNER_VARIABLE);
                p.i32(var.id);
                write_alt_list(p, &var.alt_ref_types);
                Ok(())
            })?;
        }
    }
    for id in factory.sorted_type_ids() {
        let Some(bt) = factory.find_base_type_by_id(id) else {
            continue;
        };
        match &bt.kind {
            TypeKind::Pointer(ptr) if !ptr.alt_ref_types.is_empty() => {
                w.record(RecordKind::AltTypes, |p| {
                    p.u8(ALT_OWNER_POINTER);
                    p.i32(bt.id);
                    write_alt_list(p, &ptr.alt_ref_types);
                    Ok(())
                })?;
            }
            TypeKind::Struct(s) | TypeKind::Union(s) => {
                for (idx, m) in s.members.iter().enumerate() {
                    if !m.alt_ref_types.is_empty() {
                        w.record(RecordKind::AltTypes, |p| {
                            p.u8(ALT_OWNER_MEMBER);
                            p.i32(bt.id);
                            p.u16(idx as u16);
                            write_alt_list(p, &m.alt_ref_types);
                            Ok(())
                        })?;
                    }
                }
            }
            _ => {}
        }
    }
    w.finish()
}

pub fn read<R: Read>(input: R) -> Result<(MemSpecs, SymbolFactory)> {
    let mut r = RecordReader::new(input)?;
    let minor = r.minor;
    let mut specs: Option<MemSpecs> = None;
    let mut factory = SymbolFactory::new();
    let mut expected_types = 0u32;
    let mut expected_vars = 0u32;
    let mut seen_types = 0u32;
    let mut seen_vars = 0u32;

    while let Some((kind, mut p)) = r.next_record()? {
        match kind {
            RecordKind::MemSpecs => specs = Some(read_memspecs(&mut p)?),
            RecordKind::SystemMap => {
                let map = read_system_map(&mut p)?;
                if let Some(specs) = specs.as_mut() {
                    specs.system_map = map;
                }
            }
            RecordKind::TypeCount => expected_types = p.u32()?,
            RecordKind::BaseType => {
                factory.insert_type(read_base_type(&mut p)?);
                seen_types += 1;
            }
            RecordKind::VariableCount => expected_vars = p.u32()?,
            RecordKind::Variable => {
                factory.insert_variable(Variable {
                    id: p.i32()?,
                    name: p.str()?,
                    address: p.u64()?,
                    ref_type_id: p.i32()?,
                    src_line: p.i32()?,
                    alt_ref_types: Vec::new(),
                });
                seen_vars += 1;
            }
            RecordKind::AltTypes => read_alt_record(&mut p, &mut factory, minor)?,
            RecordKind::End => break,
        }
    }

    if seen_types != expected_types || seen_vars != expected_vars {
        return Err(InsightError::SymbolParse(format!(
            "record count mismatch: {seen_types}/{expected_types} types, \
             {seen_vars}/{expected_vars} variables"
        )));
    }
    let specs = specs.ok_or_else(|| {
        InsightError::SymbolParse("symbol file carries no MemSpecs record".into())
    })?;
    factory.finalize(FinalizeReason::Loading)?;
    Ok((specs, factory))
}

// ---- MemSpecs ------------------------------------------------------------

fn write_memspecs(p: &mut PayloadWriter, specs: &MemSpecs) {
    p.u32(specs.arch.bits());
    p.u32(specs.sizeof_pointer);
    p.u32(specs.sizeof_long);
    p.u64(specs.page_offset);
    p.u64(specs.vmalloc_start);
    p.u64(specs.vmalloc_end);
    p.u64(specs.vmemmap_start);
    p.u64(specs.vmemmap_end);
    p.u64(specs.modules_vaddr);
    p.u64(specs.modules_end);
    p.u64(specs.start_kernel_map);
    p.u64(specs.init_level4_pgt);
    p.u64(specs.swapper_pg_dir);
    p.str(&specs.version.sysname);
    p.str(&specs.version.release);
    p.str(&specs.version.version);
    p.str(&specs.version.machine);
}

fn read_memspecs(p: &mut Payload) -> Result<MemSpecs> {
    let arch = Arch::from_bits(p.u32()?)
        .ok_or_else(|| InsightError::SymbolParse("unknown architecture bits".into()))?;
    Ok(MemSpecs {
        arch,
        sizeof_pointer: p.u32()?,
        sizeof_long: p.u32()?,
        page_offset: p.u64()?,
        vmalloc_start: p.u64()?,
        vmalloc_end: p.u64()?,
        vmemmap_start: p.u64()?,
        vmemmap_end: p.u64()?,
        modules_vaddr: p.u64()?,
        modules_end: p.u64()?,
        start_kernel_map: p.u64()?,
        init_level4_pgt: p.u64()?,
        swapper_pg_dir: p.u64()?,
        high_memory: 0,
        vmalloc_earlyreserve: 0,
        version: KernelVersion {
            sysname: p.str()?,
            release: p.str()?,
            version: p.str()?,
            machine: p.str()?,
        },
        system_map: SystemMap::default(),
    })
}

fn write_system_map(p: &mut PayloadWriter, map: &SystemMap) {
    p.u32(map.len() as u32);
    for (name, entry) in map.iter() {
        p.str(name);
        p.u64(entry.address);
        p.u8(entry.kind);
    }
}

fn read_system_map(p: &mut Payload) -> Result<SystemMap> {
    let count = p.u32()?;
    let mut map = SystemMap::default();
    for _ in 0..count {
        let name = p.str()?;
        let address = p.u64()?;
        let kind = p.u8()?;
        map.insert(name, SystemMapEntry { address, kind });
    }
    Ok(map)
}

// ---- types ---------------------------------------------------------------

fn write_base_type(p: &mut PayloadWriter, bt: &BaseType) {
    p.i32(bt.id);
    p.u8(bt.real_type().into());
    p.opt_str(bt.name.as_deref());
    p.u32(bt.size);
    p.i32(bt.src_line);
    match &bt.kind {
        TypeKind::Numeric(_) => {}
        TypeKind::Lexical(_, r) => p.i32(r.ref_type_id),
        TypeKind::Pointer(ptr) => {
            p.i32(ptr.ref_type_id);
            p.i64(ptr.macro_extra_offset);
        }
        TypeKind::Array(a) => {
            p.i32(a.ref_type_id);
            p.i64(a.length);
        }
        TypeKind::Enum(e) => {
            p.u32(e.values.len() as u32);
            for (name, value) in &e.values {
                p.str(name);
                p.i64(*value);
            }
        }
        TypeKind::Struct(s) | TypeKind::Union(s) => {
            p.u32(s.members.len() as u32);
            for m in &s.members {
                p.str(&m.name);
                p.u32(m.offset);
                p.u8(m.bit_size as u8);
                p.u8(m.bit_offset as u8);
                p.i32(m.ref_type_id);
            }
        }
        TypeKind::Function(f) | TypeKind::FuncPointer(f) => {
            p.i32(f.ref_type_id);
            p.u64(f.pc_low);
            p.u64(f.pc_high);
            p.u32(f.params.len() as u32);
            for (name, id) in &f.params {
                p.str(name);
                p.i32(*id);
            }
        }
    }
}

fn read_base_type(p: &mut Payload) -> Result<BaseType> {
    let id = p.i32()?;
    let tag = p.u8()?;
    let kind = RealType::try_from(tag)
        .map_err(|_| InsightError::SymbolParse(format!("unknown type kind tag {tag}")))?;
    let name = p.opt_str()?;
    let size = p.u32()?;
    let src_line = p.i32()?;

    // Rebuild through the factory's own record path so feed-time policies
    // (e.g. the long-double coercion) apply uniformly.
    let mut rec = TypeRecord::plain(id, kind, name.as_deref(), size);
    rec.src_line = src_line;
    match kind {
        RealType::Const | RealType::Volatile | RealType::Typedef => {
            rec.ref_type_id = p.i32()?;
        }
        RealType::Pointer => {
            rec.ref_type_id = p.i32()?;
            let macro_extra_offset = p.i64()?;
            let mut bt = record_to_type(rec)?;
            if let TypeKind::Pointer(ptr) = &mut bt.kind {
                ptr.macro_extra_offset = macro_extra_offset;
            }
            return Ok(bt);
        }
        RealType::Array => {
            rec.ref_type_id = p.i32()?;
            rec.array_length = p.i64()?;
        }
        RealType::Enum => {
            let count = p.u32()?;
            for _ in 0..count {
                let name = p.str()?;
                let value = p.i64()?;
                rec.enum_values.push((name, value));
            }
        }
        RealType::Struct | RealType::Union => {
            let count = p.u32()?;
            for _ in 0..count {
                rec.members.push(MemberRecord {
                    name: p.str()?,
                    offset: p.u32()?,
                    bit_size: p.u8()? as i8,
                    bit_offset: p.u8()? as i8,
                    ref_type_id: p.i32()?,
                });
            }
        }
        RealType::Function | RealType::FuncPointer => {
            rec.ref_type_id = p.i32()?;
            rec.pc_low = p.u64()?;
            rec.pc_high = p.u64()?;
            let count = p.u32()?;
            for _ in 0..count {
                let name = p.str()?;
                let id = p.i32()?;
                rec.params.push((name, id));
            }
        }
        _ => {}
    }
    record_to_type(rec)
}

/// Runs one record through a scratch factory to reuse the feed-time
/// construction rules.
fn record_to_type(rec: TypeRecord) -> Result<BaseType> {
    let mut scratch = SymbolFactory::new();
    let id = rec.id;
    scratch.feed(TypeInfo::Type(rec))?;
    scratch
        .take_type(id)
        .ok_or_else(|| InsightError::SymbolParse(format!("could not rebuild type id {id}")))
}

// ---- alternative types ---------------------------------------------------

const ALT_OWNER_VARIABLE: u8 = 0;
const ALT_OWNER_POINTER: u8 = 1;
const ALT_OWNER_MEMBER: u8 = 2;

fn write_alt_list(p: &mut PayloadWriter, alts: &[AltRefType]) {
    p.u32(alts.len() as u32);
    for alt in alts {
        p.i32(alt.ref_type_id);
        write_guard(p, &alt.guard);
    }
}

fn read_alt_list(p: &mut Payload, minor: u16) -> Result<Vec<AltRefType>> {
    let count = p.u32()?;
    let mut alts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let ref_type_id = p.i32()?;
        // Minor version 0 carried ids only; such candidates always apply.
        let guard = if minor >= 1 {
            read_guard(p)?
        } else {
            GuardExpr::Constant(1)
        };
        alts.push(AltRefType::new(ref_type_id, guard));
    }
    Ok(alts)
}

fn read_alt_record(p: &mut Payload, factory: &mut SymbolFactory, minor: u16) -> Result<()> {
    let owner = p.u8()?;
    match owner {
        ALT_OWNER_VARIABLE => {
            let id = p.i32()?;
            let alts = read_alt_list(p, minor)?;
            factory.attach_var_alts(id, alts)
        }
        ALT_OWNER_POINTER => {
            let id = p.i32()?;
            let alts = read_alt_list(p, minor)?;
            factory.attach_pointer_alts(id, alts)
        }
        ALT_OWNER_MEMBER => {
            let id = p.i32()?;
            let member = p.u16()? as usize;
            let alts = read_alt_list(p, minor)?;
            factory.attach_member_alts(id, member, alts)
        }
        other => Err(InsightError::SymbolParse(format!(
            "unknown alternative-type owner tag {other}"
        ))),
    }
}

const GUARD_CONSTANT: u8 = 0;
const GUARD_RUNTIME: u8 = 1;
const GUARD_GLOBAL: u8 = 2;
const GUARD_CHAIN: u8 = 3;
const GUARD_NOT: u8 = 4;
const GUARD_BINARY: u8 = 5;

fn write_guard(p: &mut PayloadWriter, g: &GuardExpr) {
    match g {
        GuardExpr::Constant(v) => {
            p.u8(GUARD_CONSTANT);
            p.i64(*v);
        }
        GuardExpr::RuntimeDependent => p.u8(GUARD_RUNTIME),
        GuardExpr::GlobalAddress(name) => {
            p.u8(GUARD_GLOBAL);
            p.str(name);
        }
        GuardExpr::MemberChain(chain) => {
            p.u8(GUARD_CHAIN);
            p.u16(chain.len() as u16);
            for c in chain {
                p.str(c);
            }
        }
        GuardExpr::Not(e) => {
            p.u8(GUARD_NOT);
            write_guard(p, e);
        }
        GuardExpr::Binary(op, l, r) => {
            p.u8(GUARD_BINARY);
            p.u8((*op).into());
            write_guard(p, l);
            write_guard(p, r);
        }
    }
}

fn read_guard(p: &mut Payload) -> Result<GuardExpr> {
    match p.u8()? {
        GUARD_CONSTANT => Ok(GuardExpr::Constant(p.i64()?)),
        GUARD_RUNTIME => Ok(GuardExpr::RuntimeDependent),
        GUARD_GLOBAL => Ok(GuardExpr::GlobalAddress(p.str()?)),
        GUARD_CHAIN => {
            let count = p.u16()? as usize;
            let mut chain = Vec::with_capacity(count);
            for _ in 0..count {
                chain.push(p.str()?);
            }
            Ok(GuardExpr::MemberChain(chain))
        }
        GUARD_NOT => Ok(GuardExpr::Not(Box::new(read_guard(p)?))),
        GUARD_BINARY => {
            let op = GuardOp::try_from(p.u8()?)
                .map_err(|_| InsightError::SymbolParse("unknown guard operator".into()))?;
            let l = read_guard(p)?;
            let r = read_guard(p)?;
            Ok(GuardExpr::Binary(op, Box::new(l), Box::new(r)))
        }
        other => Err(InsightError::SymbolParse(format!(
            "unknown guard expression tag {other}"
        ))),
    }
}
