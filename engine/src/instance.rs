//! Typed, addressed, lazily-read views of kernel objects.
//!
//! An `Instance` pairs a virtual address with a type and a navigation
//! context. It never owns the memory it points into; all reads go through
//! the dump's `VirtualMemory`. Navigation failures produce null or invalid
//! instances rather than errors, so chained member walks degrade quietly
//! the way interactive inspection wants.

use bitflags::bitflags;

use crate::symbols::basetype::{BaseType, StructuredMember, TypeKind, Variable};
use crate::symbols::{GuardContext, RealType, RealTypeSet, SymbolFactory, TypeId};
use crate::vmem::VirtualMemory;

bitflags! {
    /// Which knowledge may flow into member resolution.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KnowledgeSources: u8 {
        /// Alternative types registered by the source oracle.
        const ALT_TYPES = 1 << 0;
        /// External rule engines layered on top of the engine.
        const RULE_ENGINE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Variable,
    Member,
    ArrayElem,
    Dereference,
    Candidate,
    RuleEngine,
    MemMapNode,
    External,
}

impl Origin {
    pub fn name(self) -> &'static str {
        match self {
            Origin::Variable => "variable",
            Origin::Member => "member",
            Origin::ArrayElem => "array element",
            Origin::Dereference => "dereference",
            Origin::Candidate => "candidate",
            Origin::RuleEngine => "rule engine",
            Origin::MemMapNode => "memory map node",
            Origin::External => "external",
        }
    }
}

#[derive(Clone)]
pub struct Instance<'a> {
    address: u64,
    ty: Option<&'a BaseType>,
    name: String,
    parent_names: Vec<String>,
    vmem: Option<&'a VirtualMemory>,
    factory: &'a SymbolFactory,
    id: i32,
    origin: Origin,
    ambiguous: bool,
    bit_size: i8,
    bit_offset: i8,
}

impl<'a> Instance<'a> {
    pub fn new(
        factory: &'a SymbolFactory,
        vmem: &'a VirtualMemory,
        address: u64,
        ty: &'a BaseType,
        name: impl Into<String>,
        parent_names: Vec<String>,
        id: i32,
        origin: Origin,
    ) -> Instance<'a> {
        Instance {
            address,
            ty: Some(ty),
            name: name.into(),
            parent_names,
            vmem: Some(vmem),
            factory,
            id,
            origin,
            ambiguous: false,
            bit_size: -1,
            bit_offset: -1,
        }
    }

    /// The invalid instance: no type, no memory.
    pub fn invalid(factory: &'a SymbolFactory) -> Instance<'a> {
        Instance {
            address: 0,
            ty: None,
            name: String::new(),
            parent_names: Vec::new(),
            vmem: None,
            factory,
            id: -1,
            origin: Origin::External,
            ambiguous: false,
            bit_size: -1,
            bit_offset: -1,
        }
    }

    /// Instance of a global variable, lexically resolved; candidate types
    /// on the variable are consulted when `sources` allows.
    pub fn of_variable(
        factory: &'a SymbolFactory,
        vmem: &'a VirtualMemory,
        var: &'a Variable,
        sources: KnowledgeSources,
    ) -> Instance<'a> {
        let ty = match factory.find_base_type_by_id(var.ref_type_id) {
            Some(t) => factory.dereferenced_type(t, RealTypeSet::TR_LEXICAL),
            None => return Instance::invalid(factory),
        };
        let mut inst = Instance::new(
            factory,
            vmem,
            var.address,
            ty,
            var.name.clone(),
            Vec::new(),
            var.id,
            Origin::Variable,
        );
        if sources.contains(KnowledgeSources::ALT_TYPES) && !var.alt_ref_types.is_empty() {
            let ctx = inst.clone();
            inst.apply_candidates(&var.alt_ref_types.iter().collect::<Vec<_>>(), &ctx);
        }
        inst
    }

    /// The k-th registered candidate of a variable, bypassing guards.
    pub fn of_variable_candidate(
        factory: &'a SymbolFactory,
        vmem: &'a VirtualMemory,
        var: &'a Variable,
        index: usize,
    ) -> Instance<'a> {
        match var
            .alt_ref_types
            .get(index)
            .and_then(|alt| factory.find_base_type_by_id(alt.ref_type_id))
        {
            Some(ty) => {
                let mut inst = Instance::new(
                    factory,
                    vmem,
                    var.address,
                    ty,
                    var.name.clone(),
                    Vec::new(),
                    var.id,
                    Origin::Candidate,
                );
                inst.bit_size = -1;
                inst
            }
            None => Instance::invalid(factory),
        }
    }

    // ---- accessors -------------------------------------------------------

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn set_address(&mut self, address: u64) {
        self.address = address;
    }

    pub fn add_to_address(&mut self, delta: i64) {
        self.address = self.address.wrapping_add(delta as u64);
    }

    pub fn ty(&self) -> Option<&'a BaseType> {
        self.ty
    }

    pub fn type_id(&self) -> TypeId {
        self.ty.map(|t| t.id).unwrap_or(0)
    }

    pub fn type_name(&self) -> String {
        match self.ty {
            Some(t) => self.factory.pretty_name(t),
            None => "<unknown>".into(),
        }
    }

    pub fn factory(&self) -> &'a SymbolFactory {
        self.factory
    }

    pub fn vmem(&self) -> Option<&'a VirtualMemory> {
        self.vmem
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn set_origin(&mut self, origin: Origin) {
        self.origin = origin;
    }

    /// More than one candidate guard held; the caller decides.
    pub fn is_ambiguous(&self) -> bool {
        self.ambiguous
    }

    pub fn bit_size(&self) -> i8 {
        self.bit_size
    }

    pub fn bit_offset(&self) -> i8 {
        self.bit_offset
    }

    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    pub fn is_valid(&self) -> bool {
        self.ty.is_some()
    }

    /// Does the address currently translate?
    pub fn is_accessible(&self) -> bool {
        match self.vmem {
            Some(vmem) => self.address != 0 && vmem.safe_seek(self.address),
            None => false,
        }
    }

    /// Size in bytes of the viewed type.
    pub fn size(&self) -> u64 {
        self.ty.map(|t| self.factory.type_size(t) as u64).unwrap_or(0)
    }

    /// Last byte covered by this object.
    pub fn end_address(&self) -> u64 {
        let size = self.size();
        if size > 0 {
            self.address.saturating_add(size - 1)
        } else {
            self.address
        }
    }

    pub fn parent_name_components(&self) -> &[String] {
        &self.parent_names
    }

    pub fn set_parent_name_components(&mut self, names: Vec<String>) {
        self.parent_names = names;
    }

    pub fn full_name_components(&self) -> Vec<String> {
        let mut all = self.parent_names.clone();
        if !self.name.is_empty() {
            all.push(self.name.clone());
        }
        all
    }

    /// Dotted path; array suffixes glue to their parent component.
    pub fn full_name(&self) -> String {
        self.full_name_components().join(".").replace(".[", "[")
    }

    // ---- navigation ------------------------------------------------------

    /// Rebinds the type, keeping the address.
    pub fn change_type(&mut self, ty: &'a BaseType) {
        self.ty = Some(ty);
        self.bit_size = -1;
        self.bit_offset = -1;
    }

    pub fn change_type_by_name(&mut self, name: &str) -> bool {
        match self.factory.find_base_type_by_name(name) {
            Some(ty) => {
                self.change_type(ty);
                true
            }
            None => false,
        }
    }

    pub fn change_type_by_id(&mut self, id: TypeId) -> bool {
        match self.factory.find_base_type_by_id(id) {
            Some(ty) => {
                self.change_type(ty);
                true
            }
            None => false,
        }
    }

    /// Looks up a member by name, recursing into anonymous inner structs
    /// and unions per C rules, and applies candidate resolution when
    /// `sources` permits. `resolve` is applied to the resulting type.
    pub fn member(
        &self,
        name: &str,
        resolve: RealTypeSet,
        sources: KnowledgeSources,
    ) -> Instance<'a> {
        let Some((offset, member)) = self.find_member(name) else {
            return Instance::invalid(self.factory);
        };
        let mut inst = self.member_instance(offset, member);
        if sources.contains(KnowledgeSources::ALT_TYPES) && !member.alt_ref_types.is_empty() {
            inst.apply_candidates(&member.alt_ref_types.iter().collect::<Vec<_>>(), self);
        }
        if !resolve.is_empty() {
            inst = inst.dereference(resolve);
        }
        inst
    }

    /// The i-th declared member of a struct or union.
    pub fn member_at(&self, index: usize, resolve: RealTypeSet) -> Instance<'a> {
        let Some(s) = self.structured() else {
            return Instance::invalid(self.factory);
        };
        let Some(member) = s.members.get(index) else {
            return Instance::invalid(self.factory);
        };
        let mut inst = self.member_instance(member.offset as u64, member);
        if !resolve.is_empty() {
            inst = inst.dereference(resolve);
        }
        inst
    }

    pub fn member_count(&self) -> usize {
        self.structured().map(|s| s.members.len()).unwrap_or(0)
    }

    pub fn member_exists(&self, name: &str) -> bool {
        self.find_member(name).is_some()
    }

    /// Byte offset of a member, anonymous nesting included.
    pub fn member_offset(&self, name: &str) -> Option<u64> {
        self.find_member(name).map(|(off, _)| off)
    }

    pub fn member_candidates_count(&self, name: &str) -> usize {
        self.find_member(name)
            .map(|(_, m)| m.alt_ref_types.len())
            .unwrap_or(0)
    }

    /// Forces the k-th candidate type of a member, bypassing the guards.
    pub fn member_candidate(&self, name: &str, index: usize) -> Instance<'a> {
        let Some((offset, member)) = self.find_member(name) else {
            return Instance::invalid(self.factory);
        };
        let Some(ty) = member
            .alt_ref_types
            .get(index)
            .and_then(|alt| self.factory.find_base_type_by_id(alt.ref_type_id))
        else {
            return Instance::invalid(self.factory);
        };
        let mut inst = self.member_instance(offset, member);
        inst.ty = Some(ty);
        inst.origin = Origin::Candidate;
        inst
    }

    fn member_instance(&self, offset: u64, member: &StructuredMember) -> Instance<'a> {
        let Some(ty) = self.factory.find_base_type_by_id(member.ref_type_id) else {
            return Instance::invalid(self.factory);
        };
        let Some(vmem) = self.vmem else {
            return Instance::invalid(self.factory);
        };
        let mut inst = Instance::new(
            self.factory,
            vmem,
            self.address.wrapping_add(offset),
            ty,
            member.name.clone(),
            self.full_name_components(),
            -1,
            Origin::Member,
        );
        inst.bit_size = member.bit_size;
        inst.bit_offset = member.bit_offset;
        inst
    }

    /// Resolves `name` against the members of this struct/union, descending
    /// into anonymous inner structs/unions. Returns the accumulated byte
    /// offset and the member found.
    fn find_member(&self, name: &str) -> Option<(u64, &'a StructuredMember)> {
        let ty = self.lexical_type()?;
        let s = ty.structured()?;
        Self::find_member_in(self.factory, s, name, 0)
    }

    fn find_member_in(
        factory: &'a SymbolFactory,
        s: &'a crate::symbols::basetype::StructuredInfo,
        name: &str,
        base: u64,
    ) -> Option<(u64, &'a StructuredMember)> {
        if let Some(m) = s.member(name) {
            return Some((base + m.offset as u64, m));
        }
        for m in s.members.iter().filter(|m| m.is_anonymous()) {
            let inner = factory.find_base_type_by_id(m.ref_type_id)?;
            let inner = factory.dereferenced_type(inner, RealTypeSet::TR_LEXICAL);
            if let Some(si) = inner.structured() {
                if let Some(hit) =
                    Self::find_member_in(factory, si, name, base + m.offset as u64)
                {
                    return Some(hit);
                }
            }
        }
        None
    }

    /// Array indexing. Arrays advance by element size, pointers dereference
    /// first, anything else reinterprets at `address + i * size`. Bounds
    /// are not checked, C-style.
    pub fn array_elem(&self, index: i64) -> Instance<'a> {
        let Some(ty) = self.lexical_type() else {
            return Instance::invalid(self.factory);
        };
        let Some(vmem) = self.vmem else {
            return Instance::invalid(self.factory);
        };
        match &ty.kind {
            TypeKind::Array(a) => {
                let Some(elem) = self.factory.find_base_type_by_id(a.ref_type_id) else {
                    return Instance::invalid(self.factory);
                };
                let esize = self.factory.type_size(elem) as i64;
                let mut inst = Instance::new(
                    self.factory,
                    vmem,
                    self.address.wrapping_add((index * esize) as u64),
                    elem,
                    format!("{}[{}]", self.name, index),
                    self.parent_names.clone(),
                    -1,
                    Origin::ArrayElem,
                );
                inst.bit_size = -1;
                inst
            }
            TypeKind::Pointer(p) => {
                let Some(target) = self.factory.find_base_type_by_id(p.ref_type_id) else {
                    return Instance::invalid(self.factory);
                };
                let Ok(base) = vmem.to_pointer(self.address) else {
                    return Instance::invalid(self.factory);
                };
                let tsize = self.factory.type_size(target) as i64;
                Instance::new(
                    self.factory,
                    vmem,
                    base.wrapping_add((index * tsize) as u64),
                    target,
                    format!("{}[{}]", self.name, index),
                    self.parent_names.clone(),
                    -1,
                    Origin::ArrayElem,
                )
            }
            _ => {
                let size = self.size() as i64;
                let mut inst = self.clone();
                inst.address = self.address.wrapping_add((index * size) as u64);
                inst.name = format!("{}[{}]", self.name, index);
                inst.origin = Origin::ArrayElem;
                inst
            }
        }
    }

    /// Declared array length, if the type is an array with a known one.
    pub fn array_length(&self) -> Option<i64> {
        let ty = self.lexical_type()?;
        match &ty.kind {
            TypeKind::Array(a) if a.length >= 0 => Some(a.length),
            _ => None,
        }
    }

    /// Follows referencing types according to `resolve`: lexical wrappers
    /// cost no memory access, each pointer level costs one read. With
    /// `NON_NULL` the walk stops cleanly at a null pointer.
    pub fn dereference(&self, resolve: RealTypeSet) -> Instance<'a> {
        let mut inst = self.clone();
        let non_null = resolve.contains(RealTypeSet::NON_NULL);
        for _ in 0..64 {
            let Some(ty) = inst.ty else { return inst };
            match &ty.kind {
                TypeKind::Lexical(rt, r) if rt.is_in(resolve) => {
                    match inst.factory.find_base_type_by_id(r.ref_type_id) {
                        Some(next) => inst.ty = Some(next),
                        None => return Instance::invalid(inst.factory),
                    }
                }
                TypeKind::Pointer(p) if RealType::Pointer.is_in(resolve) => {
                    let Some(vmem) = inst.vmem else {
                        return Instance::invalid(inst.factory);
                    };
                    let Some(target) = inst.factory.find_base_type_by_id(p.ref_type_id) else {
                        return Instance::invalid(inst.factory);
                    };
                    let Ok(value) = vmem.to_pointer(inst.address) else {
                        return Instance::invalid(inst.factory);
                    };
                    if value == 0 && non_null {
                        return inst;
                    }
                    inst.address = value.wrapping_sub(p.macro_extra_offset as u64);
                    inst.ty = Some(target);
                    inst.origin = Origin::Dereference;
                    inst.bit_size = -1;
                    inst.bit_offset = -1;
                    if value == 0 {
                        // A null, typed instance; further levels are futile.
                        return inst;
                    }
                }
                _ => return inst,
            }
        }
        inst
    }

    fn lexical_type(&self) -> Option<&'a BaseType> {
        self.ty
            .map(|t| self.factory.dereferenced_type(t, RealTypeSet::TR_LEXICAL))
    }

    fn structured(&self) -> Option<&'a crate::symbols::basetype::StructuredInfo> {
        self.lexical_type()?.structured()
    }

    /// Candidate selection per the alternative-type contract: evaluate all
    /// guards against the embedding instance; exactly one pass selects that
    /// candidate, none keeps the declared type, several select the highest
    /// priority and mark the result ambiguous.
    fn apply_candidates(
        &mut self,
        alts: &[&crate::symbols::AltRefType],
        context: &Instance<'a>,
    ) {
        let mut passing: Vec<TypeId> = Vec::new();
        for alt in alts {
            match alt.guard.eval(context) {
                Some(v) if v != 0 => passing.push(alt.ref_type_id),
                _ => {}
            }
        }
        match passing.len() {
            0 => {}
            n => {
                if let Some(ty) = self.factory.find_base_type_by_id(passing[0]) {
                    self.ty = Some(ty);
                    self.origin = Origin::Candidate;
                    self.ambiguous = n > 1;
                }
            }
        }
    }

    // ---- value reads -----------------------------------------------------

    fn read_unsigned(&self, size: u64) -> Option<u64> {
        let vmem = self.vmem?;
        let raw = match size {
            1 => vmem.read_u8(self.address).ok()? as u64,
            2 => vmem.read_u16(self.address).ok()? as u64,
            4 => vmem.read_u32(self.address).ok()? as u64,
            8 => vmem.read_u64(self.address).ok()?,
            _ => return None,
        };
        Some(self.extract_bits(raw))
    }

    fn extract_bits(&self, raw: u64) -> u64 {
        if self.bit_size < 0 {
            return raw;
        }
        let size = self.bit_size as u32;
        let offset = self.bit_offset.max(0) as u32;
        let mask = if size >= 64 { u64::MAX } else { (1u64 << size) - 1 };
        (raw >> offset) & mask
    }

    /// The value as a sign-extended 64-bit integer, when the type is an
    /// integer kind.
    pub fn to_int64(&self) -> Option<i64> {
        let ty = self.lexical_type()?;
        let size = self.factory.type_size(ty) as u64;
        let raw = self.read_unsigned(size)?;
        let signed = matches!(
            ty.real_type(),
            RealType::Int8 | RealType::Int16 | RealType::Int32 | RealType::Int64
        );
        if signed && self.bit_size < 0 {
            Some(match size {
                1 => raw as u8 as i8 as i64,
                2 => raw as u16 as i16 as i64,
                4 => raw as u32 as i32 as i64,
                _ => raw as i64,
            })
        } else {
            Some(raw as i64)
        }
    }

    pub fn to_uint64(&self) -> Option<u64> {
        let ty = self.lexical_type()?;
        let size = self.factory.type_size(ty) as u64;
        self.read_unsigned(size)
    }

    pub fn to_uint32(&self) -> Option<u32> {
        self.to_uint64().map(|v| v as u32)
    }

    pub fn to_f64(&self) -> Option<f64> {
        let ty = self.lexical_type()?;
        let vmem = self.vmem?;
        match ty.real_type() {
            RealType::Float => vmem.read_f32(self.address).ok().map(f64::from),
            RealType::Double => vmem.read_f64(self.address).ok(),
            _ => None,
        }
    }

    /// Reads the pointer value this instance holds.
    pub fn to_pointer(&self) -> Option<u64> {
        let vmem = self.vmem?;
        vmem.to_pointer(self.address).ok()
    }

    // ---- comparison ------------------------------------------------------

    /// Type-aware value equality per the navigation contract: numeric by
    /// normalized value, enums numerically, pointers by target address,
    /// arrays element-wise, structs shallowly over primitive members.
    pub fn equals(&self, other: &Instance<'_>) -> bool {
        let (Some(a), Some(b)) = (self.lexical_type(), other.lexical_type()) else {
            return false;
        };
        if a.is(RealTypeSet::INTEGER_TYPES) && b.is(RealTypeSet::INTEGER_TYPES) {
            return match (self.to_int64(), other.to_int64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            };
        }
        if a.is(RealTypeSet::FLOATING_TYPES) && b.is(RealTypeSet::FLOATING_TYPES) {
            return match (self.to_f64(), other.to_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            };
        }
        match (&a.kind, &b.kind) {
            (TypeKind::FuncPointer(_), TypeKind::FuncPointer(_)) => {
                self.to_pointer() == other.to_pointer() && self.to_pointer().is_some()
            }
            (TypeKind::Array(x), TypeKind::Array(y)) => {
                if x.length != y.length || x.length < 0 {
                    return false;
                }
                (0..x.length).all(|i| self.array_elem(i).equals(&other.array_elem(i)))
            }
            (TypeKind::Pointer(x), TypeKind::Pointer(y)) => {
                let void_ptr = |info: &crate::symbols::basetype::PointerInfo| {
                    self.factory
                        .find_base_type_by_id(info.ref_type_id)
                        .map(|t| t.real_type() == RealType::Void)
                        .unwrap_or(true)
                };
                if void_ptr(x) || void_ptr(y) {
                    self.to_pointer() == other.to_pointer() && self.to_pointer().is_some()
                } else {
                    // Compare the pointed-to values one level down.
                    let da = self.dereference(RealTypeSet::TR_LEXICAL_POINTERS);
                    let db = other.dereference(RealTypeSet::TR_LEXICAL_POINTERS);
                    if da.is_null() || db.is_null() {
                        return da.address == db.address;
                    }
                    da.address == db.address || da.equals(&db)
                }
            }
            (TypeKind::Struct(sa), TypeKind::Struct(sb))
            | (TypeKind::Union(sa), TypeKind::Union(sb)) => {
                if sa.members.len() != sb.members.len() {
                    return false;
                }
                for (i, m) in sa.members.iter().enumerate() {
                    let ma = self.member_at_raw(m);
                    let mb = other.member_at_raw(&sb.members[i]);
                    let Some(mt) = ma.lexical_type() else { return false };
                    // Shallow: skip nested structured members.
                    if mt.is(RealTypeSet::STRUCT_OR_UNION) {
                        continue;
                    }
                    if !ma.equals(&mb) {
                        return false;
                    }
                }
                true
            }
            _ => false,
        }
    }

    fn member_at_raw(&self, m: &StructuredMember) -> Instance<'a> {
        self.member_instance(m.offset as u64, m)
    }

    /// Paths of members whose values differ. With `recursive`, nested
    /// structs are descended into instead of skipped.
    pub fn differences(&self, other: &Instance<'_>, recursive: bool) -> Vec<String> {
        let mut out = Vec::new();
        self.differences_into(other, recursive, "", &mut out, 0);
        out
    }

    fn differences_into(
        &self,
        other: &Instance<'_>,
        recursive: bool,
        prefix: &str,
        out: &mut Vec<String>,
        depth: usize,
    ) {
        if depth > 16 {
            return;
        }
        let (Some(a), Some(b)) = (self.lexical_type(), other.lexical_type()) else {
            out.push(prefix.to_owned());
            return;
        };
        match (&a.kind, &b.kind) {
            (TypeKind::Struct(sa), TypeKind::Struct(sb))
            | (TypeKind::Union(sa), TypeKind::Union(sb))
                if sa.members.len() == sb.members.len() =>
            {
                for (i, m) in sa.members.iter().enumerate() {
                    let ma = self.member_at_raw(m);
                    let mb = other.member_at_raw(&sb.members[i]);
                    let path = if prefix.is_empty() {
                        m.name.clone()
                    } else {
                        format!("{prefix}.{}", m.name)
                    };
                    let nested = ma
                        .lexical_type()
                        .map(|t| t.is(RealTypeSet::STRUCT_OR_UNION))
                        .unwrap_or(false);
                    if nested {
                        if recursive {
                            ma.differences_into(&mb, recursive, &path, out, depth + 1);
                        }
                    } else if !ma.equals(&mb) {
                        out.push(path);
                    }
                }
            }
            _ => {
                if !self.equals(other) {
                    out.push(prefix.to_owned());
                }
            }
        }
    }

    // ---- rendering -------------------------------------------------------

    /// Renders the value by kind; never touches memory for invalid or null
    /// instances.
    pub fn render(&self) -> String {
        self.render_depth(0)
    }

    fn render_depth(&self, depth: usize) -> String {
        let Some(ty) = self.lexical_type() else {
            return "<invalid>".into();
        };
        if depth > 3 {
            return "{ ... }".into();
        }
        match &ty.kind {
            TypeKind::Numeric(rt) => self.render_numeric(*rt),
            TypeKind::Enum(e) => match self.to_int64() {
                Some(v) => e
                    .values
                    .iter()
                    .find(|(_, ev)| *ev == v)
                    .map(|(name, _)| name.clone())
                    .unwrap_or_else(|| format!("{v}")),
                None => "<invalid>".into(),
            },
            TypeKind::Pointer(p) => {
                let Some(value) = self.to_pointer() else {
                    return "<invalid>".into();
                };
                if value == 0 {
                    return "NULL".into();
                }
                let target = self.factory.find_base_type_by_id(p.ref_type_id);
                let is_char = target
                    .map(|t| {
                        let t = self.factory.dereferenced_type(t, RealTypeSet::TR_LEXICAL);
                        matches!(t.real_type(), RealType::Int8 | RealType::UInt8)
                    })
                    .unwrap_or(false);
                if is_char {
                    match self.vmem.and_then(|v| v.read_c_string(value, 255).ok()) {
                        Some(s) => format!("\"{s}\""),
                        None => "<invalid>".into(),
                    }
                } else {
                    format!("0x{value:x}")
                }
            }
            TypeKind::FuncPointer(_) => match self.to_pointer() {
                Some(0) => "NULL".into(),
                Some(v) => format!("0x{v:x}"),
                None => "<invalid>".into(),
            },
            TypeKind::Array(a) => {
                let elem = self
                    .factory
                    .find_base_type_by_id(a.ref_type_id)
                    .map(|t| self.factory.dereferenced_type(t, RealTypeSet::TR_LEXICAL));
                let is_char = elem
                    .map(|t| matches!(t.real_type(), RealType::Int8 | RealType::UInt8))
                    .unwrap_or(false);
                if is_char {
                    let len = a.length.max(0) as usize;
                    match self.vmem.and_then(|v| v.read_c_string(self.address, len).ok()) {
                        Some(s) => format!("\"{s}\""),
                        None => "<invalid>".into(),
                    }
                } else {
                    let len = a.length.max(0);
                    let vals: Vec<String> = (0..len)
                        .map(|i| self.array_elem(i).render_depth(depth + 1))
                        .collect();
                    format!("[ {} ]", vals.join(", "))
                }
            }
            TypeKind::Struct(s) | TypeKind::Union(s) => {
                let indent = "  ".repeat(depth + 1);
                let mut lines = Vec::new();
                for m in &s.members {
                    let mi = self.member_at_raw(m);
                    let name = if m.name.is_empty() { "<anonymous>" } else { &m.name };
                    lines.push(format!("{indent}{name} = {}", mi.render_depth(depth + 1)));
                }
                format!("{{\n{}\n{}}}", lines.join(",\n"), "  ".repeat(depth))
            }
            TypeKind::Function(f) => format!("<function at 0x{:x}>", f.pc_low),
            TypeKind::Lexical(..) => "<invalid>".into(),
        }
    }

    fn render_numeric(&self, rt: RealType) -> String {
        match rt {
            RealType::Float | RealType::Double => match self.to_f64() {
                Some(v) => format!("{v}"),
                None => "<invalid>".into(),
            },
            RealType::Bool8 | RealType::Bool16 | RealType::Bool32 | RealType::Bool64 => {
                match self.to_uint64() {
                    Some(0) => "false".into(),
                    Some(_) => "true".into(),
                    None => "<invalid>".into(),
                }
            }
            RealType::Void | RealType::VaList => "<void>".into(),
            _ => match self.to_int64() {
                Some(v) => format!("{v} (0x{:x})", self.to_uint64().unwrap_or(v as u64)),
                None => "<invalid>".into(),
            },
        }
    }
}

impl GuardContext for Instance<'_> {
    fn member_chain_value(&self, chain: &[String]) -> Option<i64> {
        let mut inst = self.clone();
        for (i, step) in chain.iter().enumerate() {
            // Intermediate steps may need a pointer dereference.
            inst = inst.member(step, RealTypeSet::TR_LEXICAL, KnowledgeSources::empty());
            if !inst.is_valid() {
                return None;
            }
            if i + 1 < chain.len() {
                inst = inst.dereference(RealTypeSet::TR_LEXICAL_POINTERS);
            }
        }
        let ty = inst.lexical_type()?;
        if ty.is(RealTypeSet::INTEGER_TYPES) {
            inst.to_int64()
        } else if matches!(ty.kind, TypeKind::Pointer(_) | TypeKind::FuncPointer(_)) {
            inst.to_pointer().map(|v| v as i64)
        } else {
            None
        }
    }

    fn global_address(&self, name: &str) -> Option<u64> {
        self.factory.find_var_by_name(name).map(|v| v.address)
    }
}

impl std::fmt::Debug for Instance<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("address", &format_args!("{:#x}", self.address))
            .field("type", &self.type_name())
            .field("name", &self.full_name())
            .field("origin", &self.origin)
            .finish()
    }
}
