//! The symbol factory: owner of the deduplicated type graph.
//!
//! Assembly happens in two phases. `feed` inserts one `TypeInfo` record at
//! a time; `finalize` then checks referential closure, computes content
//! hashes bottom-up (cycle-tolerant), merges structurally equal types and
//! rebuilds the lookup indexes. After finalization the factory is read-only
//! except for alternative-type evidence from the source oracle.

use hashbrown::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::error::{InsightError, Result};

use super::alt::{AltRefType, GuardExpr};
use super::basetype::{
    ArrayInfo, BaseType, EnumInfo, FunctionInfo, PointerInfo, RefInfo, StructuredInfo,
    StructuredMember, TypeKind, Variable,
};
use super::realtype::{RealType, RealTypeSet};
use super::typeinfo::{TypeId, TypeInfo, TypeRecord, VarRecord};

/// Hash contributed by a type reached recursively before its own hash has
/// settled.
const CYCLE_SENTINEL: u32 = 0x5eed_c0de;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    Parsing,
    Loading,
}

#[derive(Debug, Clone)]
pub enum AltUsageTarget {
    /// A global variable by name.
    Variable(String),
    /// A member chain rooted at a named struct/union type.
    Member { type_name: String, members: Vec<String> },
    /// A pointer type by id.
    PointerType(TypeId),
}

#[derive(Debug, Clone)]
pub struct AltTypeEvidence {
    pub target: AltUsageTarget,
    pub candidate_id: TypeId,
    pub guard: GuardExpr,
}

#[derive(Default)]
pub struct SymbolFactory {
    types: HashMap<TypeId, BaseType>,
    types_by_name: HashMap<String, Vec<TypeId>>,
    types_by_hash: HashMap<u32, Vec<TypeId>>,
    vars: HashMap<i32, Variable>,
    vars_by_name: HashMap<String, Vec<i32>>,
    change_clock: u64,
    finalized: bool,
    dirty: bool,
    warned_long_double: bool,
}

impl SymbolFactory {
    pub fn new() -> SymbolFactory {
        SymbolFactory::default()
    }

    /// Accepts one producer record.
    pub fn feed(&mut self, info: TypeInfo) -> Result<()> {
        match info {
            TypeInfo::Type(rec) => self.feed_type(rec),
            TypeInfo::Variable(rec) => self.feed_var(rec),
        }
    }

    fn feed_type(&mut self, mut rec: TypeRecord) -> Result<()> {
        if rec.kind == RealType::Double && rec.size > 8 {
            if !self.warned_long_double {
                warn!("long double is not supported, coercing to double");
                self.warned_long_double = true;
            }
            rec.size = 8;
        }
        let kind = match rec.kind {
            RealType::Const | RealType::Volatile | RealType::Typedef => TypeKind::Lexical(
                rec.kind,
                RefInfo {
                    ref_type_id: rec.ref_type_id,
                },
            ),
            RealType::Pointer => TypeKind::Pointer(PointerInfo {
                ref_type_id: rec.ref_type_id,
                macro_extra_offset: 0,
                alt_ref_types: Vec::new(),
            }),
            RealType::Array => TypeKind::Array(ArrayInfo {
                ref_type_id: rec.ref_type_id,
                length: rec.array_length,
            }),
            RealType::Enum => TypeKind::Enum(EnumInfo {
                values: rec.enum_values,
            }),
            RealType::Struct | RealType::Union => {
                let members = rec
                    .members
                    .into_iter()
                    .map(|m| StructuredMember {
                        name: m.name,
                        offset: m.offset,
                        bit_size: m.bit_size,
                        bit_offset: m.bit_offset,
                        ref_type_id: m.ref_type_id,
                        alt_ref_types: Vec::new(),
                    })
                    .collect();
                let info = StructuredInfo { members };
                if rec.kind == RealType::Struct {
                    TypeKind::Struct(info)
                } else {
                    TypeKind::Union(info)
                }
            }
            RealType::Function | RealType::FuncPointer => {
                let info = FunctionInfo {
                    params: rec.params,
                    ref_type_id: rec.ref_type_id,
                    pc_low: rec.pc_low,
                    pc_high: rec.pc_high,
                };
                if rec.kind == RealType::Function {
                    TypeKind::Function(info)
                } else {
                    TypeKind::FuncPointer(info)
                }
            }
            rt => TypeKind::Numeric(rt),
        };
        let bt = BaseType {
            id: rec.id,
            name: rec.name,
            size: rec.size,
            kind,
            src_line: rec.src_line,
            hash: 0,
        };
        if let Some(existing) = self.types.get(&rec.id) {
            if existing.real_type() != bt.real_type() {
                return Err(InsightError::SymbolParse(format!(
                    "duplicate type id {} with incompatible kind: {} vs {}",
                    rec.id,
                    existing.real_type().name(),
                    bt.real_type().name()
                )));
            }
            // Same DIE seen again through another compile unit.
            return Ok(());
        }
        if let Some(name) = bt.name.clone() {
            self.types_by_name.entry(name).or_default().push(rec.id);
        }
        self.types.insert(rec.id, bt);
        self.finalized = false;
        self.dirty = true;
        Ok(())
    }

    fn feed_var(&mut self, rec: VarRecord) -> Result<()> {
        if self.vars.contains_key(&rec.id) {
            return Ok(());
        }
        self.vars_by_name
            .entry(rec.name.clone())
            .or_default()
            .push(rec.id);
        self.vars.insert(
            rec.id,
            Variable {
                id: rec.id,
                name: rec.name,
                address: rec.address,
                ref_type_id: rec.ref_type_id,
                alt_ref_types: Vec::new(),
                src_line: rec.src_line,
            },
        );
        self.finalized = false;
        self.dirty = true;
        Ok(())
    }

    /// Restores a fully assembled variable; used by the persistence layer.
    pub(crate) fn insert_variable(&mut self, var: Variable) {
        self.vars_by_name
            .entry(var.name.clone())
            .or_default()
            .push(var.id);
        self.vars.insert(var.id, var);
        self.dirty = true;
        self.finalized = false;
    }

    /// Restores a fully assembled type; used by the persistence layer.
    pub(crate) fn insert_type(&mut self, bt: BaseType) {
        if let Some(name) = bt.name.clone() {
            self.types_by_name.entry(name).or_default().push(bt.id);
        }
        self.types.insert(bt.id, bt);
        self.dirty = true;
        self.finalized = false;
    }

    /// Removes and returns a type; persistence-layer scratch use only.
    pub(crate) fn take_type(&mut self, id: TypeId) -> Option<BaseType> {
        self.types.remove(&id)
    }

    pub(crate) fn attach_var_alts(&mut self, id: i32, alts: Vec<AltRefType>) -> Result<()> {
        let var = self.vars.get_mut(&id).ok_or(InsightError::DanglingReference {
            referer: id,
            missing: id,
        })?;
        for alt in alts {
            push_unique(&mut var.alt_ref_types, alt);
        }
        Ok(())
    }

    pub(crate) fn attach_pointer_alts(&mut self, id: TypeId, alts: Vec<AltRefType>) -> Result<()> {
        let bt = self.types.get_mut(&id).ok_or(InsightError::DanglingReference {
            referer: id,
            missing: id,
        })?;
        match &mut bt.kind {
            TypeKind::Pointer(p) => {
                for alt in alts {
                    push_unique(&mut p.alt_ref_types, alt);
                }
                Ok(())
            }
            _ => Err(InsightError::SymbolParse(format!(
                "alternative-type record targets non-pointer type {id}"
            ))),
        }
    }

    pub(crate) fn attach_member_alts(
        &mut self,
        id: TypeId,
        member: usize,
        alts: Vec<AltRefType>,
    ) -> Result<()> {
        let bt = self.types.get_mut(&id).ok_or(InsightError::DanglingReference {
            referer: id,
            missing: id,
        })?;
        let s = bt.structured_mut().ok_or_else(|| {
            InsightError::SymbolParse(format!(
                "alternative-type record targets non-structured type {id}"
            ))
        })?;
        let m = s.members.get_mut(member).ok_or_else(|| {
            InsightError::SymbolParse(format!(
                "alternative-type record targets member {member} out of range on type {id}"
            ))
        })?;
        for alt in alts {
            push_unique(&mut m.alt_ref_types, alt);
        }
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn change_clock(&self) -> u64 {
        self.change_clock
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    /// Resolves references, hashes, merges and reindexes. Idempotent.
    pub fn finalize(&mut self, reason: FinalizeReason) -> Result<()> {
        if self.finalized && !self.dirty {
            return Ok(());
        }
        self.check_referential_closure()?;
        self.compute_hashes();
        let merged = self.merge_by_hash();
        self.rebuild_indexes();
        self.change_clock += 1;
        self.finalized = true;
        self.dirty = false;
        debug!(
            ?reason,
            types = self.types.len(),
            variables = self.vars.len(),
            merged,
            "symbol factory finalized"
        );
        Ok(())
    }

    fn check_referential_closure(&self) -> Result<()> {
        let check = |referer: TypeId, id: TypeId| -> Result<()> {
            if id != 0 && !self.types.contains_key(&id) {
                return Err(InsightError::DanglingReference {
                    referer,
                    missing: id,
                });
            }
            Ok(())
        };
        for bt in self.types.values() {
            if let Some(id) = bt.ref_type_id() {
                check(bt.id, id)?;
            }
            match &bt.kind {
                TypeKind::Struct(s) | TypeKind::Union(s) => {
                    for m in &s.members {
                        check(bt.id, m.ref_type_id)?;
                        for alt in &m.alt_ref_types {
                            check(bt.id, alt.ref_type_id)?;
                        }
                    }
                }
                TypeKind::Function(f) | TypeKind::FuncPointer(f) => {
                    for (_, id) in &f.params {
                        check(bt.id, *id)?;
                    }
                }
                TypeKind::Pointer(p) => {
                    for alt in &p.alt_ref_types {
                        check(bt.id, alt.ref_type_id)?;
                    }
                }
                _ => {}
            }
        }
        for var in self.vars.values() {
            check(var.id, var.ref_type_id)?;
        }
        Ok(())
    }

    // ---- content hashing -------------------------------------------------

    fn compute_hashes(&mut self) {
        let mut ids: Vec<TypeId> = self.types.keys().copied().collect();
        ids.sort_unstable();

        let mut memo: HashMap<TypeId, u32> = HashMap::new();
        let mut in_progress: HashSet<TypeId> = HashSet::new();
        for &id in &ids {
            self.hash_dfs(id, &mut memo, &mut in_progress);
        }
        // Types on a cycle hashed against the sentinel in the first pass;
        // re-smooth until the values settle.
        for _ in 0..4 {
            let mut changed = false;
            for &id in &ids {
                let h = self.hash_one(id, &memo);
                if memo.get(&id) != Some(&h) {
                    memo.insert(id, h);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        for (&id, &h) in &memo {
            if let Some(bt) = self.types.get_mut(&id) {
                bt.hash = h;
            }
        }
    }

    fn hash_dfs(
        &self,
        id: TypeId,
        memo: &mut HashMap<TypeId, u32>,
        in_progress: &mut HashSet<TypeId>,
    ) -> u32 {
        if let Some(&h) = memo.get(&id) {
            return h;
        }
        if !in_progress.insert(id) {
            return CYCLE_SENTINEL;
        }
        let bt = match self.types.get(&id) {
            Some(bt) => bt,
            None => {
                in_progress.remove(&id);
                return 0;
            }
        };
        let mut child = |cid: TypeId| -> u32 {
            if cid == 0 {
                0
            } else if in_progress.contains(&cid) {
                CYCLE_SENTINEL
            } else {
                self.hash_dfs(cid, memo, in_progress)
            }
        };
        let h = Self::hash_content(bt, &mut child);
        in_progress.remove(&id);
        memo.insert(id, h);
        h
    }

    fn hash_one(&self, id: TypeId, memo: &HashMap<TypeId, u32>) -> u32 {
        let bt = &self.types[&id];
        let mut child = |cid: TypeId| -> u32 {
            if cid == 0 {
                0
            } else {
                memo.get(&cid).copied().unwrap_or(CYCLE_SENTINEL)
            }
        };
        Self::hash_content(bt, &mut child)
    }

    fn hash_content(bt: &BaseType, child: &mut dyn FnMut(TypeId) -> u32) -> u32 {
        let mut h = crc32fast::Hasher::new();
        h.update(&[bt.real_type() as u8]);
        h.update(&bt.size.to_le_bytes());
        if let Some(name) = &bt.name {
            h.update(name.as_bytes());
        }
        match &bt.kind {
            TypeKind::Numeric(_) => {}
            TypeKind::Lexical(_, r) => h.update(&child(r.ref_type_id).to_le_bytes()),
            TypeKind::Pointer(p) => {
                h.update(&child(p.ref_type_id).to_le_bytes());
                h.update(&p.macro_extra_offset.to_le_bytes());
            }
            TypeKind::Array(a) => {
                h.update(&child(a.ref_type_id).to_le_bytes());
                h.update(&a.length.to_le_bytes());
            }
            TypeKind::Enum(e) => {
                for (name, value) in &e.values {
                    h.update(name.as_bytes());
                    h.update(&value.to_le_bytes());
                }
            }
            TypeKind::Struct(s) | TypeKind::Union(s) => {
                for m in &s.members {
                    h.update(m.name.as_bytes());
                    h.update(&m.offset.to_le_bytes());
                    h.update(&[m.bit_size as u8, m.bit_offset as u8]);
                    h.update(&child(m.ref_type_id).to_le_bytes());
                }
            }
            TypeKind::Function(f) | TypeKind::FuncPointer(f) => {
                h.update(&child(f.ref_type_id).to_le_bytes());
                for (name, id) in &f.params {
                    h.update(name.as_bytes());
                    h.update(&child(*id).to_le_bytes());
                }
            }
        }
        h.finalize()
    }

    // ---- hash-based merging ----------------------------------------------

    /// Merges structurally equal types within each name bucket; all referers
    /// are rewritten to the canonical (lowest) id. Returns the number of
    /// types removed.
    fn merge_by_hash(&mut self) -> usize {
        let mut remap: HashMap<TypeId, TypeId> = HashMap::new();
        for ids in self.types_by_name.values() {
            let mut by_hash: HashMap<u32, Vec<TypeId>> = HashMap::new();
            for &id in ids {
                if let Some(bt) = self.types.get(&id) {
                    by_hash.entry(bt.hash).or_default().push(id);
                }
            }
            for (_, mut group) in by_hash {
                if group.len() < 2 {
                    continue;
                }
                group.sort_unstable();
                let canonical = group[0];
                for &dup in &group[1..] {
                    if self.structurally_equal(canonical, dup) {
                        remap.insert(dup, canonical);
                    }
                }
            }
        }
        if remap.is_empty() {
            return 0;
        }
        // Keep alternative-type evidence attached to merged duplicates.
        for (&dup, &canonical) in &remap {
            if let Some(bt) = self.types.remove(&dup) {
                if let TypeKind::Pointer(p) = bt.kind {
                    if !p.alt_ref_types.is_empty() {
                        if let Some(TypeKind::Pointer(cp)) =
                            self.types.get_mut(&canonical).map(|c| &mut c.kind)
                        {
                            for alt in p.alt_ref_types {
                                if !cp.alt_ref_types.contains(&alt) {
                                    cp.alt_ref_types.push(alt);
                                }
                            }
                        }
                    }
                }
            }
        }
        let map = |id: &mut TypeId| {
            if let Some(&to) = remap.get(id) {
                *id = to;
            }
        };
        for bt in self.types.values_mut() {
            match &mut bt.kind {
                TypeKind::Lexical(_, r) => map(&mut r.ref_type_id),
                TypeKind::Pointer(p) => {
                    map(&mut p.ref_type_id);
                    for alt in &mut p.alt_ref_types {
                        map(&mut alt.ref_type_id);
                    }
                }
                TypeKind::Array(a) => map(&mut a.ref_type_id),
                TypeKind::Struct(s) | TypeKind::Union(s) => {
                    for m in &mut s.members {
                        map(&mut m.ref_type_id);
                        for alt in &mut m.alt_ref_types {
                            map(&mut alt.ref_type_id);
                        }
                    }
                }
                TypeKind::Function(f) | TypeKind::FuncPointer(f) => {
                    map(&mut f.ref_type_id);
                    for (_, id) in &mut f.params {
                        map(id);
                    }
                }
                TypeKind::Numeric(_) | TypeKind::Enum(_) => {}
            }
        }
        for var in self.vars.values_mut() {
            map(&mut var.ref_type_id);
            for alt in &mut var.alt_ref_types {
                map(&mut alt.ref_type_id);
            }
        }
        remap.len()
    }

    /// Structural equality check behind the hash: equal kind, size, name and
    /// equal referenced hashes. Guards against crc collisions.
    fn structurally_equal(&self, a: TypeId, b: TypeId) -> bool {
        let (a, b) = match (self.types.get(&a), self.types.get(&b)) {
            (Some(a), Some(b)) => (a, b),
            _ => return false,
        };
        if a.real_type() != b.real_type() || a.size != b.size || a.name != b.name {
            return false;
        }
        let rh = |id: TypeId| self.types.get(&id).map(|t| t.hash).unwrap_or(0);
        match (&a.kind, &b.kind) {
            (TypeKind::Numeric(_), TypeKind::Numeric(_)) => true,
            (TypeKind::Lexical(_, x), TypeKind::Lexical(_, y)) => {
                rh(x.ref_type_id) == rh(y.ref_type_id)
            }
            (TypeKind::Pointer(x), TypeKind::Pointer(y)) => {
                rh(x.ref_type_id) == rh(y.ref_type_id)
                    && x.macro_extra_offset == y.macro_extra_offset
            }
            (TypeKind::Array(x), TypeKind::Array(y)) => {
                rh(x.ref_type_id) == rh(y.ref_type_id) && x.length == y.length
            }
            (TypeKind::Enum(x), TypeKind::Enum(y)) => x.values == y.values,
            (TypeKind::Struct(x), TypeKind::Struct(y))
            | (TypeKind::Union(x), TypeKind::Union(y)) => {
                x.members.len() == y.members.len()
                    && x.members.iter().zip(&y.members).all(|(m, n)| {
                        m.name == n.name
                            && m.offset == n.offset
                            && m.bit_size == n.bit_size
                            && m.bit_offset == n.bit_offset
                            && rh(m.ref_type_id) == rh(n.ref_type_id)
                    })
            }
            (TypeKind::Function(x), TypeKind::Function(y))
            | (TypeKind::FuncPointer(x), TypeKind::FuncPointer(y)) => {
                rh(x.ref_type_id) == rh(y.ref_type_id)
                    && x.params.len() == y.params.len()
                    && x.params
                        .iter()
                        .zip(&y.params)
                        .all(|((pn, pi), (qn, qi))| pn == qn && rh(*pi) == rh(*qi))
            }
            _ => false,
        }
    }

    fn rebuild_indexes(&mut self) {
        // Every id referenced by some other type or variable.
        let mut referenced: HashSet<TypeId> = HashSet::new();
        for bt in self.types.values() {
            if let Some(id) = bt.ref_type_id() {
                referenced.insert(id);
            }
            match &bt.kind {
                TypeKind::Struct(s) | TypeKind::Union(s) => {
                    for m in &s.members {
                        referenced.insert(m.ref_type_id);
                    }
                }
                TypeKind::Function(f) | TypeKind::FuncPointer(f) => {
                    for (_, id) in &f.params {
                        referenced.insert(*id);
                    }
                }
                _ => {}
            }
        }
        for var in self.vars.values() {
            referenced.insert(var.ref_type_id);
        }

        self.types_by_name.clear();
        self.types_by_hash.clear();
        for bt in self.types.values() {
            // Intermediate typedefs nothing refers to stay reachable by id
            // but drop out of the name index.
            let drop_from_names =
                bt.real_type() == RealType::Typedef && !referenced.contains(&bt.id);
            if let Some(name) = &bt.name {
                if !drop_from_names {
                    self.types_by_name
                        .entry(name.clone())
                        .or_default()
                        .push(bt.id);
                }
            }
            self.types_by_hash.entry(bt.hash).or_default().push(bt.id);
        }
        for ids in self.types_by_name.values_mut() {
            ids.sort_unstable();
        }
        for ids in self.types_by_hash.values_mut() {
            ids.sort_unstable();
        }
        self.vars_by_name.clear();
        for var in self.vars.values() {
            self.vars_by_name
                .entry(var.name.clone())
                .or_default()
                .push(var.id);
        }
        for ids in self.vars_by_name.values_mut() {
            ids.sort_unstable();
        }
    }

    // ---- lookups ---------------------------------------------------------

    pub fn find_base_type_by_id(&self, id: TypeId) -> Option<&BaseType> {
        self.types.get(&id)
    }

    pub fn find_base_type_by_name(&self, name: &str) -> Option<&BaseType> {
        self.types_by_name
            .get(name)
            .and_then(|ids| ids.first())
            .and_then(|id| self.types.get(id))
    }

    pub fn types_by_name(&self, name: &str) -> impl Iterator<Item = &BaseType> {
        self.types_by_name
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.types.get(id))
    }

    pub fn types_by_hash(&self, hash: u32) -> &[TypeId] {
        self.types_by_hash
            .get(&hash)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn find_var_by_name(&self, name: &str) -> Option<&Variable> {
        self.vars_by_name
            .get(name)
            .and_then(|ids| ids.first())
            .and_then(|id| self.vars.get(id))
    }

    pub fn find_var_by_id(&self, id: i32) -> Option<&Variable> {
        self.vars.get(&id)
    }

    pub fn types(&self) -> impl Iterator<Item = &BaseType> {
        self.types.values()
    }

    pub fn vars(&self) -> impl Iterator<Item = &Variable> {
        self.vars.values()
    }

    /// Ids in ascending order; the persisted layout uses this.
    pub fn sorted_type_ids(&self) -> Vec<TypeId> {
        let mut ids: Vec<TypeId> = self.types.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn sorted_var_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.vars.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Follows referencing kinds contained in `set` until a type outside it
    /// is reached. Cycle-guarded.
    pub fn dereferenced_type<'a>(&'a self, ty: &'a BaseType, set: RealTypeSet) -> &'a BaseType {
        let mut current = ty;
        let mut steps = 0;
        while current.is(set & RealTypeSet::REF_BASE_TYPES) && steps < 64 {
            match current.ref_type_id().and_then(|id| self.types.get(&id)) {
                Some(next) => current = next,
                None => break,
            }
            steps += 1;
        }
        current
    }

    /// Size of a type with lexical wrappers resolved.
    pub fn type_size(&self, ty: &BaseType) -> u32 {
        if ty.size != 0 {
            return ty.size;
        }
        let deep = self.dereferenced_type(ty, RealTypeSet::TR_LEXICAL);
        if deep.size != 0 {
            return deep.size;
        }
        // Array sizes may be derivable from element size and length.
        if let TypeKind::Array(a) = &deep.kind {
            if a.length >= 0 {
                if let Some(elem) = self.types.get(&a.ref_type_id) {
                    return self.type_size(elem).saturating_mul(a.length as u32);
                }
            }
        }
        0
    }

    /// Human-readable type name, C style.
    pub fn pretty_name(&self, ty: &BaseType) -> String {
        match &ty.kind {
            TypeKind::Numeric(rt) => ty
                .name
                .clone()
                .unwrap_or_else(|| rt.name().to_ascii_lowercase()),
            TypeKind::Lexical(rt, r) => {
                if *rt == RealType::Typedef {
                    ty.name.clone().unwrap_or_else(|| "<typedef>".into())
                } else {
                    let inner = self
                        .types
                        .get(&r.ref_type_id)
                        .map(|t| self.pretty_name(t))
                        .unwrap_or_else(|| "void".into());
                    let prefix = if *rt == RealType::Const { "const" } else { "volatile" };
                    format!("{prefix} {inner}")
                }
            }
            TypeKind::Pointer(p) => {
                let inner = self
                    .types
                    .get(&p.ref_type_id)
                    .map(|t| self.pretty_name(t))
                    .unwrap_or_else(|| "void".into());
                format!("{inner} *")
            }
            TypeKind::Array(a) => {
                let inner = self
                    .types
                    .get(&a.ref_type_id)
                    .map(|t| self.pretty_name(t))
                    .unwrap_or_else(|| "void".into());
                if a.length >= 0 {
                    format!("{inner}[{}]", a.length)
                } else {
                    format!("{inner}[]")
                }
            }
            TypeKind::Enum(_) => format!(
                "enum {}",
                ty.name.as_deref().unwrap_or("<anonymous>")
            ),
            TypeKind::Struct(_) => format!(
                "struct {}",
                ty.name.as_deref().unwrap_or("<anonymous>")
            ),
            TypeKind::Union(_) => format!(
                "union {}",
                ty.name.as_deref().unwrap_or("<anonymous>")
            ),
            TypeKind::Function(f) | TypeKind::FuncPointer(f) => {
                let ret = self
                    .types
                    .get(&f.ref_type_id)
                    .map(|t| self.pretty_name(t))
                    .unwrap_or_else(|| "void".into());
                let params: Vec<String> = f
                    .params
                    .iter()
                    .map(|(_, id)| {
                        self.types
                            .get(id)
                            .map(|t| self.pretty_name(t))
                            .unwrap_or_else(|| "void".into())
                    })
                    .collect();
                let sig = params.join(", ");
                if matches!(ty.kind, TypeKind::FuncPointer(_)) {
                    format!("{ret} (*)({sig})")
                } else {
                    format!("{ret} {}({sig})", ty.name.as_deref().unwrap_or(""))
                }
            }
        }
    }

    // ---- alternative-type evidence ---------------------------------------

    /// Appends candidate evidence from the source oracle. Returns `true` if
    /// the candidate was new, `false` when deduplicated away.
    pub fn type_alternate_usage(&mut self, ev: &AltTypeEvidence) -> Result<bool> {
        if !self.types.contains_key(&ev.candidate_id) {
            return Err(InsightError::DanglingReference {
                referer: 0,
                missing: ev.candidate_id,
            });
        }
        let alt = AltRefType::new(ev.candidate_id, ev.guard.clone());
        let added = match &ev.target {
            AltUsageTarget::Variable(name) => {
                let id = *self
                    .vars_by_name
                    .get(name)
                    .and_then(|ids| ids.first())
                    .ok_or_else(|| {
                        InsightError::SymbolParse(format!("unknown variable \"{name}\""))
                    })?;
                let var = self.vars.get_mut(&id).ok_or(InsightError::DanglingReference {
                    referer: id,
                    missing: id,
                })?;
                push_unique(&mut var.alt_ref_types, alt)
            }
            AltUsageTarget::PointerType(id) => {
                let bt = self.types.get_mut(id).ok_or(InsightError::DanglingReference {
                    referer: 0,
                    missing: *id,
                })?;
                match &mut bt.kind {
                    TypeKind::Pointer(p) => push_unique(&mut p.alt_ref_types, alt),
                    _ => {
                        return Err(InsightError::SymbolParse(format!(
                            "type id {id} is not a pointer"
                        )))
                    }
                }
            }
            AltUsageTarget::Member { type_name, members } => {
                if members.is_empty() {
                    return Err(InsightError::SymbolParse(
                        "empty member chain in alternative-type evidence".into(),
                    ));
                }
                let owner = self.owning_struct_of_chain(type_name, members)?;
                let member_name = members[members.len() - 1].clone();
                let s = self
                    .types
                    .get_mut(&owner)
                    .and_then(BaseType::structured_mut)
                    .ok_or_else(|| {
                        InsightError::SymbolParse(format!(
                            "\"{type_name}\" does not resolve to a struct or union"
                        ))
                    })?;
                let m = s
                    .members
                    .iter_mut()
                    .find(|m| m.name == member_name)
                    .ok_or_else(|| {
                        InsightError::SymbolParse(format!(
                            "type \"{type_name}\" has no member \"{member_name}\""
                        ))
                    })?;
                push_unique(&mut m.alt_ref_types, alt)
            }
        };
        if added {
            self.change_clock += 1;
        }
        Ok(added)
    }

    /// Walks all but the last chain component and returns the id of the
    /// struct/union owning the final member.
    fn owning_struct_of_chain(&self, type_name: &str, members: &[String]) -> Result<TypeId> {
        let mut ty = self
            .find_base_type_by_name(type_name)
            .ok_or_else(|| InsightError::SymbolParse(format!("unknown type \"{type_name}\"")))?;
        ty = self.dereferenced_type(ty, RealTypeSet::TR_LEXICAL);
        for step in &members[..members.len() - 1] {
            let s = ty.structured().ok_or_else(|| {
                InsightError::SymbolParse(format!(
                    "\"{}\" is not a struct or union",
                    self.pretty_name(ty)
                ))
            })?;
            let m = s.member(step).ok_or_else(|| {
                InsightError::SymbolParse(format!(
                    "\"{}\" has no member \"{step}\"",
                    self.pretty_name(ty)
                ))
            })?;
            ty = self
                .find_base_type_by_id(m.ref_type_id)
                .ok_or(InsightError::DanglingReference {
                    referer: ty.id,
                    missing: m.ref_type_id,
                })?;
            ty = self.dereferenced_type(ty, RealTypeSet::TR_LEXICAL_POINTERS);
        }
        if ty.structured().is_none() {
            return Err(InsightError::SymbolParse(format!(
                "\"{}\" is not a struct or union",
                self.pretty_name(ty)
            )));
        }
        Ok(ty.id)
    }
}

fn push_unique(list: &mut Vec<AltRefType>, alt: AltRefType) -> bool {
    if list.contains(&alt) {
        return false;
    }
    list.push(alt);
    true
}
