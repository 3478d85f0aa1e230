//! The typed symbol graph: kinds, nodes, factory, persistence.

pub mod alt;
pub mod basetype;
pub mod factory;
pub mod persist;
pub mod realtype;
pub mod typeinfo;

pub use alt::{AltRefType, GuardContext, GuardExpr, GuardOp};
pub use basetype::{
    ArrayInfo, BaseType, EnumInfo, FunctionInfo, PointerInfo, StructuredInfo, StructuredMember,
    TypeKind, Variable,
};
pub use factory::{AltTypeEvidence, AltUsageTarget, FinalizeReason, SymbolFactory};
pub use realtype::{RealType, RealTypeSet};
pub use typeinfo::{MemberRecord, TypeId, TypeInfo, TypeRecord, VarRecord};

#[cfg(test)]
mod tests {
    use super::typeinfo::{MemberRecord, TypeRecord};
    use super::*;
    use pretty_assertions::assert_eq;

    /// A miniature kernel-ish graph: scalars, a self-referential list_head,
    /// a task_struct with an embedded array and list, plus globals.
    pub(crate) fn mini_factory() -> SymbolFactory {
        let mut f = SymbolFactory::new();
        let feed_type = |f: &mut SymbolFactory, rec: TypeRecord| {
            f.feed(TypeInfo::Type(rec)).unwrap();
        };

        feed_type(&mut f, TypeRecord::plain(1, RealType::Int8, Some("char"), 1));
        feed_type(&mut f, TypeRecord::plain(2, RealType::Int32, Some("int"), 4));
        feed_type(&mut f, TypeRecord::plain(3, RealType::UInt64, Some("long unsigned int"), 8));
        feed_type(&mut f, TypeRecord::plain(4, RealType::Void, None, 0));

        // struct list_head { struct list_head *next, *prev; }
        feed_type(&mut f, TypeRecord::referencing(10, RealType::Pointer, 11, 8));
        let mut list_head = TypeRecord::plain(11, RealType::Struct, Some("list_head"), 16);
        list_head.members = vec![
            MemberRecord { name: "next".into(), offset: 0, ref_type_id: 10, bit_size: -1, bit_offset: -1 },
            MemberRecord { name: "prev".into(), offset: 8, ref_type_id: 10, bit_size: -1, bit_offset: -1 },
        ];
        feed_type(&mut f, list_head);

        // char[16]
        let mut arr = TypeRecord::referencing(12, RealType::Array, 1, 16);
        arr.array_length = 16;
        feed_type(&mut f, arr);

        // void *
        feed_type(&mut f, TypeRecord::referencing(13, RealType::Pointer, 4, 8));

        // struct task_struct { int pid; char comm[16]; struct list_head tasks; void *stack; }
        let mut task = TypeRecord::plain(14, RealType::Struct, Some("task_struct"), 48);
        task.members = vec![
            MemberRecord { name: "pid".into(), offset: 0, ref_type_id: 2, bit_size: -1, bit_offset: -1 },
            MemberRecord { name: "comm".into(), offset: 4, ref_type_id: 12, bit_size: -1, bit_offset: -1 },
            MemberRecord { name: "tasks".into(), offset: 24, ref_type_id: 11, bit_size: -1, bit_offset: -1 },
            MemberRecord { name: "stack".into(), offset: 40, ref_type_id: 13, bit_size: -1, bit_offset: -1 },
        ];
        feed_type(&mut f, task);

        // typedef u32 -> int-like scalar
        feed_type(&mut f, TypeRecord::plain(15, RealType::UInt32, None, 4));
        let mut td = TypeRecord::referencing(16, RealType::Typedef, 15, 4);
        td.name = Some("u32".into());
        feed_type(&mut f, td);
        // a member referencing the typedef keeps it in the name index
        let mut holder = TypeRecord::plain(17, RealType::Struct, Some("jiffies_holder"), 4);
        holder.members = vec![MemberRecord {
            name: "val".into(),
            offset: 0,
            ref_type_id: 16,
            bit_size: -1,
            bit_offset: -1,
        }];
        feed_type(&mut f, holder);

        f.feed(TypeInfo::Variable(VarRecord {
            id: 100,
            name: "init_task".into(),
            address: 0xffff_ffff_8100_0000,
            ref_type_id: 14,
            src_line: 0,
        }))
        .unwrap();
        f
    }

    #[test]
    fn finalize_resolves_and_indexes() {
        let mut f = mini_factory();
        f.finalize(FinalizeReason::Parsing).unwrap();
        assert!(f.is_finalized());
        let task = f.find_base_type_by_name("task_struct").unwrap();
        assert_eq!(task.size, 48);
        let var = f.find_var_by_name("init_task").unwrap();
        assert_eq!(var.ref_type_id, task.id);
        assert!(f.find_base_type_by_id(var.ref_type_id).is_some());
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut f = mini_factory();
        f.finalize(FinalizeReason::Parsing).unwrap();
        let clock = f.change_clock();
        let hash = f.find_base_type_by_name("task_struct").unwrap().hash();
        f.finalize(FinalizeReason::Parsing).unwrap();
        assert_eq!(f.change_clock(), clock);
        assert_eq!(f.find_base_type_by_name("task_struct").unwrap().hash(), hash);
    }

    #[test]
    fn dangling_reference_is_fatal() {
        let mut f = SymbolFactory::new();
        f.feed(TypeInfo::Type(TypeRecord::referencing(1, RealType::Pointer, 999, 8)))
            .unwrap();
        assert!(matches!(
            f.finalize(FinalizeReason::Parsing),
            Err(crate::error::InsightError::DanglingReference { missing: 999, .. })
        ));
    }

    #[test]
    fn duplicate_id_with_incompatible_kind_is_fatal() {
        let mut f = SymbolFactory::new();
        f.feed(TypeInfo::Type(TypeRecord::plain(1, RealType::Int32, Some("int"), 4)))
            .unwrap();
        let err = f.feed(TypeInfo::Type(TypeRecord::plain(1, RealType::Struct, Some("int"), 4)));
        assert!(err.is_err());
    }

    #[test]
    fn structurally_equal_types_merge() {
        let mut f = SymbolFactory::new();
        // Two identical "struct pair" definitions from different ids.
        for id in [20, 30] {
            f.feed(TypeInfo::Type(TypeRecord::plain(id + 1, RealType::Int32, Some("int"), 4)))
                .unwrap();
            let mut s = TypeRecord::plain(id, RealType::Struct, Some("pair"), 8);
            s.members = vec![
                MemberRecord { name: "a".into(), offset: 0, ref_type_id: id + 1, bit_size: -1, bit_offset: -1 },
                MemberRecord { name: "b".into(), offset: 4, ref_type_id: id + 1, bit_size: -1, bit_offset: -1 },
            ];
            f.feed(TypeInfo::Type(s)).unwrap();
        }
        // A pointer that referred to the duplicate definition.
        f.feed(TypeInfo::Type(TypeRecord::referencing(40, RealType::Pointer, 30, 8)))
            .unwrap();
        f.finalize(FinalizeReason::Parsing).unwrap();

        let a = f.find_base_type_by_id(20).unwrap();
        assert!(f.find_base_type_by_id(30).is_none(), "duplicate id merged away");
        let ptr = f.find_base_type_by_id(40).unwrap();
        assert_eq!(ptr.ref_type_id(), Some(20));
        // both name and hash indexes reflect the merge
        assert_eq!(f.types_by_hash(a.hash()), &[20]);
    }

    #[test]
    fn self_referential_types_hash_equal() {
        let mut f = SymbolFactory::new();
        for base in [50, 60] {
            f.feed(TypeInfo::Type(TypeRecord::referencing(base, RealType::Pointer, base + 1, 8)))
                .unwrap();
            let mut s = TypeRecord::plain(base + 1, RealType::Struct, Some("node"), 8);
            s.members = vec![MemberRecord {
                name: "next".into(),
                offset: 0,
                ref_type_id: base,
                bit_size: -1,
                bit_offset: -1,
            }];
            f.feed(TypeInfo::Type(s)).unwrap();
        }
        f.finalize(FinalizeReason::Parsing).unwrap();
        // The two cyclic definitions collapsed into one.
        assert!(f.find_base_type_by_id(51).is_some());
        assert!(f.find_base_type_by_id(61).is_none());
    }

    #[test]
    fn alternate_usage_appends_and_deduplicates() {
        let mut f = mini_factory();
        f.finalize(FinalizeReason::Parsing).unwrap();
        let socket_id = {
            let mut s = TypeRecord::plain(200, RealType::Struct, Some("socket"), 32);
            s.members = vec![];
            f.feed(TypeInfo::Type(s)).unwrap();
            f.finalize(FinalizeReason::Parsing).unwrap();
            200
        };
        let ev = AltTypeEvidence {
            target: AltUsageTarget::Member {
                type_name: "task_struct".into(),
                members: vec!["stack".into()],
            },
            candidate_id: socket_id,
            guard: GuardExpr::Constant(1),
        };
        assert!(f.type_alternate_usage(&ev).unwrap());
        assert!(!f.type_alternate_usage(&ev).unwrap(), "dedup");
        let task = f.find_base_type_by_name("task_struct").unwrap();
        let m = task.structured().unwrap().member("stack").unwrap();
        assert_eq!(m.alt_ref_types.len(), 1);
        assert_eq!(m.alt_ref_types[0].ref_type_id, socket_id);
    }

    #[test]
    fn persist_round_trip_is_observationally_equal() {
        let mut f = mini_factory();
        f.finalize(FinalizeReason::Parsing).unwrap();
        let ev = AltTypeEvidence {
            target: AltUsageTarget::Variable("init_task".into()),
            candidate_id: 11,
            guard: GuardExpr::Binary(
                GuardOp::Eq,
                Box::new(GuardExpr::MemberChain(vec!["pid".into()])),
                Box::new(GuardExpr::Constant(0)),
            ),
        };
        f.type_alternate_usage(&ev).unwrap();

        let specs = crate::memspecs::tests::x86_64_specs();
        let mut buf = Vec::new();
        persist::write(&specs, &f, &mut buf).unwrap();
        let (specs2, f2) = persist::read(&buf[..]).unwrap();

        assert_eq!(specs2.page_offset, specs.page_offset);
        assert_eq!(f2.type_count(), f.type_count());
        assert_eq!(f2.var_count(), f.var_count());
        for id in f.sorted_type_ids() {
            let a = f.find_base_type_by_id(id).unwrap();
            let b = f2.find_base_type_by_id(id).unwrap();
            assert_eq!(f.pretty_name(a), f2.pretty_name(b), "pretty name of id {id}");
            assert_eq!(a.hash(), b.hash(), "hash of id {id}");
        }
        let v = f2.find_var_by_name("init_task").unwrap();
        assert_eq!(v.alt_ref_types.len(), 1);
        assert_eq!(v.alt_ref_types[0], f.find_var_by_name("init_task").unwrap().alt_ref_types[0]);
    }

    #[test]
    fn unreferenced_typedef_leaves_name_index() {
        let mut f = SymbolFactory::new();
        f.feed(TypeInfo::Type(TypeRecord::plain(1, RealType::Int32, Some("int"), 4)))
            .unwrap();
        let mut td = TypeRecord::referencing(2, RealType::Typedef, 1, 4);
        td.name = Some("loose_alias".into());
        f.feed(TypeInfo::Type(td)).unwrap();
        f.finalize(FinalizeReason::Parsing).unwrap();
        assert!(f.find_base_type_by_name("loose_alias").is_none());
        assert!(f.find_base_type_by_id(2).is_some(), "still reachable by id");
    }
}
