//! End-to-end introspection over a synthetic dump: a miniature task list,
//! alternative-type resolution on a file-like struct, reverse-map
//! construction and the query front-end, all against a linear-mapped
//! 64 KiB physical image.

use std::io::Write;

use pretty_assertions::assert_eq;

use insight_engine::engine::KernelSymbols;
use insight_engine::instance::KnowledgeSources;
use insight_engine::symbols::{
    AltTypeEvidence, AltUsageTarget, FinalizeReason, GuardExpr, GuardOp, MemberRecord, RealType,
    RealTypeSet, SymbolFactory, TypeInfo, TypeRecord, VarRecord,
};
use insight_engine::{Arch, Engine, KernelVersion, MemSpecs, Origin, SystemMap};

const P: u64 = 0xffff_8800_0000_0000;
const TASK_SIZE: u32 = 48;
const TASKS_OFF: u64 = 24;

const INIT_TASK: u64 = P + 0x1000;
const TASK_B: u64 = P + 0x2000;
const TASK_C: u64 = P + 0x3000;
const SOCKET_FILE_OPS: u64 = P + 0x4000;
const TEST_FILE: u64 = P + 0x5000;
const SOCKET_OBJ: u64 = P + 0x2800;

fn specs() -> MemSpecs {
    MemSpecs {
        arch: Arch::X86_64,
        sizeof_pointer: 8,
        sizeof_long: 8,
        page_offset: P,
        vmalloc_start: P + 0x10000,
        vmalloc_end: P + 0x20000,
        vmemmap_start: 0,
        vmemmap_end: 0,
        modules_vaddr: 0,
        modules_end: 0,
        start_kernel_map: 0xffff_ffff_8000_0000,
        init_level4_pgt: 0xffff_ffff_8010_0000,
        swapper_pg_dir: 0,
        high_memory: 0,
        vmalloc_earlyreserve: 0,
        version: KernelVersion {
            sysname: "Linux".into(),
            release: "3.8-test".into(),
            version: "#1".into(),
            machine: "x86_64".into(),
        },
        system_map: SystemMap::default(),
    }
}

fn member(name: &str, offset: u32, ref_type_id: i32) -> MemberRecord {
    MemberRecord {
        name: name.into(),
        offset,
        ref_type_id,
        bit_size: -1,
        bit_offset: -1,
    }
}

fn factory() -> SymbolFactory {
    let mut f = SymbolFactory::new();
    let mut feed = |rec: TypeRecord| f.feed(TypeInfo::Type(rec)).unwrap();

    feed(TypeRecord::plain(1, RealType::Int8, Some("char"), 1));
    feed(TypeRecord::plain(2, RealType::Int32, Some("int"), 4));
    feed(TypeRecord::plain(3, RealType::Void, None, 0));
    // struct list_head { struct list_head *next, *prev; }
    feed(TypeRecord::referencing(10, RealType::Pointer, 11, 8));
    let mut list_head = TypeRecord::plain(11, RealType::Struct, Some("list_head"), 16);
    list_head.members = vec![member("next", 0, 10), member("prev", 8, 10)];
    feed(list_head);
    // char[16]
    let mut comm = TypeRecord::referencing(12, RealType::Array, 1, 16);
    comm.array_length = 16;
    feed(comm);
    // void *
    feed(TypeRecord::referencing(13, RealType::Pointer, 3, 8));
    // struct task_struct
    let mut task = TypeRecord::plain(14, RealType::Struct, Some("task_struct"), TASK_SIZE);
    task.members = vec![
        member("pid", 0, 2),
        member("comm", 4, 12),
        member("tasks", TASKS_OFF as u32, 11),
        member("stack", 40, 13),
    ];
    feed(task);
    // struct file_operations { void (*owner)(void); } stand-in
    let mut fops = TypeRecord::plain(20, RealType::Struct, Some("file_operations"), 8);
    fops.members = vec![member("owner", 0, 13)];
    feed(fops);
    feed(TypeRecord::referencing(21, RealType::Pointer, 20, 8));
    // struct socket + struct sock stand-ins, plus pointers to them
    let mut socket = TypeRecord::plain(22, RealType::Struct, Some("socket"), 16);
    socket.members = vec![member("state", 0, 2), member("pad", 4, 2)];
    feed(socket);
    feed(TypeRecord::referencing(23, RealType::Pointer, 22, 8));
    let mut sock = TypeRecord::plain(24, RealType::Struct, Some("sock"), 16);
    sock.members = vec![member("refcnt", 0, 2)];
    feed(sock);
    feed(TypeRecord::referencing(25, RealType::Pointer, 24, 8));
    // struct file { f_op; private_data; private_data2; }
    let mut file = TypeRecord::plain(26, RealType::Struct, Some("file"), 24);
    file.members = vec![
        member("f_op", 0, 21),
        member("private_data", 8, 13),
        member("private_data2", 16, 13),
    ];
    feed(file);

    let mut feed_var = |rec: VarRecord| f.feed(TypeInfo::Variable(rec)).unwrap();
    feed_var(VarRecord {
        id: 100,
        name: "init_task".into(),
        address: INIT_TASK,
        ref_type_id: 14,
        src_line: 0,
    });
    feed_var(VarRecord {
        id: 101,
        name: "socket_file_ops".into(),
        address: SOCKET_FILE_OPS,
        ref_type_id: 20,
        src_line: 0,
    });
    feed_var(VarRecord {
        id: 102,
        name: "test_file".into(),
        address: TEST_FILE,
        ref_type_id: 26,
        src_line: 0,
    });
    f.finalize(FinalizeReason::Parsing).unwrap();

    // private_data is used as a socket pointer when f_op points at the
    // socket file operations.
    let guard = GuardExpr::Binary(
        GuardOp::Eq,
        Box::new(GuardExpr::MemberChain(vec!["f_op".into()])),
        Box::new(GuardExpr::GlobalAddress("socket_file_ops".into())),
    );
    f.type_alternate_usage(&AltTypeEvidence {
        target: AltUsageTarget::Member {
            type_name: "file".into(),
            members: vec!["private_data".into()],
        },
        candidate_id: 23,
        guard: guard.clone(),
    })
    .unwrap();
    // private_data2 carries two candidates whose guards can both hold.
    f.type_alternate_usage(&AltTypeEvidence {
        target: AltUsageTarget::Member {
            type_name: "file".into(),
            members: vec!["private_data2".into()],
        },
        candidate_id: 23,
        guard,
    })
    .unwrap();
    f.type_alternate_usage(&AltTypeEvidence {
        target: AltUsageTarget::Member {
            type_name: "file".into(),
            members: vec!["private_data2".into()],
        },
        candidate_id: 25,
        guard: GuardExpr::Constant(1),
    })
    .unwrap();
    f
}

fn image() -> Vec<u8> {
    let mut mem = vec![0u8; 0x10000];
    let put_u64 = |mem: &mut Vec<u8>, vaddr: u64, value: u64| {
        let off = (vaddr - P) as usize;
        mem[off..off + 8].copy_from_slice(&value.to_le_bytes());
    };
    let put_u32 = |mem: &mut Vec<u8>, vaddr: u64, value: u32| {
        let off = (vaddr - P) as usize;
        mem[off..off + 4].copy_from_slice(&value.to_le_bytes());
    };
    let put_str = |mem: &mut Vec<u8>, vaddr: u64, s: &str| {
        let off = (vaddr - P) as usize;
        mem[off..off + s.len()].copy_from_slice(s.as_bytes());
    };

    // Three tasks on a circular list.
    for (addr, pid, comm, next, prev) in [
        (INIT_TASK, 0u32, "swapper/0", TASK_B, TASK_C),
        (TASK_B, 1, "init", TASK_C, INIT_TASK),
        (TASK_C, 2, "kthreadd", INIT_TASK, TASK_B),
    ] {
        put_u32(&mut mem, addr, pid);
        put_str(&mut mem, addr + 4, comm);
        put_u64(&mut mem, addr + TASKS_OFF, next + TASKS_OFF);
        put_u64(&mut mem, addr + TASKS_OFF + 8, prev + TASKS_OFF);
        put_u64(&mut mem, addr + 40, 0); // stack
    }
    // The file object: f_op -> socket_file_ops, private data -> a socket.
    put_u64(&mut mem, TEST_FILE, SOCKET_FILE_OPS);
    put_u64(&mut mem, TEST_FILE + 8, SOCKET_OBJ);
    put_u64(&mut mem, TEST_FILE + 16, SOCKET_OBJ);
    put_u32(&mut mem, SOCKET_OBJ, 3); // socket.state
    mem
}

fn engine_with_dump() -> (Engine, tempfile::NamedTempFile) {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&image()).unwrap();
    file.flush().unwrap();

    let mut engine = Engine::new();
    engine.set_symbols(KernelSymbols {
        specs: specs(),
        factory: factory(),
    });
    let index = engine.load_memory_dump(file.path()).unwrap();
    assert_eq!(index, 0);
    (engine, file)
}

#[test]
fn global_lookup_renders_comm() {
    let (engine, _file) = engine_with_dump();
    let symbols = engine.symbols().unwrap();
    let dump = engine.dump(0).unwrap();

    let inst = dump
        .query_instance(&symbols.factory, "init_task.comm")
        .unwrap();
    assert_eq!(inst.type_name(), "char[16]");
    assert_eq!(inst.address(), INIT_TASK + 4);
    assert_eq!(inst.render(), "\"swapper/0\"");
}

#[test]
fn linked_list_traversal_returns_to_head() {
    let (engine, _file) = engine_with_dump();
    let symbols = engine.symbols().unwrap();
    let dump = engine.dump(0).unwrap();
    let factory = &symbols.factory;

    let mut current = dump
        .instance_at(factory, "task_struct", INIT_TASK, Vec::new())
        .unwrap();
    let mut pids = Vec::new();
    loop {
        pids.push(
            current
                .member("pid", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty())
                .to_int64()
                .unwrap(),
        );
        let next_tasks = current
            .member("tasks", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty())
            .member("next", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty())
            .to_pointer()
            .unwrap();
        current = dump
            .instance_at(factory, "task_struct", next_tasks - TASKS_OFF, Vec::new())
            .unwrap();
        if current.address() == INIT_TASK {
            break;
        }
        assert!(pids.len() <= 3, "list did not cycle back to init_task");
    }
    assert_eq!(pids, vec![0, 1, 2]);
}

#[test]
fn query_next_follows_pointer() {
    let (engine, _file) = engine_with_dump();
    let symbols = engine.symbols().unwrap();
    let dump = engine.dump(0).unwrap();

    let inst = dump
        .query_instance(&symbols.factory, "init_task.tasks.next")
        .unwrap();
    // The trailing pointer is dereferenced to the next element's list head.
    assert_eq!(inst.type_name(), "struct list_head");
    assert_eq!(inst.address(), TASK_B + TASKS_OFF);
}

#[test]
fn cast_with_member_offset_recovers_container() {
    let (engine, _file) = engine_with_dump();
    let symbols = engine.symbols().unwrap();
    let dump = engine.dump(0).unwrap();

    // The container_of idiom: cast the list pointer back to its embedding
    // task_struct by subtracting the offset of the "tasks" member.
    let container = dump
        .query_instance(&symbols.factory, "init_task.tasks.(task_struct-tasks)next")
        .unwrap();
    assert_eq!(container.type_name(), "struct task_struct");
    assert_eq!(container.address(), TASK_B);
    assert_eq!(
        container
            .member("pid", RealTypeSet::TR_LEXICAL, KnowledgeSources::empty())
            .to_int64(),
        Some(1)
    );

    // The numeric-offset form lands at the same place.
    let by_bytes = dump
        .query_instance(&symbols.factory, "init_task.tasks.(task_struct-24)next")
        .unwrap();
    assert_eq!(by_bytes.address(), TASK_B);
}

#[test]
fn alternative_type_resolution() {
    let (engine, _file) = engine_with_dump();
    let symbols = engine.symbols().unwrap();
    let dump = engine.dump(0).unwrap();
    let factory = &symbols.factory;

    let file = dump
        .instance_at(factory, "file", TEST_FILE, Vec::new())
        .unwrap();

    // Guard holds: private_data resolves to the socket pointer candidate.
    let pd = file.member(
        "private_data",
        RealTypeSet::TR_LEXICAL,
        KnowledgeSources::ALT_TYPES,
    );
    assert_eq!(pd.type_name(), "struct socket *");
    assert_eq!(pd.origin(), Origin::Candidate);
    assert!(!pd.is_ambiguous());

    // Without the knowledge source the declared type stays.
    let pd_plain = file.member(
        "private_data",
        RealTypeSet::TR_LEXICAL,
        KnowledgeSources::empty(),
    );
    assert_eq!(pd_plain.type_name(), "void *");

    // Two passing guards surface as ambiguity.
    let pd2 = file.member(
        "private_data2",
        RealTypeSet::TR_LEXICAL,
        KnowledgeSources::ALT_TYPES,
    );
    assert_eq!(pd2.origin(), Origin::Candidate);
    assert!(pd2.is_ambiguous());

    // The query layer resolves through to the socket object.
    let sock = dump
        .query_instance(factory, "test_file.private_data")
        .unwrap();
    assert_eq!(sock.address(), SOCKET_OBJ);
    assert_eq!(sock.type_name(), "struct socket");

    // A candidate index of zero disables alternative resolution; the final
    // pointer still resolves, landing on an untyped view of the target.
    let plain = dump
        .query_instance(factory, "test_file.private_data<0>")
        .unwrap();
    assert_eq!(plain.address(), SOCKET_OBJ);
    assert_eq!(plain.type_name(), "void");
}

#[test]
fn reverse_map_covers_translatable_globals() {
    let (engine, _file) = engine_with_dump();
    let map = engine.revmap(0).unwrap();
    insight_engine::interrupt::clear();
    let summary = map.build().unwrap();

    // All three globals translate, so all three become roots.
    assert_eq!(summary.roots, 3);
    assert!(!summary.interrupted);
    assert!(summary.nodes >= 3);

    for id in 0..map.node_count() {
        let node = map.node(id).unwrap();
        assert!(
            (0.01..=1.0).contains(&node.probability),
            "probability {} of node {} out of range",
            node.probability,
            id
        );
        // The range tree covers every node's own interval.
        let end = node.end_address(map.vmem().specs().vaddr_space_end());
        let hits = map.objects_in_range(node.address, end);
        assert!(
            hits.iter().any(|e| e.node == id) || node.size == 0,
            "node {id} not found in its own range"
        );
    }

    // Parent probability bounds child probability via generation decay.
    for id in 0..map.node_count() {
        let node = map.node(id).unwrap();
        if let Some(parent) = node.parent {
            let p = map.node(parent).unwrap();
            assert!(
                p.probability >= node.probability / 0.99 - f32::EPSILON * 8.0,
                "generation decay violated: parent {} child {}",
                p.probability,
                node.probability
            );
        }
    }
}

#[test]
fn dump_diff_finds_planted_change() {
    let (_engine, file) = engine_with_dump();

    // A second image with five patched bytes.
    let mut other_image = image();
    let hook_off = (INIT_TASK - P) as usize + 4;
    other_image[hook_off..hook_off + 5].copy_from_slice(&[0xe9, 1, 2, 3, 4]);
    let mut other_file = tempfile::NamedTempFile::new().unwrap();
    other_file.write_all(&other_image).unwrap();
    other_file.flush().unwrap();

    let mut engine2 = Engine::new();
    engine2.set_symbols(KernelSymbols {
        specs: specs(),
        factory: factory(),
    });
    engine2.load_memory_dump(file.path()).unwrap();
    engine2.load_memory_dump(other_file.path()).unwrap();

    insight_engine::interrupt::clear();
    let a = engine2.revmap(0).unwrap();
    let b = engine2.revmap(1).unwrap();
    a.diff_with(&b).unwrap();
    assert_eq!(a.diff_run_count(), 1);
    // "swapp" vs the planted five bytes differs over the whole run.
    assert_eq!(a.diff_byte_count(), 5);
    let runs = a.diff_runs_in_range(0, u64::MAX);
    assert_eq!(runs[0].start, (INIT_TASK - P) + 4);
}
