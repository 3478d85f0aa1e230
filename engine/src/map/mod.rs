//! The reverse map: a rooted forest over every kernel object transitively
//! reachable from the global variables, with a heuristic probability per
//! node and a range-tree index over the virtual address space.

pub mod builder;
pub mod diff;
pub mod node;
pub mod rangetree;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use hashbrown::HashSet;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::instance::{Instance, KnowledgeSources, Origin};
use crate::interrupt;
use crate::symbols::{RealType, RealTypeSet, SymbolFactory, TypeKind};
use crate::vmem::VirtualMemory;

use builder::{AddressLocks, QueueItem, WorkQueue};
use diff::MemoryDiffTree;
use node::{intern_name, MemoryMapNode, NodeId};
use rangetree::{MemoryRangeTree, RangeEntry, RangeProperties};

/// A probability difference below this is noise; candidates inside the
/// window coexist with what the tree already holds.
const PROB_SIGNIFICANCE_DELTA: f32 = 0.1;

const DEG_PER_GENERATION: f32 = 0.99;
const DEG_FOR_UNALIGNED_ADDR: f32 = 0.8;
const DEG_FOR_USERLAND_ADDR: f32 = 0.95;
const DEG_FOR_INVALID_ADDR: f32 = 0.1;
const DEG_FOR_NON_ALIGNED_CHILD_ADDR: f32 = 0.95;
const DEG_FOR_INVALID_CHILD_ADDR: f32 = 0.9;

const MIN_PROBABILITY: f32 = 0.01;
const MAX_BUILDER_THREADS: usize = 8;

/// Member kinds worth recursing into.
const INTERESTING: RealTypeSet = RealTypeSet::TR_LEXICAL
    .union(RealTypeSet::POINTER)
    .union(RealTypeSet::ARRAY)
    .union(RealTypeSet::FUNC_POINTER)
    .union(RealTypeSet::STRUCT_OR_UNION);

#[derive(Debug, Default)]
struct DegradationCounters {
    per_generation: AtomicU64,
    unaligned_addr: AtomicU64,
    userland_addr: AtomicU64,
    invalid_addr: AtomicU64,
    non_aligned_child: AtomicU64,
    invalid_child: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildSummary {
    pub processed: u64,
    pub nodes: usize,
    pub roots: usize,
    pub interrupted: bool,
}

pub struct MemoryMap<'a> {
    factory: &'a SymbolFactory,
    vmem: &'a VirtualMemory,
    nodes: RwLock<Vec<MemoryMapNode>>,
    roots: Mutex<Vec<NodeId>>,
    vmem_map: RwLock<MemoryRangeTree>,
    vmem_addresses: Mutex<HashSet<u64>>,
    pmem_diff: Mutex<MemoryDiffTree>,
    prob_propagation: bool,
    processed: AtomicU64,
    degradations: DegradationCounters,
}

impl<'a> MemoryMap<'a> {
    pub fn new(factory: &'a SymbolFactory, vmem: &'a VirtualMemory) -> MemoryMap<'a> {
        let end = vmem.specs().vaddr_space_end();
        MemoryMap {
            factory,
            vmem,
            nodes: RwLock::new(Vec::new()),
            roots: Mutex::new(Vec::new()),
            vmem_map: RwLock::new(MemoryRangeTree::new(end)),
            vmem_addresses: Mutex::new(HashSet::new()),
            pmem_diff: Mutex::new(MemoryDiffTree::default()),
            prob_propagation: false,
            processed: AtomicU64::new(0),
            degradations: DegradationCounters::default(),
        }
    }

    pub fn vmem(&self) -> &'a VirtualMemory {
        self.vmem
    }

    pub fn factory(&self) -> &'a SymbolFactory {
        self.factory
    }

    /// Propagate probability changes downward when a node is rescored.
    pub fn set_probability_propagation(&mut self, enabled: bool) {
        self.prob_propagation = enabled;
    }

    pub fn clear(&mut self) {
        self.nodes.write().unwrap_or_else(|p| p.into_inner()).clear();
        self.roots.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.vmem_map
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        self.vmem_addresses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        self.processed.store(0, Ordering::Relaxed);
    }

    // ---- node access -----------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<MemoryMapNode> {
        self.nodes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn root_ids(&self) -> Vec<NodeId> {
        self.roots.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn object_count(&self) -> usize {
        self.vmem_map
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .object_count()
    }

    pub fn address_count(&self) -> usize {
        self.vmem_addresses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    pub fn objects_in_range(&self, start: u64, end: u64) -> Vec<RangeEntry> {
        self.vmem_map
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .objects_in_range(start, end)
    }

    pub fn objects_at(&self, address: u64) -> Vec<RangeEntry> {
        self.objects_in_range(address, address)
    }

    pub fn properties_of_range(&self, start: u64, end: u64) -> RangeProperties {
        self.vmem_map
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .properties_of_range(start, end)
    }

    /// Dotted full name of a node, ancestors included.
    pub fn node_full_name(&self, id: NodeId) -> String {
        let nodes = self.nodes.read().unwrap_or_else(|p| p.into_inner());
        let mut parts: Vec<&str> = Vec::new();
        let mut current = Some(id);
        while let Some(i) = current {
            let Some(n) = nodes.get(i) else { break };
            if !n.name.is_empty() {
                parts.push(&n.name);
            }
            current = n.parent;
        }
        parts.reverse();
        parts.join(".").replace(".[", "[")
    }

    /// Reconstructs a typed instance for a node.
    pub fn node_instance(&self, id: NodeId) -> Instance<'a> {
        let Some(n) = self.node(id) else {
            return Instance::invalid(self.factory);
        };
        let Some(ty) = self.factory.find_base_type_by_id(n.type_id) else {
            return Instance::invalid(self.factory);
        };
        let parents = match n.parent {
            Some(p) => {
                let full = self.node_full_name(p);
                if full.is_empty() {
                    Vec::new()
                } else {
                    full.split('.').map(str::to_owned).collect()
                }
            }
            None => Vec::new(),
        };
        let mut inst = Instance::new(
            self.factory,
            self.vmem,
            n.address,
            ty,
            n.name.as_ref(),
            parents,
            n.id,
            Origin::MemMapNode,
        );
        inst.set_origin(Origin::MemMapNode);
        inst
    }

    /// Marks a node plausible; the flag climbs to every ancestor.
    pub fn set_seems_valid(&self, id: NodeId) {
        let mut nodes = self.nodes.write().unwrap_or_else(|p| p.into_inner());
        let mut current = Some(id);
        while let Some(i) = current {
            let Some(n) = nodes.get_mut(i) else { break };
            if n.seems_valid {
                break;
            }
            n.seems_valid = true;
            current = n.parent;
        }
    }

    // ---- address sanity --------------------------------------------------

    fn fits_in_vmem(&self, address: u64, size: u64) -> bool {
        if self.vmem.specs().is_64bit() {
            address.checked_add(size).is_some()
        } else {
            address + size <= (1u64 << 32)
        }
    }

    fn address_is_well_formed(&self, address: u64) -> bool {
        if address == 0 {
            return false;
        }
        if !self.vmem.specs().is_64bit() {
            address <= u32::MAX as u64
        } else {
            let high = address >> 47;
            high == 0 || high == 0x1ffff
        }
    }

    // ---- probability scoring ---------------------------------------------

    /// Heuristic probability of `inst` being a real object, starting from
    /// the parent's probability and applying monotone decaying factors.
    pub fn calculate_node_probability(
        &self,
        inst: &Instance<'_>,
        parent_probability: Option<f32>,
    ) -> f32 {
        let mut prob = match parent_probability {
            Some(p) => {
                self.degradations
                    .per_generation
                    .fetch_add(1, Ordering::Relaxed);
                p * DEG_PER_GENERATION
            }
            None => 1.0,
        };

        if inst.address() < self.vmem.specs().page_offset {
            prob *= DEG_FOR_USERLAND_ADDR;
            self.degradations
                .userland_addr
                .fetch_add(1, Ordering::Relaxed);
        }

        if !self.vmem.safe_seek(inst.address()) {
            prob *= DEG_FOR_INVALID_ADDR;
            self.degradations
                .invalid_addr
                .fetch_add(1, Ordering::Relaxed);
        } else if inst.address() & 0x3 != 0 {
            prob *= DEG_FOR_UNALIGNED_ADDR;
            self.degradations
                .unaligned_addr
                .fetch_add(1, Ordering::Relaxed);
        }

        // Embedded pointers of a structured type weigh in individually.
        if let Some(ty) = inst.ty() {
            let ty = self.factory.dereferenced_type(ty, RealTypeSet::TR_LEXICAL);
            if let Some(s) = ty.structured() {
                for m in &s.members {
                    let Some(mt) = self.factory.find_base_type_by_id(m.ref_type_id) else {
                        continue;
                    };
                    let mt = self.factory.dereferenced_type(mt, RealTypeSet::TR_LEXICAL);
                    if mt.real_type() != RealType::Pointer {
                        continue;
                    }
                    let maddr = inst.address().wrapping_add(m.offset as u64);
                    if !self.vmem.safe_seek(maddr) {
                        prob *= DEG_FOR_INVALID_CHILD_ADDR;
                        self.degradations
                            .invalid_child
                            .fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    match self.vmem.to_pointer(maddr) {
                        Ok(target) if self.vmem.safe_seek(target) => {
                            if target & 0x3 != 0 {
                                prob *= DEG_FOR_NON_ALIGNED_CHILD_ADDR;
                                self.degradations
                                    .non_aligned_child
                                    .fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        _ => {
                            prob *= DEG_FOR_INVALID_CHILD_ADDR;
                            self.degradations
                                .invalid_child
                                .fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }

        prob.clamp(MIN_PROBABILITY, 1.0)
    }

    // ---- build -----------------------------------------------------------

    /// Builds the reverse map from all translatable global variables.
    /// Cooperative interruption leaves a consistent partial forest.
    pub fn build(&self) -> Result<BuildSummary> {
        let started = Instant::now();
        self.processed.store(0, Ordering::Relaxed);

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_BUILDER_THREADS);
        info!(workers, "building reverse map");

        let queue = WorkQueue::new(workers);
        let addr_locks = AddressLocks::new();

        // Seed: one root per global variable whose address translates.
        let mut roots = 0usize;
        for var in self.factory.vars() {
            let inst =
                Instance::of_variable(self.factory, self.vmem, var, KnowledgeSources::ALT_TYPES);
            if inst.is_null()
                || !inst.is_valid()
                || !self.address_is_well_formed(inst.address())
                || !self.fits_in_vmem(inst.address(), inst.size())
                || !self.vmem.safe_seek(inst.address())
            {
                continue;
            }
            let prob = self.calculate_node_probability(&inst, None);
            let (address, end, rtype, type_hash) = (
                inst.address(),
                inst.end_address(),
                inst.ty()
                    .map(|t| t.real_type().bit())
                    .unwrap_or(RealTypeSet::empty()),
                inst.ty().map(|t| t.hash()).unwrap_or(0),
            );
            let id = self.insert_node(&inst, None, prob, var.id);
            self.roots.lock().unwrap_or_else(|p| p.into_inner()).push(id);
            self.vmem_map
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .insert(RangeEntry {
                    node: id,
                    start: address,
                    end,
                    probability: prob,
                    rtype,
                    type_hash,
                });
            self.vmem_addresses
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(address);
            queue.push(QueueItem {
                probability: prob,
                node: id,
            });
            roots += 1;
        }
        debug!(roots, "seeded reverse-map roots");

        let was_thread_safe = self.vmem.set_thread_safety(workers > 1);

        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| self.worker_loop(&queue, &addr_locks));
            }
            // The scope joins the workers; the main thread only has to
            // forward an interrupt into the queue so blocked workers wake.
            while !queue.is_done() {
                if interrupt::interrupted() {
                    queue.shutdown();
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
        });

        self.vmem.set_thread_safety(was_thread_safe);

        let summary = BuildSummary {
            processed: self.processed.load(Ordering::Relaxed),
            nodes: self.node_count(),
            roots,
            interrupted: interrupt::interrupted(),
        };
        let secs = started.elapsed().as_secs_f64().max(1e-9);
        info!(
            processed = summary.processed,
            nodes = summary.nodes,
            objects = self.object_count(),
            addresses = self.address_count(),
            per_second = (summary.processed as f64 / secs) as u64,
            "reverse map built"
        );
        debug!(
            per_generation = self.degradations.per_generation.load(Ordering::Relaxed),
            unaligned_addr = self.degradations.unaligned_addr.load(Ordering::Relaxed),
            userland_addr = self.degradations.userland_addr.load(Ordering::Relaxed),
            invalid_addr = self.degradations.invalid_addr.load(Ordering::Relaxed),
            non_aligned_child = self.degradations.non_aligned_child.load(Ordering::Relaxed),
            invalid_child = self.degradations.invalid_child.load(Ordering::Relaxed),
            "probability degradation counters"
        );
        Ok(summary)
    }

    fn worker_loop(&self, queue: &WorkQueue, addr_locks: &AddressLocks) {
        loop {
            if interrupt::interrupted() {
                queue.shutdown();
                return;
            }
            let Some(item) = queue.pop() else { return };
            self.process_node(item.node, queue, addr_locks);
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Structural recursion of the build: members of structs, elements of
    /// arrays, targets of pointers to structured types.
    fn process_node(&self, id: NodeId, queue: &WorkQueue, addr_locks: &AddressLocks) {
        let inst = self.node_instance(id);
        let Some(ty) = inst.ty() else { return };
        let ty = self.factory.dereferenced_type(ty, RealTypeSet::TR_LEXICAL);

        match &ty.kind {
            TypeKind::Struct(s) | TypeKind::Union(s) => {
                for i in 0..s.members.len() {
                    let child = inst.member_at(i, RealTypeSet::TR_LEXICAL);
                    self.add_child_if_not_existent(&child, id, queue, addr_locks);
                }
            }
            TypeKind::Array(_) => {
                let len = inst.array_length().unwrap_or(0);
                for i in 0..len {
                    let child = inst.array_elem(i);
                    self.add_child_if_not_existent(&child, id, queue, addr_locks);
                }
            }
            TypeKind::Pointer(_) => {
                let target = inst.dereference(RealTypeSet::TR_LEXICAL_POINTERS);
                if target.is_valid() && !target.is_null() {
                    let tt = target
                        .ty()
                        .map(|t| self.factory.dereferenced_type(t, RealTypeSet::TR_LEXICAL));
                    if tt.is_some_and(|t| {
                        t.is(RealTypeSet::STRUCT_OR_UNION | RealTypeSet::ARRAY)
                    }) {
                        self.add_child_if_not_existent(&target, id, queue, addr_locks);
                    }
                }
            }
            _ => {}
        }
    }

    /// Gatekeeper for new nodes: serializes per address, scores, checks the
    /// existing coverage, and publishes a fully built node or nothing.
    fn add_child_if_not_existent(
        &self,
        inst: &Instance<'a>,
        parent: NodeId,
        queue: &WorkQueue,
        addr_locks: &AddressLocks,
    ) -> bool {
        let inst = if inst
            .ty()
            .is_some_and(|t| t.is(RealTypeSet::TR_LEXICAL))
        {
            inst.dereference(RealTypeSet::TR_LEXICAL)
        } else {
            inst.clone()
        };
        if inst.is_null() || !inst.is_valid() {
            return false;
        }
        let Some(ty) = inst.ty() else { return false };
        if !ty.is(INTERESTING) {
            return false;
        }
        if !self.address_is_well_formed(inst.address())
            || !self.fits_in_vmem(inst.address(), inst.size())
        {
            return false;
        }

        let parent_prob = self
            .node(parent)
            .map(|n| n.probability)
            .unwrap_or(1.0);

        // Serialize work on this address across the pool.
        let _slot = addr_locks.acquire(inst.address());

        let prob = self.calculate_node_probability(&inst, Some(parent_prob));
        let type_hash = ty.hash();

        let mut to_replace: Vec<RangeEntry> = Vec::new();
        {
            let tree = self.vmem_map.read().unwrap_or_else(|p| p.into_inner());
            for e in tree.objects_in_range(inst.address(), inst.end_address()) {
                if e.start == inst.address() && e.type_hash == type_hash {
                    if e.probability >= prob {
                        return false;
                    }
                    if prob > e.probability + PROB_SIGNIFICANCE_DELTA {
                        to_replace.push(e);
                    } else {
                        return false;
                    }
                } else if prob + PROB_SIGNIFICANCE_DELTA <= e.probability {
                    // A significantly more probable object overlaps.
                    return false;
                }
            }
        }

        let id = self.insert_node(&inst, Some(parent), prob, -1);
        {
            let mut tree = self.vmem_map.write().unwrap_or_else(|p| p.into_inner());
            for e in &to_replace {
                tree.remove(e.node, e.start, e.end);
            }
            tree.insert(RangeEntry {
                node: id,
                start: inst.address(),
                end: inst.end_address(),
                probability: prob,
                rtype: ty.real_type().bit(),
                type_hash,
            });
        }
        self.vmem_addresses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(inst.address());
        queue.push(QueueItem {
            probability: prob,
            node: id,
        });
        true
    }

    fn insert_node(
        &self,
        inst: &Instance<'a>,
        parent: Option<NodeId>,
        probability: f32,
        var_id: i32,
    ) -> NodeId {
        let mut nodes = self.nodes.write().unwrap_or_else(|p| p.into_inner());
        let name = match parent {
            Some(p) => {
                let parent_name = nodes.get(p).map(|n| n.name.to_string());
                MemoryMapNode::derive_name(parent_name.as_deref(), inst)
            }
            None => intern_name(inst.name()),
        };
        let id = nodes.len();
        nodes.push(MemoryMapNode {
            name,
            address: inst.address(),
            type_id: inst.type_id(),
            type_hash: inst.ty().map(|t| t.hash()).unwrap_or(0),
            size: inst.size(),
            probability,
            parent,
            children: Vec::new(),
            seems_valid: false,
            found_in_ptr_chains: 0,
            id: var_id,
        });
        if let Some(p) = parent {
            if let Some(pn) = nodes.get_mut(p) {
                pn.children.push(id);
            }
        }
        id
    }

    /// Rescores a node; with propagation enabled the change scales every
    /// descendant by the same ratio.
    pub fn update_probability(&self, id: NodeId, probability: f32) {
        let mut nodes = self.nodes.write().unwrap_or_else(|p| p.into_inner());
        let Some(n) = nodes.get_mut(id) else { return };
        let old = n.probability;
        if old == probability {
            return;
        }
        n.probability = probability;
        if !self.prob_propagation || old <= 0.0 {
            return;
        }
        let ratio = probability / old;
        let mut stack: Vec<NodeId> = nodes[id].children.clone();
        while let Some(c) = stack.pop() {
            if let Some(cn) = nodes.get_mut(c) {
                cn.probability = (cn.probability * ratio).clamp(MIN_PROBABILITY, 1.0);
                stack.extend(cn.children.iter().copied());
            }
        }
    }

    // ---- diff ------------------------------------------------------------

    /// Byte-compares the two underlying physical images and records the
    /// differing runs. Runs are merged while scanning.
    pub fn diff_with(&self, other: &MemoryMap<'_>) -> Result<()> {
        const BUFSIZE: usize = 1024;
        let mut diff = MemoryDiffTree::default();
        let total = self.vmem.size().min(other.vmem.size());
        let mut buf1 = [0u8; BUFSIZE];
        let mut buf2 = [0u8; BUFSIZE];
        let mut addr = 0u64;
        let mut run_start = 0u64;
        let mut run_len = 0u64;
        let mut last_percent = 0u64;

        while addr < total {
            if interrupt::interrupted() {
                warn!("memory diff interrupted at {addr:#x}");
                break;
            }
            let n1 = self.vmem.read_physical(addr, &mut buf1)?;
            let n2 = other.vmem.read_physical(addr, &mut buf2)?;
            let n = n1.min(n2);
            if n == 0 {
                break;
            }
            for i in 0..n {
                if buf1[i] != buf2[i] {
                    if run_len == 0 {
                        run_start = addr + i as u64;
                    }
                    run_len += 1;
                } else if run_len > 0 {
                    diff.insert(run_start, run_len);
                    run_len = 0;
                }
            }
            addr += n as u64;
            let percent = addr * 100 / total.max(1);
            if percent != last_percent {
                debug!("comparing memory dumps: {percent}%");
                last_percent = percent;
            }
        }
        if run_len > 0 {
            diff.insert(run_start, run_len);
        }
        info!(
            runs = diff.run_count(),
            bytes = diff.byte_count(),
            "memory diff finished"
        );
        *self.pmem_diff.lock().unwrap_or_else(|p| p.into_inner()) = diff;
        Ok(())
    }

    pub fn diff_run_count(&self) -> usize {
        self.pmem_diff
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .run_count()
    }

    pub fn diff_byte_count(&self) -> u64 {
        self.pmem_diff
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .byte_count()
    }

    pub fn diff_runs_in_range(&self, start: u64, end: u64) -> Vec<diff::DiffRun> {
        self.pmem_diff
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .runs_in_range(start, end)
            .to_vec()
    }
}
