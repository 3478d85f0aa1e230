// cli/src/output.rs — rendering of engine results for the terminal.

use colored::Colorize;

use insight_engine::error::InsightError;
use insight_engine::map::{BuildSummary, MemoryMap};
use insight_engine::symbols::{RealType, TypeKind};
use insight_engine::verify::VerifyReport;
use insight_engine::{Engine, Instance, Result};

pub fn list_types(engine: &Engine, filter: Option<&str>) -> Result<()> {
    let symbols = engine.symbols()?;
    let mut rows: Vec<(i32, String, u32, u32)> = symbols
        .factory
        .types()
        .filter_map(|t| {
            let name = symbols.factory.pretty_name(t);
            match filter {
                Some(f) if !name.contains(f) => None,
                _ => Some((t.id, name, t.size, t.hash())),
            }
        })
        .collect();
    rows.sort_by_key(|r| r.0);
    println!(
        "{}",
        format!("{:>10}  {:<48} {:>8}  {:>8}", "ID", "Type", "Size", "Hash").bold()
    );
    for (id, name, size, hash) in &rows {
        println!("{id:>10}  {name:<48} {size:>8}  {hash:>8x}");
    }
    println!("{} types", rows.len());
    Ok(())
}

pub fn list_variables(engine: &Engine, filter: Option<&str>) -> Result<()> {
    let symbols = engine.symbols()?;
    let mut rows: Vec<(i32, String, u64, String)> = symbols
        .factory
        .vars()
        .filter_map(|v| {
            match filter {
                Some(f) if !v.name.contains(f) => None,
                _ => {
                    let ty = symbols
                        .factory
                        .find_base_type_by_id(v.ref_type_id)
                        .map(|t| symbols.factory.pretty_name(t))
                        .unwrap_or_else(|| "?".into());
                    Some((v.id, v.name.clone(), v.address, ty))
                }
            }
        })
        .collect();
    rows.sort_by_key(|r| r.0);
    println!(
        "{}",
        format!("{:>10}  {:<32} {:>18}  Type", "ID", "Name", "Address").bold()
    );
    for (id, name, address, ty) in &rows {
        println!("{id:>10}  {name:<32} {address:>#18x}  {ty}");
    }
    println!("{} variables", rows.len());
    Ok(())
}

pub fn show(engine: &Engine, name: &str) -> Result<()> {
    let symbols = engine.symbols()?;
    let factory = &symbols.factory;

    if let Some(var) = factory.find_var_by_name(name) {
        let ty = factory
            .find_base_type_by_id(var.ref_type_id)
            .map(|t| factory.pretty_name(t))
            .unwrap_or_else(|| "?".into());
        println!("{} {}", "Variable".bold(), var.name);
        println!("  id:        {}", var.id);
        println!("  address:   {:#x}", var.address);
        println!("  type:      {ty}");
        for (i, alt) in var.alt_ref_types.iter().enumerate() {
            let alt_name = factory
                .find_base_type_by_id(alt.ref_type_id)
                .map(|t| factory.pretty_name(t))
                .unwrap_or_else(|| "?".into());
            println!("  candidate {}: {alt_name}", i + 1);
        }
        return Ok(());
    }

    let ty = match name.parse::<i32>() {
        Ok(id) => factory.find_base_type_by_id(id),
        Err(_) => factory.find_base_type_by_name(name),
    };
    let Some(ty) = ty else {
        return Err(InsightError::Query(format!(
            "no type or variable named \"{name}\""
        )));
    };
    println!("{} {}", "Type".bold(), factory.pretty_name(ty));
    println!("  id:    {}", ty.id);
    println!("  kind:  {}", ty.real_type().name());
    println!("  size:  {}", ty.size);
    println!("  hash:  {:#x}", ty.hash());
    match &ty.kind {
        TypeKind::Struct(s) | TypeKind::Union(s) => {
            println!("  members:");
            for m in &s.members {
                let mt = factory
                    .find_base_type_by_id(m.ref_type_id)
                    .map(|t| factory.pretty_name(t))
                    .unwrap_or_else(|| "?".into());
                let name = if m.name.is_empty() { "<anonymous>" } else { &m.name };
                if m.is_bitfield() {
                    println!(
                        "    {:>6}  {name}: {mt} : {} (bit {})",
                        m.offset, m.bit_size, m.bit_offset
                    );
                } else {
                    println!("    {:>6}  {name}: {mt}", m.offset);
                }
                for (i, alt) in m.alt_ref_types.iter().enumerate() {
                    let alt_name = factory
                        .find_base_type_by_id(alt.ref_type_id)
                        .map(|t| factory.pretty_name(t))
                        .unwrap_or_else(|| "?".into());
                    println!("            candidate {}: {alt_name}", i + 1);
                }
            }
        }
        TypeKind::Enum(e) => {
            println!("  enumerators:");
            for (name, value) in &e.values {
                println!("    {name} = {value}");
            }
        }
        TypeKind::Function(f) => {
            println!("  pc:    {:#x}..{:#x}", f.pc_low, f.pc_high);
        }
        _ => {}
    }
    if ty.real_type() == RealType::Pointer {
        for (i, alt) in ty.alt_ref_types().iter().enumerate() {
            let alt_name = factory
                .find_base_type_by_id(alt.ref_type_id)
                .map(|t| factory.pretty_name(t))
                .unwrap_or_else(|| "?".into());
            println!("  candidate {}: {alt_name}", i + 1);
        }
    }
    Ok(())
}

pub fn list_dumps(engine: &Engine) {
    for dump in engine.dumps() {
        println!(
            "[{}] {} ({} bytes)",
            dump.index(),
            dump.file_name().display(),
            dump.vmem().size()
        );
    }
}

pub fn specs(engine: &Engine, index: usize) -> Result<()> {
    let dump = engine.dump(index)?;
    let s = dump.specs();
    println!("{}", format!("Memory specifications of dump {index}").bold());
    println!("  arch:                 {:?}", s.arch);
    println!("  sizeof(pointer):      {}", s.sizeof_pointer);
    println!("  page_offset:          {:#x}", s.page_offset);
    println!("  vmalloc:              {:#x}..{:#x}", s.vmalloc_start, s.vmalloc_end);
    println!("  vmemmap:              {:#x}..{:#x}", s.vmemmap_start, s.vmemmap_end);
    println!("  modules:              {:#x}..{:#x}", s.modules_vaddr, s.modules_end);
    println!("  start_kernel_map:     {:#x}", s.start_kernel_map);
    println!("  init_level4_pgt:      {:#x}", s.init_level4_pgt);
    println!("  swapper_pg_dir:       {:#x}", s.swapper_pg_dir);
    println!("  high_memory:          {:#x} (runtime)", s.high_memory);
    println!("  vmalloc_earlyreserve: {:#x} (runtime)", s.vmalloc_earlyreserve);
    if !s.version.release.is_empty() {
        println!("  kernel:               {} {}", s.version.sysname, s.version.release);
    }
    println!("  System.map entries:   {}", s.system_map.len());
    Ok(())
}

pub fn query(engine: &Engine, index: usize, expression: &str) -> Result<()> {
    let symbols = engine.symbols()?;
    let dump = engine.dump(index)?;
    let inst = dump.query_instance(&symbols.factory, expression)?;
    print_instance(&inst);
    Ok(())
}

pub fn dump_at(engine: &Engine, index: usize, type_name: &str, address: u64) -> Result<()> {
    let symbols = engine.symbols()?;
    let dump = engine.dump(index)?;
    let inst = dump.instance_at(&symbols.factory, type_name, address, Vec::new())?;
    print_instance(&inst);
    Ok(())
}

fn print_instance(inst: &Instance<'_>) {
    println!("{}: {}", "name".bold(), inst.full_name());
    println!("{}: {}", "type".bold(), inst.type_name());
    println!("{}: {:#x}", "address".bold(), inst.address());
    if inst.is_ambiguous() {
        println!(
            "{}",
            "note: multiple type candidates matched; showing the highest priority"
                .yellow()
        );
    }
    if !inst.is_accessible() {
        println!("{}", "value: <address not accessible>".red());
        return;
    }
    println!("{}:", "value".bold());
    println!("{}", inst.render());
}

pub fn revmap_summary(map: &MemoryMap<'_>, summary: &BuildSummary) {
    println!(
        "reverse map: {} roots, {} nodes, {} objects at {} addresses ({} instances processed{})",
        summary.roots,
        summary.nodes,
        map.object_count(),
        map.address_count(),
        summary.processed,
        if summary.interrupted { ", interrupted" } else { "" }
    );
}

pub fn revmap_tree(map: &MemoryMap<'_>) {
    const MAX_CHILDREN: usize = 8;
    const MAX_DEPTH: usize = 3;

    fn render(map: &MemoryMap<'_>, id: usize, depth: usize) {
        let Some(node) = map.node(id) else { return };
        let indent = "  ".repeat(depth);
        println!(
            "{indent}{} @ {:#x} (p={:.2}{})",
            node.name,
            node.address,
            node.probability,
            if node.seems_valid { ", valid" } else { "" }
        );
        if depth >= MAX_DEPTH {
            return;
        }
        for (i, child) in node.children.iter().enumerate() {
            if i >= MAX_CHILDREN {
                println!("{indent}  … {} more", node.children.len() - MAX_CHILDREN);
                break;
            }
            render(map, *child, depth + 1);
        }
    }

    for root in map.root_ids() {
        render(map, root, 0);
    }
}

pub fn verify_report(report: &VerifyReport) {
    println!("{}", "Page verification".bold());
    println!("  pages processed:    {}", report.processed_pages);
    println!("  executable:         {}", report.executable_pages);
    println!("  kernel code:        {}", report.kernel_code_pages);
    println!("  kernel exec data:   {}", report.kernel_data_pages);
    println!("  module code:        {}", report.module_pages);
    println!("  vmap areas:         {} ({} lazy)", report.vmap_pages, report.lazy_pages);
    println!("  vsyscall:           {}", report.vsyscall_pages);
    println!("  unknown:            {}", report.unknown_pages);
    if !report.missing_modules.is_empty() {
        println!(
            "{}",
            format!("  missing module files: {}", report.missing_modules.join(", ")).yellow()
        );
    }
    if !report.unresolved_symbols.is_empty() {
        println!(
            "{}",
            format!("  unresolved symbols: {}", report.unresolved_symbols.len()).yellow()
        );
    }
    let mismatches = report.mismatch_count();
    if mismatches == 0 {
        println!("{}", "  no unreconcilable mismatches".green());
    } else {
        println!("{}", format!("  {mismatches} page(s) with mismatches").red());
    }
    for finding in &report.findings {
        if finding.change_count == 0 && finding.note.is_none() {
            continue;
        }
        println!(
            "{}",
            format!(
                "  {} page {} @ {:#x}: {} inconsistent change(s)",
                finding.image, finding.page_index, finding.address, finding.change_count
            )
            .red()
        );
        if let Some(note) = &finding.note {
            println!("    note: {note}");
        }
        if let Some(change) = &finding.first_change {
            println!(
                "    first change at offset {:#x}: expected {:#04x}, found {:#04x}",
                change.offset, change.expected, change.found
            );
            println!("    expected context: {}", hex_bytes(&change.context_expected));
            println!("    found context:    {}", hex_bytes(&change.context_found));
        }
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
