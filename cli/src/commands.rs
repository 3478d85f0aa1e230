// cli/src/commands.rs — dispatch of insightctl subcommands.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

use insight_engine::engine::KernelSymbols;
use insight_engine::error::InsightError;
use insight_engine::symbols::TypeInfo;
use insight_engine::{Engine, MemSpecs, Result, SystemMap};

use crate::output;
use crate::{Commands, DiffAction, ListWhat, MemoryAction, RevmapAction, SymbolsAction};

pub fn run(engine: &mut Engine, command: Commands) -> Result<()> {
    match command {
        Commands::List { what } => match what {
            ListWhat::Types { filter } => output::list_types(engine, filter.as_deref()),
            ListWhat::Variables { filter } => output::list_variables(engine, filter.as_deref()),
        },
        Commands::Show { name } => output::show(engine, &name),
        Commands::Memory { action } => memory(engine, action),
        Commands::Symbols { action } => symbols(engine, action),
        Commands::Script { file, args } => script(engine, &file, &args),
    }
}

fn memory(engine: &mut Engine, action: MemoryAction) -> Result<()> {
    match action {
        MemoryAction::Load { file } => {
            let index = engine.load_memory_dump(&file)?;
            println!("loaded {} as dump {index}", file.display());
            Ok(())
        }
        MemoryAction::Unload { index_or_file } => {
            let name = engine.unload_memory_dump(&index_or_file)?;
            println!("unloaded {name}");
            Ok(())
        }
        MemoryAction::List => {
            output::list_dumps(engine);
            Ok(())
        }
        MemoryAction::Specs { index } => output::specs(engine, resolve_index(engine, index)?),
        MemoryAction::Query { dump, expression } => {
            let index = resolve_index(engine, dump)?;
            output::query(engine, index, &expression)
        }
        MemoryAction::Dump {
            dump,
            type_name,
            address,
        } => {
            let index = resolve_index(engine, dump)?;
            let address = parse_address(&address)?;
            output::dump_at(engine, index, &type_name, address)
        }
        MemoryAction::Revmap { action } => match action {
            RevmapAction::Build { index } => {
                insight_engine::interrupt::clear();
                let map = engine.revmap(index)?;
                let summary = map.build()?;
                output::revmap_summary(&map, &summary);
                Ok(())
            }
            RevmapAction::Visualize { index } => {
                insight_engine::interrupt::clear();
                let map = engine.revmap(index)?;
                let summary = map.build()?;
                output::revmap_summary(&map, &summary);
                output::revmap_tree(&map);
                Ok(())
            }
        },
        MemoryAction::Diff { action } => match action {
            DiffAction::Build { first, second } => {
                insight_engine::interrupt::clear();
                let a = engine.revmap(first)?;
                let b = engine.revmap(second)?;
                a.diff_with(&b)?;
                println!(
                    "{} differing runs, {} bytes total",
                    a.diff_run_count(),
                    a.diff_byte_count()
                );
                Ok(())
            }
        },
        MemoryAction::Verify {
            dump,
            kernel,
            modules,
        } => {
            insight_engine::interrupt::clear();
            let index = resolve_index(engine, dump)?;
            let mut verifier = engine.verifier(index, &kernel, &modules)?;
            verifier.verify_dump()?;
            output::verify_report(verifier.report());
            Ok(())
        }
    }
}

fn symbols(engine: &mut Engine, action: SymbolsAction) -> Result<()> {
    match action {
        SymbolsAction::Parse { dir } => {
            let symbols = parse_symbol_dir(&dir)?;
            println!(
                "parsed {} types, {} variables",
                symbols.factory.type_count(),
                symbols.factory.var_count()
            );
            engine.set_symbols(symbols);
            Ok(())
        }
        SymbolsAction::Load { file } => {
            engine.load_symbols(&file)?;
            let symbols = engine.symbols()?;
            println!(
                "loaded {} types, {} variables",
                symbols.factory.type_count(),
                symbols.factory.var_count()
            );
            Ok(())
        }
        SymbolsAction::Store { file } => {
            engine.store_symbols(&file)?;
            println!("stored symbols to {}", file.display());
            Ok(())
        }
    }
}

/// Assembles symbols from a prepared directory: `memspecs.json` from the
/// probe helper, the build's `System.map`, and the debug-symbol reader's
/// `typeinfo.jsonl` stream.
fn parse_symbol_dir(dir: &Path) -> Result<KernelSymbols> {
    let specs = MemSpecs::load_json(&dir.join("memspecs.json"))?;
    let system_map = SystemMap::load(&dir.join("System.map"))?;
    let stream = fs::File::open(dir.join("typeinfo.jsonl"))
        .map_err(|_| InsightError::FileNotFound(dir.join("typeinfo.jsonl").display().to_string()))?;
    let reader = BufReader::new(stream);
    let records = reader.lines().map(|line| -> Result<TypeInfo> {
        let line = line?;
        serde_json::from_str(&line).map_err(InsightError::from)
    });
    KernelSymbols::parse(specs, system_map, records)
}

fn script(engine: &mut Engine, file: &Path, args: &[String]) -> Result<()> {
    let text = fs::read_to_string(file)
        .map_err(|_| InsightError::FileNotFound(file.display().to_string()))?;
    for (line_no, raw) in text.lines().enumerate() {
        // Positional arguments substitute as $1, $2, ...
        let mut line = raw.to_owned();
        for (i, arg) in args.iter().enumerate() {
            line = line.replace(&format!("${}", i + 1), arg);
        }
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        tracing::debug!(line = line_no + 1, command = %line, "script step");
        let command = crate::parse_command_line(line).map_err(|e| {
            InsightError::Query(format!("script line {}: {e}", line_no + 1))
        })?;
        run(engine, command)?;
    }
    Ok(())
}

fn resolve_index(engine: &Engine, index: Option<usize>) -> Result<usize> {
    match index {
        Some(i) => Ok(i),
        None => engine
            .default_dump_index()
            .ok_or_else(|| InsightError::Query("no memory dump loaded".into())),
    }
}

fn parse_address(text: &str) -> Result<u64> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        text.parse::<u64>()
    };
    parsed.map_err(|_| InsightError::Query(format!("not a valid address: \"{text}\"")))
}
