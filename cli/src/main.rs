// cli/src/main.rs — insightctl entry point.
//
// One-shot command interface over the InSight engine. Symbols and memory
// images are attached through global options, then a subcommand runs
// against them; `script` replays a file of such command lines against one
// shared engine instance.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use insight_engine::Engine;

mod commands;
mod output;

#[derive(Parser)]
#[command(
    name = "insightctl",
    version,
    about = "insightctl — typed introspection of kernel memory dumps",
    long_about = "insightctl loads a kernel's debug symbols and raw physical-memory \
images, reconstructs typed views of the kernel objects inside them, and \
answers queries, builds reverse maps and verifies code-page integrity."
)]
struct Cli {
    /// Symbol file to load before running the command
    #[arg(long, global = true, env = "INSIGHT_SYMBOLS")]
    symbols: Option<PathBuf>,

    /// Memory image(s) to load, in index order (repeatable)
    #[arg(long = "memory", global = true)]
    memory: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// The command set; `script` files hold one of these per line.
#[derive(Parser)]
#[command(no_binary_name = true)]
struct Line {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List known types or variables
    List {
        #[command(subcommand)]
        what: ListWhat,
    },
    /// Show one type or variable by name or id
    Show { name: String },
    /// Memory-image operations
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
    /// Symbol-file operations
    Symbols {
        #[command(subcommand)]
        action: SymbolsAction,
    },
    /// Run a file of insightctl command lines against one engine
    Script { file: PathBuf, args: Vec<String> },
}

#[derive(Subcommand)]
pub enum ListWhat {
    /// All named types, optionally filtered by substring
    Types { filter: Option<String> },
    /// All global variables, optionally filtered by substring
    Variables { filter: Option<String> },
}

#[derive(Subcommand)]
pub enum MemoryAction {
    /// Load a memory image (validates and reports its index)
    Load { file: PathBuf },
    /// Unload a memory image by index or file name
    Unload { index_or_file: String },
    /// List the loaded memory images
    List,
    /// Print the resolved memory specifications of a dump
    Specs { index: Option<usize> },
    /// Evaluate a path expression against a dump
    Query {
        #[arg(long)]
        dump: Option<usize>,
        expression: String,
    },
    /// Render a typed view at a fixed address
    Dump {
        #[arg(long)]
        dump: Option<usize>,
        type_name: String,
        /// Virtual address, decimal or 0x-prefixed
        address: String,
    },
    /// Reverse-map operations
    Revmap {
        #[command(subcommand)]
        action: RevmapAction,
    },
    /// Diff two loaded memory images
    Diff {
        #[command(subcommand)]
        action: DiffAction,
    },
    /// Verify executable pages against their on-disk ELF originals
    Verify {
        #[arg(long)]
        dump: Option<usize>,
        /// The kernel image (vmlinux) of the running build
        #[arg(long)]
        kernel: PathBuf,
        /// Directory tree holding the build's .ko files
        #[arg(long)]
        modules: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum RevmapAction {
    /// Build the reverse map of a dump and print statistics
    Build { index: usize },
    /// Build and render the reverse map
    Visualize { index: usize },
}

#[derive(Subcommand)]
pub enum DiffAction {
    /// Compare the physical memory of two dumps
    Build { first: usize, second: usize },
}

#[derive(Subcommand)]
pub enum SymbolsAction {
    /// Parse a kernel's symbols from a prepared source directory
    /// (memspecs.json, System.map, typeinfo.jsonl)
    Parse { dir: PathBuf },
    /// Load a previously stored symbol file
    Load { file: PathBuf },
    /// Store the in-memory symbols to a file
    Store { file: PathBuf },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut engine = Engine::new();

    if let Err(e) = setup(&mut engine, &cli) {
        eprintln!("insightctl: {e}");
        return ExitCode::FAILURE;
    }
    match commands::run(&mut engine, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("insightctl: {e}");
            ExitCode::FAILURE
        }
    }
}

fn setup(engine: &mut Engine, cli: &Cli) -> insight_engine::Result<()> {
    if let Some(path) = &cli.symbols {
        engine.load_symbols(path)?;
    }
    for path in &cli.memory {
        engine.load_memory_dump(path)?;
    }
    Ok(())
}

pub(crate) fn parse_command_line(line: &str) -> Result<Commands, clap::Error> {
    let words = shell_words(line);
    Line::try_parse_from(words).map(|l| l.command)
}

/// Minimal word splitting with double-quote support for script lines.
fn shell_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;
    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() || pending {
                    words.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() || pending {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_lines_parse() {
        let cmd = parse_command_line("memory query --dump 0 init_task.comm").unwrap();
        assert!(matches!(
            cmd,
            Commands::Memory {
                action: MemoryAction::Query { dump: Some(0), .. }
            }
        ));
        let cmd = parse_command_line("list types task").unwrap();
        assert!(matches!(cmd, Commands::List { .. }));
        assert!(parse_command_line("bogus subcommand").is_err());
    }

    #[test]
    fn quoted_words_stay_together() {
        let words = shell_words("show \"struct task_struct\"");
        assert_eq!(words, vec!["show", "struct task_struct"]);
    }
}
