use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mz2c::analysis::Program;
use mz2c::codegen::CodeGen;
use mz2c::config::{DataPolicy, Directives, TranslatorOptions};
use mz2c::decoder::Backend;
use mz2c::instruction::BranchBase;
use mz2c::parser::parse_mz;
use mz2c::report::{Report, ReportFormat};
use mz2c::store::InstructionStore;

/// Translate a real-mode 8086 MZ executable into C.
#[derive(Debug, Parser)]
#[command(name = "mz2c", version, about)]
struct Args {
    /// MZ executable to translate
    input: PathBuf,

    /// Output C file (defaults to the input name with a `.c` extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// JSON file with patch and hook directives
    #[arg(short, long)]
    directives: Option<PathBuf>,

    /// Disassembly backend
    #[arg(long, value_enum, default_value_t = Backend::Capstone)]
    backend: Backend,

    /// Path to the ndisasm executable
    #[arg(long)]
    ndisasm: Option<PathBuf>,

    /// Instructions requested per disassembly batch
    #[arg(long, default_value_t = 100)]
    batch: usize,

    /// Segment the load module is placed at, in hex
    #[arg(long, default_value = "1000", value_parser = parse_segment)]
    load_segment: u16,

    /// How near branch literals map to addresses
    #[arg(long, value_enum, default_value_t = BranchBase::Segment)]
    branch_base: BranchBase,

    /// Copy the whole load module into memory, not just the data below the code
    #[arg(long)]
    full_image: bool,

    /// Print an analysis report to stderr
    #[arg(long, value_enum)]
    report: Option<ReportFormat>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_segment(text: &str) -> Result<u16, String> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid segment `{}`: {}", text, e))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let options = TranslatorOptions {
        batch_size: args.batch,
        branch_base: args.branch_base,
        load_segment: args.load_segment,
        data_policy: if args.full_image {
            DataPolicy::FullImage
        } else {
            DataPolicy::Prefix
        },
    };

    let bytes = fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let image = parse_mz(&bytes, options.load_segment)
        .with_context(|| format!("failed to load {}", args.input.display()))?;

    let directives = match &args.directives {
        Some(path) => Directives::load(path)
            .with_context(|| format!("failed to read directives from {}", path.display()))?,
        None => Directives::default(),
    };
    let hooks = directives.hook_table().context("invalid hook directive")?;

    let backend = args
        .backend
        .build(args.ndisasm.clone())
        .with_context(|| format!("failed to start the {} backend", args.backend))?;
    let mut store = InstructionStore::new(&image, backend, &options);
    store
        .install_patches(&directives.patches)
        .context("invalid patch directive")?;

    let program = Program::analyze(&mut store, &image, &options).context("analysis failed")?;
    let source = CodeGen::new(&hooks)
        .program(&program)
        .context("code generation failed")?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension("c"));
    fs::write(&output, source).with_context(|| format!("failed to write {}", output.display()))?;
    log::info!("wrote {}", output.display());

    if let Some(format) = args.report {
        let report = Report::from_program(&program).render(format)?;
        eprint!("{}", report);
    }
    Ok(())
}
