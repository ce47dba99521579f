use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;

use spujit::{JitConfig, Linker, MethodCompiler, Program};

#[derive(Parser)]
#[command(name = "spujit")]
#[command(about = "A CIL-to-SPE JIT compiler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a program description to an SPE image
    Compile {
        /// JSON program description
        file: PathBuf,
        /// Output image path
        #[arg(short, long, default_value = "a.elf")]
        output: PathBuf,
        /// Write the raw instruction stream instead of an ELF image
        #[arg(long)]
        raw: bool,
        /// Also write a textual assembly listing
        #[arg(long)]
        asm: Option<PathBuf>,
        /// Print JIT diagnostics
        #[arg(long)]
        trace_jit: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            file,
            output,
            raw,
            asm,
            trace_jit,
        } => {
            let config = JitConfig { trace_jit };
            if let Err(e) = compile_file(&file, &output, raw, asm.as_deref(), &config) {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

fn compile_file(
    path: &PathBuf,
    output: &PathBuf,
    raw: bool,
    asm: Option<&std::path::Path>,
    config: &JitConfig,
) -> Result<(), String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("error: could not read file '{}': {}", path.display(), e))?;
    let program: Program = serde_json::from_str(&source)
        .map_err(|e| format!("error: invalid program description: {}", e))?;

    let compiler = MethodCompiler::with_trace(config.trace_jit);
    let mut compiled = Vec::with_capacity(program.methods.len());
    for method in &program.methods {
        compiled.push(compiler.compile(method).map_err(|e| e.to_string())?);
    }

    let image = Linker::with_trace(config.trace_jit)
        .link(compiled)
        .map_err(|e| e.to_string())?;

    let file = File::create(output)
        .map_err(|e| format!("error: could not create '{}': {}", output.display(), e))?;
    let mut out = BufWriter::new(file);
    if raw {
        image.write_binary(&mut out)
    } else {
        image.write_elf(&mut out)
    }
    .map_err(|e| format!("error: could not write '{}': {}", output.display(), e))?;

    if let Some(asm_path) = asm {
        let file = File::create(asm_path)
            .map_err(|e| format!("error: could not create '{}': {}", asm_path.display(), e))?;
        let mut out = BufWriter::new(file);
        image
            .write_asm(&mut out)
            .map_err(|e| format!("error: could not write '{}': {}", asm_path.display(), e))?;
    }

    Ok(())
}
