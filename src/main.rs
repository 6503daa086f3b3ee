use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use kiln::bytecode::disasm::{print_bc, print_bc_stats};
use kiln::bytecode::{BytecodeCompiler, ProgramBc};
use kiln::codegen::{CompilerConfig, YieldMode};
use kiln::demos::{self, Demo};
use kiln::interp::Interpreter;
use kiln::lang::walk::compile_script;
use kiln::runtime::{Vm, VmConfig};

#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(about = "Code generation backends for a dynamic, Ruby-like language")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the built-in demo programs
    List,

    /// Compile and run a demo program
    Demo {
        name: String,

        #[arg(long, value_enum, default_value_t = Backend::Bytecode)]
        backend: Backend,

        /// Print the disassembly before running
        #[arg(long)]
        disasm: bool,

        /// Write the compiled program to FILE
        #[arg(long, value_name = "FILE")]
        emit: Option<PathBuf>,

        /// Treat `yield` with a missing argument as `yield` with none
        #[arg(long)]
        lenient_yield: bool,

        /// Log stack imbalances instead of failing
        #[arg(long)]
        no_stack_check: bool,

        #[command(flatten)]
        limits: Limits,
    },

    /// Run a compiled program
    Run {
        file: PathBuf,

        #[command(flatten)]
        limits: Limits,
    },

    /// Disassemble a compiled program
    Disasm { file: PathBuf },
}

/// Resource limits; unset flags keep the defaults.
#[derive(Args, Debug, Default)]
struct Limits {
    /// Open units plus nested control-flow regions
    #[arg(long, value_name = "N")]
    max_nesting_depth: Option<usize>,

    /// Constant pool and code table size
    #[arg(long, value_name = "N")]
    max_pool_entries: Option<usize>,

    /// Skip the static verifier as each unit closes
    #[arg(long)]
    no_verify: bool,

    #[arg(long, value_name = "N")]
    max_call_depth: Option<usize>,

    /// Stop after executing N instructions
    #[arg(long, value_name = "N")]
    max_steps: Option<usize>,

    #[arg(long, value_name = "N")]
    max_stack_size: Option<usize>,
}

impl Limits {
    fn apply(&self, config: &mut CompilerConfig) {
        if let Some(depth) = self.max_nesting_depth {
            config.max_nesting_depth = depth;
        }
        if let Some(entries) = self.max_pool_entries {
            config.max_pool_entries = entries;
        }
        if self.no_verify {
            config.verify_units = false;
        }
    }

    fn vm_config(&self) -> VmConfig {
        let defaults = VmConfig::default();
        VmConfig {
            max_call_depth: self.max_call_depth.unwrap_or(defaults.max_call_depth),
            max_steps: self.max_steps.or(defaults.max_steps),
            max_stack_size: self.max_stack_size.unwrap_or(defaults.max_stack_size),
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Backend {
    Bytecode,
    Interpret,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kiln=info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_logging();

    match Cli::parse().command {
        Command::List => {
            for demo in demos::all() {
                println!("{:<10} {}", demo.name, demo.description);
            }
        }
        Command::Demo {
            name,
            backend,
            disasm,
            emit,
            lenient_yield,
            no_stack_check,
            limits,
        } => {
            let Some(demo) = demos::find(&name) else {
                eprintln!("Unknown demo '{}' (try `kiln list`)", name);
                process::exit(1);
            };

            let mut config = CompilerConfig::default();
            if lenient_yield {
                config.yield_mode = YieldMode::Lenient;
            }
            if no_stack_check {
                config.check_stack = false;
            }
            limits.apply(&mut config);
            let vm_config = limits.vm_config();

            match backend {
                Backend::Bytecode => {
                    run_demo_bc(demo, config, vm_config, disasm, emit.as_deref())
                }
                Backend::Interpret => {
                    if disasm || emit.is_some() {
                        warn!("--disasm and --emit only apply to the bytecode backend");
                    }
                    run_demo_interpreted(demo, config, vm_config);
                }
            }
        }
        Command::Run { file, limits } => {
            let program = read_program(&file);
            run_program_bc(program, limits.vm_config());
        }
        Command::Disasm { file } => {
            let program = read_program(&file);
            print_bc(&program);
            print_bc_stats(&program);
        }
    }
}

fn run_demo_bc(
    demo: &Demo,
    config: CompilerConfig,
    vm_config: VmConfig,
    disasm: bool,
    emit: Option<&Path>,
) {
    let mut compiler = BytecodeCompiler::with_config(config);
    if let Err(e) = compile_script(&mut compiler, &demo.program()) {
        eprintln!("Compile error: {}", e);
        process::exit(1);
    }
    let program = match compiler.into_program() {
        Ok(program) => program,
        Err(e) => {
            eprintln!("Compile error: {}", e);
            process::exit(1);
        }
    };

    if disasm {
        print_bc(&program);
    }

    if let Some(path) = emit {
        let bytes = match program.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("Encode error: {}", e);
                process::exit(1);
            }
        };
        if let Err(e) = fs::write(path, &bytes) {
            eprintln!("Failed to write '{}': {}", path.display(), e);
            process::exit(1);
        }
        info!(path = %path.display(), bytes = bytes.len(), "program written");
    }

    run_program_bc(program, vm_config);
}

fn run_demo_interpreted(demo: &Demo, config: CompilerConfig, vm_config: VmConfig) {
    let mut interpreter = Interpreter::with_config(config, vm_config);
    if let Err(e) = compile_script(&mut interpreter, &demo.program()) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
    if let Some(result) = interpreter.result() {
        info!(result = %result.inspect(), "script finished");
    }
}

fn run_program_bc(program: ProgramBc, vm_config: VmConfig) {
    let mut vm = Vm::with_config(vm_config);
    match vm.run(program) {
        Ok(result) => info!(result = %result.inspect(), "script finished"),
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

fn read_program(path: &Path) -> ProgramBc {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Failed to read '{}': {}", path.display(), e);
            process::exit(1);
        }
    };
    match ProgramBc::from_bytes(&bytes) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("Failed to decode '{}': {}", path.display(), e);
            process::exit(1);
        }
    }
}
