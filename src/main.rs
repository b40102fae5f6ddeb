use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;
use ulox::{debug::disassemble_chunk, Context, ContextConfig, DefaultLocator, Script, UloxError, VmConfig};

/// Runs ULox scripts, or starts a REPL when no file is given.
#[derive(Parser)]
#[command(name = "ulox", version, about, long_about = None)]
struct Cli {
    /// Script to run
    file: Option<PathBuf>,

    /// Skip test sets instead of running them as they are declared
    #[arg(long)]
    no_tests: bool,

    /// Do not echo `print` output to stdout
    #[arg(long)]
    quiet: bool,

    /// Print the test ledger after the script finishes
    #[arg(long)]
    dump_tests: bool,

    /// Print the compiled bytecode instead of running it
    #[arg(long)]
    disassemble: bool,

    /// Directory searched for scripts queued with `build queue`
    #[arg(long, value_name = "DIR")]
    script_dir: Option<PathBuf>,
}

fn exit_code(err: &UloxError) -> ExitCode {
    match err {
        UloxError::Scan(_) | UloxError::Compile(_) => ExitCode::from(65),
        UloxError::Runtime(_) => ExitCode::from(70),
        UloxError::Context(_) => ExitCode::from(74),
    }
}

fn context(cli: &Cli) -> Context {
    let config = ContextConfig {
        vm: VmConfig {
            run_tests: !cli.no_tests,
            echo_print: !cli.quiet,
            ..VmConfig::default()
        },
        bind_core: true,
    };
    let locator = match (&cli.script_dir, &cli.file) {
        (Some(dir), _) => DefaultLocator::with_directory(dir),
        (None, Some(file)) => match file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => DefaultLocator::with_directory(parent),
            _ => DefaultLocator::with_directory("."),
        },
        (None, None) => DefaultLocator::new(),
    };
    Context::with_locator(config, Box::new(locator))
}

fn repl(mut context: Context) -> ExitCode {
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            return ExitCode::FAILURE;
        }

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return ExitCode::SUCCESS,
            Ok(_) => {
                if let Err(err) = context.run_source(Script::new("repl", &line)) {
                    eprintln!("{}", err);
                }
            }
            Err(err) => {
                error!(error = %err, "error reading line");
                return ExitCode::FAILURE;
            }
        }
    }
}

fn run_file(cli: &Cli, mut context: Context, path: &Path) -> ExitCode {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("Could not read file \"{}\": {}", path.display(), err);
            return ExitCode::from(74);
        }
    };
    let name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("main")
        .to_string();
    let script = Script::new(&name, &text);

    if cli.disassemble {
        return match context.compile(&script) {
            Ok(chunk) => {
                print!("{}", disassemble_chunk(&chunk));
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("{}", err);
                exit_code(&err)
            }
        };
    }

    let result = context.run_source(script);
    if cli.dump_tests {
        print!("{}", context.test_runner().borrow().generate_dump());
    }
    match result {
        Ok(result) => {
            debug!(?result, "script finished");
            if context.test_runner().borrow().all_passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(70)
            }
        }
        Err(err) => {
            eprintln!("{}", err);
            exit_code(&err)
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("ULOX_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let context = context(&cli);
    match &cli.file {
        Some(path) => run_file(&cli, context, path),
        None => repl(context),
    }
}
