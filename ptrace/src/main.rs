//! `ptrace`: parses a tracing script, compiles every probe, attaches it to the kernel, and
//! drains its output until interrupted.
//!
//! Pipeline: read source → parse → resolve providers → annotate → map setup → compile each
//! probe → (`-D`: dump and exit) → attach every probe → install signal handlers → drain until
//! interrupted or timed out → detach → tear down maps.

mod bpf_syscall;
mod drain;
mod error;
mod kprobe;
mod logging;
mod maps;
mod settings;

use error::{DriverError, Result};
use ptir::Ast;
use settings::Settings;
use std::fs;
use std::process::ExitCode;

fn read_program(settings: &Settings) -> Result<String> {
    if settings.command {
        Ok(settings.program.clone())
    } else {
        Ok(fs::read_to_string(&settings.program)?)
    }
}

fn parse(src: &str) -> Result<Ast> {
    Ok(ptir::parse(src)?)
}

fn run(settings: Settings) -> Result<()> {
    let src = read_program(&settings)?;
    let mut ast = parse(&src)?;

    ptcompile::discover_maps(&mut ast).map_err(|e| DriverError::Compile {
        probe: "<script>".to_string(),
        source: e,
    })?;
    maps::setup(&mut ast)?;

    let compiled = ptcompile::compile_script(&mut ast, settings.debug).map_err(|e| DriverError::Compile {
        probe: "<script>".to_string(),
        source: e,
    })?;

    if settings.dump {
        for c in &compiled {
            println!("; probe {}", ast.probe_data(c.probe).target);
            println!("{}", c.program.disassemble());
        }
        return Ok(());
    }

    let mut attached = Vec::with_capacity(compiled.len());
    for c in &compiled {
        let probe = ast.probe_data(c.probe);
        let label = format!("{}:{}", probe.provider, probe.target);
        let is_return = probe.provider == "kretprobe";
        let target = probe.target.clone();
        match kprobe::setup(&label, &target, is_return, &c.program) {
            Ok(a) => attached.push(a),
            Err(e) => {
                for a in &attached {
                    kprobe::teardown(a);
                }
                maps::teardown(&ast);
                return Err(e);
            }
        }
    }

    drain::install_signal_handlers(settings.timeout);
    let drain_result = drain::drain(&ast, settings.ascii);

    for a in &attached {
        kprobe::teardown(a);
    }
    maps::teardown(&ast);

    drain_result
}

fn main() -> ExitCode {
    let settings = Settings::parse_args();
    logging::init(settings.debug);

    match run(settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ptrace: {e}");
            ExitCode::FAILURE
        }
    }
}
