//! Output drainer: echoes this script's `trace_printk` lines from the kernel trace pipe while
//! probes are live, then (at drain-exit) dumps every aggregation map sorted by key.

use crate::error::Result;
use ptir::Ast;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};

const TRACE_PIPE: &str = "/sys/kernel/debug/tracing/trace_pipe";

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Installs `SIGINT`/`SIGALRM` handlers and, if `timeout` is set, arms `alarm(2)`. Both signals
/// set the same flag `drain` polls; there is no distinction downstream between "user interrupted"
/// and "timeout elapsed".
pub fn install_signal_handlers(timeout: Option<u64>) {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as usize);
        libc::signal(libc::SIGALRM, on_signal as usize);
    }
    if let Some(secs) = timeout {
        unsafe {
            libc::alarm(secs as u32);
        }
    }
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Strips non-ASCII bytes when `-A` is given, mirroring the CLI's `--ascii` flag.
fn sanitize(line: &str, ascii_only: bool) -> String {
    if ascii_only {
        line.chars().filter(|c| c.is_ascii()).collect()
    } else {
        line.to_string()
    }
}

/// Reads `trace_pipe` until interrupted, echoing every line to stdout. The kernel's
/// `trace_printk` helper formats the record itself before it reaches the pipe (our format
/// string and arguments were only ever inputs to that helper, staged on our own stack by
/// `compile_printf`), so there is nothing left for userspace to reformat here — just filter and
/// echo. The kernel doesn't tag lines by originating process, so every `trace_printk` on the
/// system appears here, which is acceptable for a single-user tracing tool.
pub fn drain(ast: &Ast, ascii_only: bool) -> Result<()> {
    let file = File::open(TRACE_PIPE)?;
    let mut reader = BufReader::new(file);

    let mut line = String::new();
    while !interrupted() {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => println!("{}", sanitize(line.trim_end(), ascii_only)),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    dump_aggregation_maps(ast)?;
    Ok(())
}

/// Dumps every map sorted by key, once drain-exit has been signalled. Enumerates keys via
/// `BPF_MAP_GET_NEXT_KEY` and reads each value back with `BPF_MAP_LOOKUP_ELEM`.
fn dump_aggregation_maps(ast: &Ast) -> Result<()> {
    for (name, map) in ast.maps.iter() {
        let Some(fd) = map.fd else { continue };
        let key_size = map.key.size().max(8);
        let val_size = map.val_size.max(8);

        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut cur: Option<Vec<u8>> = None;
        loop {
            let mut next = vec![0u8; key_size];
            match crate::bpf_syscall::map_get_next_key(fd, cur.as_deref(), &mut next) {
                Ok(Some(())) => {
                    let mut value = vec![0u8; val_size];
                    if crate::bpf_syscall::map_lookup(fd, &next, &mut value).is_ok() {
                        entries.push((next.clone(), value));
                    }
                    cur = Some(next);
                }
                Ok(None) => break,
                Err(e) => {
                    log::debug!("map {name:?}: key enumeration stopped early: {e}");
                    break;
                }
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, value) in &entries {
            let key_val = i64::from_ne_bytes(key[..8.min(key.len())].try_into().unwrap_or([0; 8]));
            let value_val = i64::from_ne_bytes(value[..8.min(value.len())].try_into().unwrap_or([0; 8]));
            println!("@{name}[{key_val}]: {value_val}");
        }
    }
    Ok(())
}
