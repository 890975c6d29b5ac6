//! Kprobe/kretprobe attachment: the kernel-facing half of provider dispatch that
//! `ptcompile::Provider` deliberately leaves out (so the compiler core never links `libc`).
//!
//! `setup` resolves the probe's target (expanding a trailing glob against `/proc/kallsyms`),
//! creates one tracefs kprobe event per resolved symbol, opens one `perf_event_open` file
//! descriptor per online CPU, and attaches the loaded program to each. `teardown` reverses it.

use crate::bpf_syscall;
use crate::error::{DriverError, Result};
use ptcompile::Program;
use std::fs;
use std::io::Write;
use std::mem;

const TRACEFS_KPROBE_EVENTS: &str = "/sys/kernel/debug/tracing/kprobe_events";
const TRACEFS_EVENTS_DIR: &str = "/sys/kernel/debug/tracing/events/kprobes";
const KALLSYMS: &str = "/proc/kallsyms";

const PERF_TYPE_TRACEPOINT: u32 = 2;
const PERF_EVENT_IOC_SET_BPF: u64 = 0x4004_2408;
const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;

/// File descriptors opened for one probe's attachment; closed in full on teardown.
pub struct Attached {
    perf_fds: Vec<i32>,
    prog_fd: i32,
}

/// Resolves one probe's target against the kernel symbol table, honoring a trailing `*`/`?`
/// glob left on the target string by the parser (see `ptir`'s `pspec` grammar).
fn resolve_symbols(target: &str) -> Result<Vec<String>> {
    if !target.ends_with('*') && !target.ends_with('?') {
        return Ok(vec![target.to_string()]);
    }
    let table = fs::read_to_string(KALLSYMS)?;
    let pattern = glob_matcher(target);
    let matches: Vec<String> = table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(2))
        .filter(|sym| pattern(sym))
        .map(|s| s.to_string())
        .collect();
    if matches.is_empty() {
        return Err(DriverError::NoSymbolsMatched {
            probe: target.to_string(),
            pattern: target.to_string(),
        });
    }
    Ok(matches)
}

/// A minimal `*`/`?` glob matcher (`*` any run of characters, `?` exactly one); the DSL only
/// ever produces a single trailing wildcard, but this handles a general pattern regardless.
fn glob_matcher(pattern: &str) -> impl Fn(&str) -> bool + '_ {
    move |candidate: &str| glob_match(pattern.as_bytes(), candidate.as_bytes())
}

fn glob_match(pat: &[u8], s: &[u8]) -> bool {
    match (pat.first(), s.first()) {
        (None, None) => true,
        (Some(b'*'), _) => glob_match(&pat[1..], s) || (!s.is_empty() && glob_match(pat, &s[1..])),
        (Some(b'?'), Some(_)) => glob_match(&pat[1..], &s[1..]),
        (Some(p), Some(c)) if p == c => glob_match(&pat[1..], &s[1..]),
        _ => false,
    }
}

/// Registers a kprobe (or kretprobe) tracefs event for `symbol`, returning its numeric event id.
fn register_event(symbol: &str, is_return: bool, event_name: &str) -> Result<u32> {
    let kind = if is_return { 'r' } else { 'p' };
    let line = format!("{kind}:kprobes/{event_name} {symbol}\n");
    let mut f = fs::OpenOptions::new().append(true).open(TRACEFS_KPROBE_EVENTS)?;
    f.write_all(line.as_bytes()).map_err(|e| DriverError::Attach {
        probe: symbol.to_string(),
        reason: format!("writing kprobe_events: {e}"),
    })?;
    let id_path = format!("{TRACEFS_EVENTS_DIR}/{event_name}/id");
    let id_str = fs::read_to_string(&id_path)?;
    id_str.trim().parse::<u32>().map_err(|e| DriverError::Attach {
        probe: symbol.to_string(),
        reason: format!("parsing event id at {id_path}: {e}"),
    })
}

fn unregister_event(event_name: &str) {
    let line = format!("-:kprobes/{event_name}\n");
    if let Ok(mut f) = fs::OpenOptions::new().append(true).open(TRACEFS_KPROBE_EVENTS) {
        let _ = f.write_all(line.as_bytes());
    }
}

#[repr(C)]
#[derive(Default)]
struct PerfEventAttr {
    ty: u32,
    size: u32,
    config: u64,
    sample_period_or_freq: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events_or_watermark: u32,
    bp_type: u32,
    config1_or_bp_addr: u64,
    config2_or_bp_len: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved_2: u16,
}

fn online_cpu_count() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

unsafe fn perf_event_open(attr: &PerfEventAttr, pid: i32, cpu: i32) -> i32 {
    libc::syscall(
        libc::SYS_perf_event_open,
        attr as *const PerfEventAttr,
        pid,
        cpu,
        -1i32,
        0u64,
    ) as i32
}

pub fn setup(probe_label: &str, target: &str, is_return: bool, program: &Program) -> Result<Attached> {
    let mut insn_bytes = Vec::with_capacity(program.len() * 8);
    for insn in program.insns() {
        insn.write_to(&mut insn_bytes)?;
    }
    let prog_fd = bpf_syscall::prog_load(/* BPF_PROG_TYPE_KPROBE */ 2, &insn_bytes, "GPL\0").map_err(|e| DriverError::Attach {
        probe: probe_label.to_string(),
        reason: format!("prog_load: {e}"),
    })?;

    let symbols = resolve_symbols(target)?;
    let ncpus = online_cpu_count();
    let mut perf_fds = Vec::with_capacity(symbols.len() * ncpus);

    for (i, symbol) in symbols.iter().enumerate() {
        let event_name = format!("ptrace_{}_{}", std::process::id(), i);
        let event_id = register_event(symbol, is_return, &event_name)?;

        let mut attr = PerfEventAttr {
            ty: PERF_TYPE_TRACEPOINT,
            size: mem::size_of::<PerfEventAttr>() as u32,
            config: event_id as u64,
            ..Default::default()
        };
        attr.sample_period_or_freq = 1;

        for cpu in 0..ncpus as i32 {
            let fd = unsafe { perf_event_open(&attr, -1, cpu) };
            if fd < 0 {
                unregister_event(&event_name);
                return Err(DriverError::Attach {
                    probe: probe_label.to_string(),
                    reason: format!("perf_event_open({symbol}, cpu {cpu}): {}", std::io::Error::last_os_error()),
                });
            }
            if unsafe { libc::ioctl(fd, PERF_EVENT_IOC_SET_BPF, prog_fd) } < 0 {
                return Err(DriverError::Attach {
                    probe: probe_label.to_string(),
                    reason: format!("PERF_EVENT_IOC_SET_BPF: {}", std::io::Error::last_os_error()),
                });
            }
            if unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ENABLE, 0) } < 0 {
                return Err(DriverError::Attach {
                    probe: probe_label.to_string(),
                    reason: format!("PERF_EVENT_IOC_ENABLE: {}", std::io::Error::last_os_error()),
                });
            }
            perf_fds.push(fd);
        }
        log::debug!("probe {probe_label}: attached to {symbol} (event id {event_id}) on {ncpus} cpus");
    }

    Ok(Attached { perf_fds, prog_fd })
}

pub fn teardown(attached: &Attached) {
    for fd in &attached.perf_fds {
        unsafe {
            libc::ioctl(*fd, PERF_EVENT_IOC_DISABLE, 0);
            libc::close(*fd);
        }
    }
    unsafe {
        libc::close(attached.prog_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_trailing_star() {
        let m = glob_matcher("vfs_*");
        assert!(m("vfs_read"));
        assert!(m("vfs_write"));
        assert!(!m("do_vfs_read"));
    }

    #[test]
    fn glob_matches_single_question_mark() {
        let m = glob_matcher("sys_read?");
        assert!(m("sys_read1"));
        assert!(!m("sys_read"));
    }

    #[test]
    fn literal_target_is_passed_through_without_glob_expansion() {
        assert_eq!(resolve_symbols("do_sys_open").unwrap(), vec!["do_sys_open".to_string()]);
    }
}
