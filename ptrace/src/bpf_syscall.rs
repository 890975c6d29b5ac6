//! Raw `bpf(2)` wrapper. The kernel ABI for map creation/lookup/update/delete, all multiplexed
//! through one syscall number with a command code and a command-specific attribute union.

use std::io;
use std::mem;

const BPF_MAP_CREATE: libc::c_int = 0;
const BPF_MAP_LOOKUP_ELEM: libc::c_int = 1;
const BPF_MAP_UPDATE_ELEM: libc::c_int = 2;
const BPF_MAP_DELETE_ELEM: libc::c_int = 3;
const BPF_MAP_GET_NEXT_KEY: libc::c_int = 4;

const BPF_MAP_TYPE_HASH: u32 = 1;

#[repr(C)]
#[derive(Default)]
struct BpfAttrMapCreate {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
}

#[repr(C)]
struct BpfAttrElem {
    map_fd: u32,
    key: u64,
    value_or_next_key: u64,
    flags: u64,
}

unsafe fn bpf(cmd: libc::c_int, attr: *const libc::c_void, size: usize) -> libc::c_long {
    libc::syscall(libc::SYS_bpf, cmd, attr, size)
}

/// Creates a hash map keyed by `key_size`-byte keys holding `value_size`-byte values, sized for
/// `max_entries` distinct keys. Returns the kernel file descriptor.
pub fn map_create(key_size: u32, value_size: u32, max_entries: u32) -> io::Result<i32> {
    let attr = BpfAttrMapCreate {
        map_type: BPF_MAP_TYPE_HASH,
        key_size,
        value_size,
        max_entries,
        map_flags: 0,
    };
    let ret = unsafe { bpf(BPF_MAP_CREATE, &attr as *const _ as *const libc::c_void, mem::size_of::<BpfAttrMapCreate>()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as i32)
}

pub fn map_lookup(fd: i32, key: &[u8], value: &mut [u8]) -> io::Result<()> {
    let attr = BpfAttrElem {
        map_fd: fd as u32,
        key: key.as_ptr() as u64,
        value_or_next_key: value.as_mut_ptr() as u64,
        flags: 0,
    };
    let ret = unsafe { bpf(BPF_MAP_LOOKUP_ELEM, &attr as *const _ as *const libc::c_void, mem::size_of::<BpfAttrElem>()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn map_update(fd: i32, key: &[u8], value: &[u8]) -> io::Result<()> {
    let attr = BpfAttrElem {
        map_fd: fd as u32,
        key: key.as_ptr() as u64,
        value_or_next_key: value.as_ptr() as u64,
        flags: 0,
    };
    let ret = unsafe { bpf(BPF_MAP_UPDATE_ELEM, &attr as *const _ as *const libc::c_void, mem::size_of::<BpfAttrElem>()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `BPF_MAP_GET_NEXT_KEY`: `prev_key == None` starts the iteration. Returns `Ok(None)` once the
/// kernel reports no further keys (`ENOENT`), which callers use to terminate enumeration.
pub fn map_get_next_key(fd: i32, prev_key: Option<&[u8]>, next_key: &mut [u8]) -> io::Result<Option<()>> {
    let attr = BpfAttrElem {
        map_fd: fd as u32,
        key: prev_key.map(|k| k.as_ptr() as u64).unwrap_or(0),
        value_or_next_key: next_key.as_mut_ptr() as u64,
        flags: 0,
    };
    let ret = unsafe { bpf(BPF_MAP_GET_NEXT_KEY, &attr as *const _ as *const libc::c_void, mem::size_of::<BpfAttrElem>()) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(()))
}

pub fn map_delete(fd: i32, key: &[u8]) -> io::Result<()> {
    let attr = BpfAttrElem {
        map_fd: fd as u32,
        key: key.as_ptr() as u64,
        value_or_next_key: 0,
        flags: 0,
    };
    let ret = unsafe { bpf(BPF_MAP_DELETE_ELEM, &attr as *const _ as *const libc::c_void, mem::size_of::<BpfAttrElem>()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Loads a compiled program (as raw 8-byte instruction words) into the kernel, returning its
/// program file descriptor. Uses the same `bpf()` multiplexer under `BPF_PROG_LOAD`.
pub fn prog_load(prog_type: u32, insns: &[u8], license: &str) -> io::Result<i32> {
    const BPF_PROG_LOAD: libc::c_int = 5;

    #[repr(C)]
    struct BpfAttrProgLoad {
        prog_type: u32,
        insn_cnt: u32,
        insns: u64,
        license: u64,
        log_level: u32,
        log_size: u32,
        log_buf: u64,
    }

    let license_c = std::ffi::CString::new(license).expect("license string has no interior nul");
    let attr = BpfAttrProgLoad {
        prog_type,
        insn_cnt: (insns.len() / 8) as u32,
        insns: insns.as_ptr() as u64,
        license: license_c.as_ptr() as u64,
        log_level: 0,
        log_size: 0,
        log_buf: 0,
    };
    let ret = unsafe { bpf(BPF_PROG_LOAD, &attr as *const _ as *const libc::c_void, mem::size_of::<BpfAttrProgLoad>()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as i32)
}
