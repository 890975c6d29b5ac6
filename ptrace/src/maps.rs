//! Map setup: walks the script's map descriptor table once, creating one kernel hash map per
//! entry and recording its file descriptor back into the `MapDyn` for `LD_MAPFD` resolution.

use crate::bpf_syscall;
use crate::error::{DriverError, Result};
use ptir::Ast;

/// Arbitrary per-map capacity; the DSL doesn't expose a way to size maps explicitly.
const DEFAULT_MAP_ENTRIES: u32 = 10_000;

pub fn setup(ast: &mut Ast) -> Result<()> {
    let names: Vec<String> = ast.maps.keys().cloned().collect();
    for name in names {
        let (key_size, val_size) = {
            let m = &ast.maps[&name];
            (m.key.size().max(8) as u32, m.val_size.max(8) as u32)
        };
        let fd = bpf_syscall::map_create(key_size, val_size, DEFAULT_MAP_ENTRIES).map_err(|e| DriverError::MapSetup {
            map: name.clone(),
            reason: e.to_string(),
        })?;
        ast.maps.get_mut(&name).expect("just enumerated").fd = Some(fd);
        log::debug!("map {name:?}: created fd={fd} key_size={key_size} val_size={val_size}");
    }
    Ok(())
}

pub fn teardown(ast: &Ast) {
    for (name, map) in ast.maps.iter() {
        if let Some(fd) = map.fd {
            unsafe {
                libc::close(fd);
            }
            log::debug!("map {name:?}: closed fd={fd}");
        }
    }
}
