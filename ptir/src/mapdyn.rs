//! Map descriptors ("mdyn"): one per distinct map name referenced by a script.

use crate::descriptor::ValueType;

/// The shape of a map's key: the aligned sizes of the record fields the key is built from (empty
/// for an un-indexed scalar map, i.e. `@` with no `[...]`).
#[derive(Debug, Clone, Default)]
pub struct KeyShape {
    pub field_sizes: Vec<usize>,
}

impl KeyShape {
    pub fn size(&self) -> usize {
        self.field_sizes.iter().sum()
    }
}

/// A distinct map name's descriptor: its key shape, its value type/size, and (once map-setup has
/// run) the kernel file descriptor backing it.
#[derive(Debug, Clone)]
pub struct MapDyn {
    pub name: String,
    pub key: KeyShape,
    pub val_ty: ValueType,
    pub val_size: usize,
    /// Populated by the external map-setup collaborator before compilation's `LD_MAPFD`
    /// emission runs. `None` is a setup bug, not a user error.
    pub fd: Option<i32>,
}

impl MapDyn {
    pub fn new(name: impl Into<String>, val_ty: ValueType, val_size: usize) -> Self {
        MapDyn {
            name: name.into(),
            key: KeyShape::default(),
            val_ty,
            val_size,
            fd: None,
        }
    }
}
