//! Object identifiers and their classes.
//!
//! An OID is a 64-bit value whose top bits classify the object: VDI inode
//! objects carry the VDI bit, VM state objects the vmstate bit, VDI attribute
//! objects the attribute bit. Objects with none of the class bits set are
//! plain data objects. The lower bits of a data OID hold the index of the
//! block inside its VDI, and the middle bits hold the VDI id.

/// Size of a data object.
pub const SD_DATA_OBJ_SIZE: u64 = 1 << 22;
/// Size of a VDI inode object.
pub const SD_INODE_SIZE: u64 = 1 << 22;
/// Size of a VDI attribute object.
pub const SD_ATTR_OBJ_SIZE: u64 = 1 << 16;

/// Number of bits of a data OID reserved for the block index.
pub const VDI_SPACE_SHIFT: u64 = 32;
/// Class bit of VDI inode objects.
pub const VDI_BIT: u64 = 1 << 63;
/// Class bit of VM state objects.
pub const VMSTATE_BIT: u64 = 1 << 62;
/// Class bit of VDI attribute objects.
pub const VDI_ATTR_BIT: u64 = 1 << 61;

/// Number of VDI ids.
pub const SD_NR_VDIS: u32 = 1 << 24;

/// Tells whether the OID identifies a VDI inode object.
pub fn is_vdi_obj(oid: u64) -> bool {
    oid & VDI_BIT != 0
}

/// Tells whether the OID identifies a VM state object.
pub fn is_vmstate_obj(oid: u64) -> bool {
    oid & VMSTATE_BIT != 0
}

/// Tells whether the OID identifies a VDI attribute object.
pub fn is_vdi_attr_obj(oid: u64) -> bool {
    oid & VDI_ATTR_BIT != 0
}

/// Tells whether the OID identifies a plain data object.
pub fn is_data_obj(oid: u64) -> bool {
    !is_vdi_obj(oid) && !is_vmstate_obj(oid) && !is_vdi_attr_obj(oid)
}

/// Returns the id of the VDI the object belongs to.
pub fn oid_to_vid(oid: u64) -> u32 {
    ((oid & !VDI_BIT) >> VDI_SPACE_SHIFT) as u32
}

/// Returns the block index of a data object inside its VDI.
pub fn data_oid_to_idx(oid: u64) -> u32 {
    (oid & ((1 << VDI_SPACE_SHIFT) - 1)) as u32
}

/// Returns the data OID for the given VDI id and block index.
pub fn vid_to_data_oid(vid: u32, idx: u32) -> u64 {
    ((vid as u64) << VDI_SPACE_SHIFT) | idx as u64
}

/// Returns the inode OID for the given VDI id.
pub fn vid_to_vdi_oid(vid: u32) -> u64 {
    VDI_BIT | ((vid as u64) << VDI_SPACE_SHIFT)
}

/// Returns the on-disk size of the object, fixed by its class.
pub fn obj_size(oid: u64) -> u64 {
    if is_vdi_obj(oid) {
        SD_INODE_SIZE
    } else if is_vdi_attr_obj(oid) {
        SD_ATTR_OBJ_SIZE
    } else {
        SD_DATA_OBJ_SIZE
    }
}
