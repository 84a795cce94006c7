//! Sensor handle namespacing
//!
//! A proxied sensor handle carries the index of the sub-HAL that owns it in
//! its top byte. Sub-HALs only ever see handles with that byte cleared.

/// Opaque sensor handle as exchanged with clients and sub-HALs
pub type SensorHandle = i32;

/// Number of high-order bits reserved for the sub-HAL index
pub const SUBHAL_INDEX_BITS: u32 = 8;

/// Bit offset of the sub-HAL index within a handle
pub const BITS_AFTER_SUBHAL_INDEX: u32 = 32 - SUBHAL_INDEX_BITS;

/// Mask selecting the sub-HAL index bits of a handle
pub const SUBHAL_INDEX_MASK: u32 = 0xFF00_0000;

/// Maximum number of sub-HALs a single proxy can address
pub const MAX_SUBHALS: usize = 1 << SUBHAL_INDEX_BITS;

/// Handle value meaning "every sensor" in direct report configuration
pub const ALL_SENSORS_HANDLE: SensorHandle = -1;

/// Check whether `index` can be encoded in the namespace bits
pub fn index_fits(index: usize) -> bool {
    index < MAX_SUBHALS
}

/// Set the sub-HAL index as the top byte of `handle`
///
/// Any index bits already present are replaced. `index` must satisfy
/// [`index_fits`]; out of range values are truncated to the low byte.
pub fn stamp(handle: SensorHandle, index: usize) -> SensorHandle {
    debug_assert!(index_fits(index), "sub-HAL index {} out of range", index);
    let local = (handle as u32) & !SUBHAL_INDEX_MASK;
    let bits = ((index as u32) & 0xFF) << BITS_AFTER_SUBHAL_INDEX;
    (local | bits) as SensorHandle
}

/// Clear the sub-HAL index bits of `handle`
pub fn unstamp(handle: SensorHandle) -> SensorHandle {
    ((handle as u32) & !SUBHAL_INDEX_MASK) as SensorHandle
}

/// Extract the sub-HAL index from `handle`
pub fn subhal_index_of(handle: SensorHandle) -> usize {
    ((handle as u32) >> BITS_AFTER_SUBHAL_INDEX) as usize
}

/// Whether `handle` already carries non-zero sub-HAL index bits
///
/// Sub-HALs must report handles in their own address space, so a namespaced
/// handle coming from a sub-HAL is malformed.
pub fn is_namespaced(handle: SensorHandle) -> bool {
    (handle as u32) & SUBHAL_INDEX_MASK != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_roundtrip_for_every_index() {
        for index in [0usize, 1, 2, 127, 128, 255] {
            for local in [0, 1, 0x42, 0x00FF_FFFF] {
                let stamped = stamp(local, index);
                assert_eq!(subhal_index_of(stamped), index);
                assert_eq!(unstamp(stamped), local);
            }
        }
    }

    #[test]
    fn test_stamp_replaces_existing_bits() {
        let stamped = stamp(stamp(5, 3), 7);
        assert_eq!(subhal_index_of(stamped), 7);
        assert_eq!(unstamp(stamped), 5);
    }

    #[test]
    fn test_high_indices_do_not_sign_extend() {
        let stamped = stamp(1, 0xFF);
        assert!(stamped < 0);
        assert_eq!(subhal_index_of(stamped), 0xFF);
    }

    #[test]
    fn test_is_namespaced() {
        assert!(!is_namespaced(0x00AB_CDEF));
        assert!(is_namespaced(stamp(1, 1)));
        assert!(is_namespaced(ALL_SENSORS_HANDLE));
    }

    #[test]
    fn test_index_fits() {
        assert!(index_fits(0));
        assert!(index_fits(MAX_SUBHALS - 1));
        assert!(!index_fits(MAX_SUBHALS));
    }
}
