//! Core types for wharf.

/// Sector size in bytes. Export sizes are rounded down to this and all
/// backend addressing is in units of it.
pub const SECTOR_SIZE: usize = 512;

const _: () = {
    assert!(SECTOR_SIZE.is_power_of_two());
};

/// Round a byte count down to a whole number of sectors.
#[inline]
pub fn round_down_to_sector(bytes: u64) -> u64 {
    bytes - bytes % SECTOR_SIZE as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_down() {
        assert_eq!(round_down_to_sector(0), 0);
        assert_eq!(round_down_to_sector(511), 0);
        assert_eq!(round_down_to_sector(512), 512);
        assert_eq!(round_down_to_sector(1023), 512);
        assert_eq!(round_down_to_sector(0x100000), 0x100000);
    }
}
