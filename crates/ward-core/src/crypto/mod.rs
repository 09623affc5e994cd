//! Crypto primitives used by the anti-tamper modes.
//!
//! These make method bodies unreadable to static tools and bind integrity
//! digests to them. They are not meant to resist a determined analyst
//! holding the module; the protection comes from combining them with the
//! runtime checks.

pub mod digest;
pub mod xtea;

/// Splitmix64 finalizer, used to spread seeds.
pub fn splitmix_finalize(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    h ^= h >> 33;
    h = h.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
    h ^= h >> 33;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitmix_spreads_adjacent_seeds() {
        let diff = (splitmix_finalize(1) ^ splitmix_finalize(2)).count_ones();
        assert!(diff >= 20, "only {} bits differ", diff);
    }
}
