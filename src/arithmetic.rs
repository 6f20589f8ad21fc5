//! Identifier arithmetic on the ring.
//!
//! Identifiers are big-endian byte strings compared lexicographically, so
//! plain slice ordering is the modular ordering of the id circle. All
//! interval predicates handle wrap-around across the origin.

use crate::config::Config;
use crate::types::Vnode;
use rand::Rng;
use std::time::Duration;

/// Is `key` strictly inside the open interval `(id1, id2)` clockwise?
pub fn between(id1: &[u8], id2: &[u8], key: &[u8]) -> bool {
    // Interval crosses the origin.
    if id1 > id2 {
        return key > id1 || key < id2;
    }
    key > id1 && key < id2
}

/// Is `key` inside the half-open interval `(id1, id2]` clockwise?
pub fn between_right_incl(id1: &[u8], id2: &[u8], key: &[u8]) -> bool {
    if id1 > id2 {
        return key > id1 || key <= id2;
    }
    key > id1 && key <= id2
}

/// Compute `(id + 2^exp) mod 2^mod_bits` over big-endian bytes.
///
/// The result is always `mod_bits / 8` bytes, left-padded with zeroes.
pub fn power_offset(id: &[u8], exp: usize, mod_bits: usize) -> Vec<u8> {
    let width = mod_bits / 8;
    let mut out = vec![0u8; width];
    let copy = id.len().min(width);
    out[width - copy..].copy_from_slice(&id[id.len() - copy..]);

    // Add 2^exp: set bit `exp` counting from the least significant end,
    // rippling the carry toward the most significant byte. Overflow past
    // the top byte is the mod 2^mod_bits reduction.
    let byte = width - 1 - exp / 8;
    let mut carry = 1u16 << (exp % 8);
    let mut i = byte as isize;
    while carry != 0 && i >= 0 {
        let sum = out[i as usize] as u16 + (carry & 0xff);
        out[i as usize] = sum as u8;
        carry = (sum >> 8) + (carry >> 8);
        i -= 1;
    }
    out
}

/// Find the vnode nearest a key: the last vnode with id below the key, or
/// the final vnode when the key wraps below every id.
pub fn nearest_vnode<'a>(vnodes: &'a [Vnode], key: &[u8]) -> Option<&'a Vnode> {
    for vn in vnodes.iter().rev() {
        if vn.id.as_slice() < key {
            return Some(vn);
        }
    }
    vnodes.last()
}

/// Random stabilization delay in `[stabilize_min, stabilize_max)`.
pub fn rand_stabilize(conf: &Config) -> Duration {
    let min = conf.stabilize_min;
    let max = conf.stabilize_max;
    let r: f64 = rand::thread_rng().gen();
    min + Duration::from_secs_f64(r * (max - min).as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_between_simple() {
        assert!(between(&[10], &[20], &[15]));
        assert!(!between(&[10], &[20], &[10]));
        assert!(!between(&[10], &[20], &[20]));
        assert!(!between(&[10], &[20], &[25]));
    }

    #[test]
    fn test_between_wraps_origin() {
        // Interval (200, 10) crosses zero.
        assert!(between(&[200], &[10], &[250]));
        assert!(between(&[200], &[10], &[5]));
        assert!(!between(&[200], &[10], &[100]));
        assert!(!between(&[200], &[10], &[10]));
    }

    #[test]
    fn test_between_right_incl() {
        assert!(between_right_incl(&[10], &[20], &[20]));
        assert!(!between_right_incl(&[10], &[20], &[10]));

        assert!(between_right_incl(&[200], &[10], &[10]));
        assert!(between_right_incl(&[200], &[10], &[250]));
        assert!(!between_right_incl(&[200], &[10], &[200]));
    }

    #[test]
    fn test_power_offset_basic() {
        // 0 + 2^0 = 1 in an 8-bit space.
        assert_eq!(power_offset(&[0], 0, 8), vec![1]);
        // 255 + 2^0 wraps to 0.
        assert_eq!(power_offset(&[255], 0, 8), vec![0]);
        // 0x00ff + 2^8 = 0x01ff in a 16-bit space.
        assert_eq!(power_offset(&[0x00, 0xff], 8, 16), vec![0x01, 0xff]);
        // Carry ripples across bytes: 0x01ff + 2^0 = 0x0200.
        assert_eq!(power_offset(&[0x01, 0xff], 0, 16), vec![0x02, 0x00]);
    }

    #[test]
    fn test_power_offset_wraps_modulus() {
        // 0x80 + 2^7 = 0x100 ≡ 0 (mod 2^8).
        assert_eq!(power_offset(&[0x80], 7, 8), vec![0x00]);
        // Top-bit wrap in a wider space.
        assert_eq!(
            power_offset(&[0xff, 0xff], 15, 16),
            vec![0x7f, 0xff]
        );
    }

    #[test]
    fn test_power_offset_round_trip() {
        // Adding 2^k then 2^k * (2^(m-k) - 1) more steps walks the full
        // circle back to the start; spot-check with the inverse offset.
        let id = vec![0x3c, 0x5a];
        let forward = power_offset(&id, 3, 16);
        // Subtracting 2^3 mod 2^16 equals adding 2^16 - 2^3, i.e. adding
        // 2^3 another 8191 times; verify via direct integer math instead.
        let as_int = u16::from_be_bytes([forward[0], forward[1]]);
        assert_eq!(as_int.wrapping_sub(1 << 3).to_be_bytes().to_vec(), id);
    }

    #[test]
    fn test_power_offset_pads_short_ids() {
        let out = power_offset(&[0x01], 0, 32);
        assert_eq!(out, vec![0, 0, 0, 2]);
    }

    #[test]
    fn test_nearest_vnode() {
        let vnodes: Vec<Vnode> = [10u8, 50, 200]
            .iter()
            .map(|&b| Vnode::new(vec![b; crate::types::ID_BYTES], "h"))
            .collect();

        assert_eq!(
            nearest_vnode(&vnodes, &[60u8; 20]).unwrap().id[0],
            50
        );
        // Below every vnode wraps to the last one.
        assert_eq!(nearest_vnode(&vnodes, &[5u8; 20]).unwrap().id[0], 200);
        assert!(nearest_vnode(&[], &[5u8; 20]).is_none());
    }

    #[test]
    fn test_rand_stabilize_bounds() {
        let conf = Config::new("h").with_stabilize(
            Duration::from_millis(100),
            Duration::from_millis(200),
        );
        for _ in 0..64 {
            let d = rand_stabilize(&conf);
            assert!(d >= Duration::from_millis(100));
            assert!(d < Duration::from_millis(200));
        }
    }
}
