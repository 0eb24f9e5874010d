//! Reed-Solomon forward error correction over GF(2^8).
//!
//! The engine consumes the codec through the [`FecCodec`] seam: `encode`
//! produces one parity block for a transmission group of `k` originals,
//! `decode` reconstructs missing originals in place given any `k` blocks of
//! the group and the map of which code position each block came from.
//!
//! [`RsCodec`] is the default implementation: a systematic Vandermonde code
//! where positions `0..k` are the original packets verbatim and positions
//! `k..255` are parity. Parity rows are derived independently of the block
//! count `n`, so a receiver only needs to agree with the sender on `k`.

use std::sync::OnceLock;

pub trait FecCodec: Send + Sync {
    /// transmission group size `k`
    fn group_size(&self) -> usize;

    /// compute the parity block at code position `k + parity_index` over the
    /// `k` original blocks; blocks shorter than `out` count as zero-padded
    fn encode(&self, data: &[&[u8]], parity_index: usize, out: &mut [u8]);

    /// reconstruct missing originals in place. `blocks[i]` holds the block
    /// occupying group position `i`; `offsets[i]` names the code position it
    /// was received as (`i` itself for original data, `>= k` for parity).
    fn decode(&self, blocks: &mut [Vec<u8>], offsets: &[usize]);
}

// x^8 + x^4 + x^3 + x^2 + 1, generator alpha = 2
const GF_POLY: u16 = 0x11d;

struct GfTables {
    exp: [u8; 512],
    log: [u8; 256],
}

fn tables() -> &'static GfTables {
    static TABLES: OnceLock<GfTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= GF_POLY;
            }
        }
        // duplicate so mul can index log[a] + log[b] without a modulo
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        GfTables { exp, log }
    })
}

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = tables();
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

fn gf_inv(a: u8) -> u8 {
    debug_assert_ne!(a, 0);
    let t = tables();
    t.exp[255 - t.log[a as usize] as usize]
}

/// x_i^j for evaluation point x_i = alpha^i
fn vandermonde_row(i: usize, k: usize) -> Vec<u8> {
    let t = tables();
    let x = t.exp[i];
    let mut row = vec![0u8; k];
    let mut acc = 1u8;
    for cell in row.iter_mut() {
        *cell = acc;
        acc = gf_mul(acc, x);
    }
    row
}

/// Gauss-Jordan inversion of a k x k matrix in row-major order
fn invert(mut m: Vec<u8>, k: usize) -> Vec<u8> {
    let mut inv = vec![0u8; k * k];
    for i in 0..k {
        inv[i * k + i] = 1;
    }

    for col in 0..k {
        // pivot selection: any row with a non-zero entry in this column
        let pivot = (col..k)
            .find(|&r| m[r * k + col] != 0)
            .expect("vandermonde submatrix is invertible");
        if pivot != col {
            for j in 0..k {
                m.swap(col * k + j, pivot * k + j);
                inv.swap(col * k + j, pivot * k + j);
            }
        }

        let scale = gf_inv(m[col * k + col]);
        for j in 0..k {
            m[col * k + j] = gf_mul(m[col * k + j], scale);
            inv[col * k + j] = gf_mul(inv[col * k + j], scale);
        }

        for r in 0..k {
            if r == col {
                continue;
            }
            let factor = m[r * k + col];
            if factor == 0 {
                continue;
            }
            for j in 0..k {
                let a = gf_mul(factor, m[col * k + j]);
                let b = gf_mul(factor, inv[col * k + j]);
                m[r * k + j] ^= a;
                inv[r * k + j] ^= b;
            }
        }
    }
    inv
}

pub struct RsCodec {
    k: usize,
    /// inverse of the top k x k Vandermonde block; multiplying any further
    /// Vandermonde row by this yields the systematic generator row
    inv_top: Vec<u8>,
}

impl RsCodec {
    pub fn new(k: usize) -> RsCodec {
        assert!((1..=128).contains(&k));
        let mut top = Vec::with_capacity(k * k);
        for i in 0..k {
            top.extend_from_slice(&vandermonde_row(i, k));
        }
        RsCodec { k, inv_top: invert(top, k) }
    }

    /// row `i` of the systematic generator matrix
    fn generator_row(&self, i: usize) -> Vec<u8> {
        assert!(i < 255, "code position beyond GF(2^8) block bound");
        let k = self.k;
        if i < k {
            let mut row = vec![0u8; k];
            row[i] = 1;
            return row;
        }
        let v = vandermonde_row(i, k);
        let mut row = vec![0u8; k];
        for (j, cell) in row.iter_mut().enumerate() {
            let mut acc = 0u8;
            for t in 0..k {
                acc ^= gf_mul(v[t], self.inv_top[t * k + j]);
            }
            *cell = acc;
        }
        row
    }

    fn row_dot(&self, row: &[u8], blocks: &[Vec<u8>], len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        for (j, block) in blocks.iter().enumerate() {
            let c = row[j];
            if c == 0 {
                continue;
            }
            for (b, &byte) in block.iter().take(len).enumerate() {
                out[b] ^= gf_mul(c, byte);
            }
        }
        out
    }
}

impl FecCodec for RsCodec {
    fn group_size(&self) -> usize {
        self.k
    }

    fn encode(&self, data: &[&[u8]], parity_index: usize, out: &mut [u8]) {
        assert_eq!(data.len(), self.k);
        let row = self.generator_row(self.k + parity_index);
        out.fill(0);
        for (j, block) in data.iter().enumerate() {
            let c = row[j];
            if c == 0 {
                continue;
            }
            for (b, &byte) in block.iter().take(out.len()).enumerate() {
                out[b] ^= gf_mul(c, byte);
            }
        }
    }

    fn decode(&self, blocks: &mut [Vec<u8>], offsets: &[usize]) {
        let k = self.k;
        assert_eq!(blocks.len(), k);
        assert_eq!(offsets.len(), k);

        if offsets.iter().enumerate().all(|(i, &o)| o == i) {
            return;
        }

        let mut a = Vec::with_capacity(k * k);
        for &offset in offsets {
            a.extend_from_slice(&self.generator_row(offset));
        }
        let inv = invert(a, k);

        let len = blocks.iter().map(Vec::len).max().unwrap_or(0);
        let recovered = offsets
            .iter()
            .enumerate()
            .filter(|&(i, &o)| o != i)
            .map(|(i, _)| (i, self.row_dot(&inv[i * k..(i + 1) * k], blocks, len)))
            .collect::<Vec<_>>();

        for (i, data) in recovered {
            blocks[i] = data;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_gf_mul_inverse() {
        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1, "a = {}", a);
        }
    }

    #[test]
    fn test_generator_systematic() {
        let codec = RsCodec::new(8);
        for i in 0..8 {
            let row = codec.generator_row(i);
            let mut expected = vec![0u8; 8];
            expected[i] = 1;
            assert_eq!(row, expected);
        }
    }

    fn group(k: usize, len: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|i| (0..len).map(|b| (i * 37 + b * 11 + 5) as u8).collect())
            .collect()
    }

    #[rstest]
    #[case::lose_two_of_four(4, vec![1, 3])]
    #[case::lose_first(4, vec![0])]
    #[case::lose_last_two(8, vec![6, 7])]
    #[case::lose_three(8, vec![0, 3, 5])]
    fn test_recover_lost_blocks(#[case] k: usize, #[case] lost: Vec<usize>) {
        let codec = RsCodec::new(k);
        let original = group(k, 32);
        let refs = original.iter().map(Vec::as_slice).collect::<Vec<_>>();

        let mut parity = Vec::new();
        for h in 0..lost.len() {
            let mut block = vec![0u8; 32];
            codec.encode(&refs, h, &mut block);
            parity.push(block);
        }

        let mut blocks = original.clone();
        let mut offsets = (0..k).collect::<Vec<_>>();
        for (h, &position) in lost.iter().enumerate() {
            blocks[position] = parity[h].clone();
            offsets[position] = k + h;
        }

        codec.decode(&mut blocks, &offsets);
        assert_eq!(blocks, original);
    }

    #[test]
    fn test_decode_noop_when_complete() {
        let codec = RsCodec::new(4);
        let mut blocks = group(4, 16);
        let expected = blocks.clone();
        codec.decode(&mut blocks, &[0, 1, 2, 3]);
        assert_eq!(blocks, expected);
    }

    #[test]
    fn test_short_blocks_zero_padded() {
        let codec = RsCodec::new(2);
        let a = vec![1u8, 2, 3, 4];
        let b = vec![9u8, 8]; // will be zero-padded to 4 during encode

        let mut parity = vec![0u8; 4];
        codec.encode(&[&a, &b], 0, &mut parity);

        let mut blocks = vec![a.clone(), parity];
        codec.decode(&mut blocks, &[0, 2]);
        assert_eq!(blocks[1], vec![9, 8, 0, 0]);
    }

    #[test]
    fn test_parity_rows_independent_of_n() {
        // a receiver that only knows k must derive the same parity rows the
        // sender used, whatever n the sender configured
        let sender = RsCodec::new(4);
        let receiver = RsCodec::new(4);
        assert_eq!(sender.generator_row(5), receiver.generator_row(5));
    }
}
