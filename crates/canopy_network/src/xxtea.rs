//! XXTEA body cipher.
//!
//! Corrected Block TEA over little-endian 32-bit words. The plaintext length
//! is appended as a trailing word before encryption and checked on the way
//! back, so ciphertext is always a multiple of four bytes and at least eight.

const DELTA: u32 = 0x9E37_79B9;

/// Key every frame body is encrypted with.
pub const KEY: &[u8] = b"0123456789";

pub fn encrypt(data: &[u8]) -> Vec<u8> {
    encrypt_with_key(data, KEY)
}

/// Returns `None` when `data` is not a well-formed ciphertext.
pub fn decrypt(data: &[u8]) -> Option<Vec<u8>> {
    decrypt_with_key(data, KEY)
}

pub fn encrypt_with_key(data: &[u8], key: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut v = to_words(data, true);
    encrypt_words(&mut v, &fix_key(to_words(key, false)));
    to_bytes(&v, false).unwrap_or_default()
}

pub fn decrypt_with_key(data: &[u8], key: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() {
        return Some(Vec::new());
    }
    let mut v = to_words(data, false);
    decrypt_words(&mut v, &fix_key(to_words(key, false)));
    to_bytes(&v, true)
}

fn to_words(bytes: &[u8], include_length: bool) -> Vec<u32> {
    let n = bytes.len().div_ceil(4);
    let mut v = vec![0u32; if include_length { n + 1 } else { n }];
    for (i, b) in bytes.iter().enumerate() {
        v[i >> 2] |= u32::from(*b) << ((i & 3) << 3);
    }
    if include_length {
        v[n] = bytes.len() as u32;
    }
    v
}

fn to_bytes(v: &[u32], include_length: bool) -> Option<Vec<u8>> {
    let mut n = v.len() << 2;
    if include_length {
        let m = *v.last()? as usize;
        n = n.checked_sub(4)?;
        if m + 3 < n || m > n {
            return None;
        }
        n = m;
    }
    Some((0..n).map(|i| (v[i >> 2] >> ((i & 3) << 3)) as u8).collect())
}

fn fix_key(mut k: Vec<u32>) -> [u32; 4] {
    k.resize(4, 0);
    [k[0], k[1], k[2], k[3]]
}

#[inline]
fn mx(sum: u32, y: u32, z: u32, p: usize, e: u32, k: &[u32; 4]) -> u32 {
    ((z >> 5 ^ y << 2).wrapping_add(y >> 3 ^ z << 4))
        ^ ((sum ^ y).wrapping_add(k[(p & 3) ^ e as usize] ^ z))
}

fn encrypt_words(v: &mut [u32], k: &[u32; 4]) {
    let n = v.len() - 1;
    let mut z = v[n];
    let mut sum = 0u32;
    let mut rounds = 6 + 52 / v.len();
    while rounds > 0 {
        sum = sum.wrapping_add(DELTA);
        let e = (sum >> 2) & 3;
        let mut p = 0;
        while p < n {
            let y = v[p + 1];
            v[p] = v[p].wrapping_add(mx(sum, y, z, p, e, k));
            z = v[p];
            p += 1;
        }
        let y = v[0];
        v[n] = v[n].wrapping_add(mx(sum, y, z, p, e, k));
        z = v[n];
        rounds -= 1;
    }
}

fn decrypt_words(v: &mut [u32], k: &[u32; 4]) {
    let n = v.len() - 1;
    let rounds = (6 + 52 / v.len()) as u32;
    let mut sum = rounds.wrapping_mul(DELTA);
    let mut y = v[0];
    while sum != 0 {
        let e = (sum >> 2) & 3;
        let mut p = n;
        while p > 0 {
            let z = v[p - 1];
            v[p] = v[p].wrapping_sub(mx(sum, y, z, p, e, k));
            y = v[p];
            p -= 1;
        }
        let z = v[n];
        v[0] = v[0].wrapping_sub(mx(sum, y, z, p, e, k));
        y = v[0];
        sum = sum.wrapping_sub(DELTA);
    }
}
