/*!
 * CRC-64/ECMA checksums that can be computed per part and combined
 *
 * Parts are hashed independently (and concurrently); the whole-object value
 * is recovered by folding the per-part values in ascending part order with
 * the zlib-style GF(2) combination.
 */

use crc::{Crc, Digest, CRC_64_XZ};
use serde::{Deserialize, Serialize};
use std::io::{self, Read};

/// Reflected ECMA-182 polynomial
const POLY_REFLECTED: u64 = 0xC96C_5795_D787_0F42;

/// CRC-64 with the reflected ECMA polynomial, all-ones init and xor-out
pub static CRC64_ECMA: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// One-shot CRC-64 of a buffer
pub fn crc64(data: &[u8]) -> u64 {
    CRC64_ECMA.checksum(data)
}

fn gf2_matrix_times(mat: &[u64; 64], mut vec: u64) -> u64 {
    let mut sum = 0u64;
    let mut i = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u64; 64], mat: &[u64; 64]) {
    for n in 0..64 {
        square[n] = gf2_matrix_times(mat, mat[n]);
    }
}

/// CRC of `A || B` given `crc(A)`, `crc(B)` and `len(B)`
pub fn crc64_combine(mut crc1: u64, crc2: u64, mut len2: u64) -> u64 {
    if len2 == 0 {
        return crc1;
    }

    let mut even = [0u64; 64];
    let mut odd = [0u64; 64];

    // operator for one zero bit
    odd[0] = POLY_REFLECTED;
    let mut row = 1u64;
    for entry in odd.iter_mut().skip(1) {
        *entry = row;
        row <<= 1;
    }

    // two zero bits, then four
    gf2_matrix_square(&mut even, &odd);
    gf2_matrix_square(&mut odd, &even);

    loop {
        gf2_matrix_square(&mut even, &odd);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&even, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }

        gf2_matrix_square(&mut odd, &even);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&odd, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }

    crc1 ^ crc2
}

/// Running CRC-64 assembled from per-part values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumAccumulator {
    crc: u64,
    length: u64,
}

impl ChecksumAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a part's CRC. Callers must feed parts in ascending order.
    pub fn combine(&mut self, partial: u64, partial_length: u64) {
        self.crc = crc64_combine(self.crc, partial, partial_length);
        self.length += partial_length;
    }

    /// Fold an ordered sequence of `(crc, length)` pairs
    pub fn from_parts<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let mut acc = Self::new();
        for (crc, len) in parts {
            acc.combine(crc, len);
        }
        acc
    }

    pub fn value(&self) -> u64 {
        self.crc
    }

    /// Bytes folded in so far
    pub fn length(&self) -> u64 {
        self.length
    }
}

/// Reader adapter that hashes everything passing through it
pub struct Crc64Reader<R> {
    inner: R,
    digest: Digest<'static, u64>,
    bytes_read: u64,
}

impl<R: Read> Crc64Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digest: CRC64_ECMA.digest(),
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// CRC of the bytes read so far
    pub fn crc64(&self) -> u64 {
        self.digest.clone().finalize()
    }
}

impl<R: Read> Read for Crc64Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}
