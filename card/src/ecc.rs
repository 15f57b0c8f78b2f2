// Copyright 2025 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Hamming-style error correction over 128-byte chunks.
//!
//! Every page is split into chunks of [`CHUNK_SIZE`] bytes, each protected by
//! a 3-byte code stored in the page's spare area. Byte 0 carries six column
//! parities of the XOR of all chunk bytes; bytes 1 and 2 carry seven line
//! parities each, over the per-byte bit parities projected onto
//! complementary power-of-two index masks. The construction locates any
//! single flipped data bit: XOR-ing a stored against a recomputed code yields
//! the flipped bit's byte index in byte 1 (complemented) and its bit index in
//! the upper half of byte 0.

/// Bytes covered by one ECC triplet.
pub const CHUNK_SIZE: usize = 128;

/// Bytes of ECC per chunk.
pub const ECC_SIZE: usize = 3;

/// Outcome of verifying one chunk against its stored ECC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Check {
    /// Stored and computed ECC agree.
    Valid,
    /// A single data bit was flipped and has been corrected in place.
    DataCorrected { byte: usize, bit: u8 },
    /// The data is intact but the stored ECC has a single flipped bit; the
    /// carried value is the recomputed code the caller should store instead.
    EccCorrected([u8; ECC_SIZE]),
    /// More than one bit is wrong; the chunk cannot be recovered.
    Invalid,
}

/// Computes the 3-byte ECC of a 128-byte chunk.
pub fn compute(chunk: &[u8]) -> [u8; ECC_SIZE] {
    let mut column = 0xFFu8;
    let mut line_even = 0u8;
    let mut line_odd = 0u8;
    for (index, &byte) in chunk.iter().enumerate() {
        column ^= byte;
        if byte.count_ones() & 1 != 0 {
            line_even ^= !(index as u8) & 0x7F;
            line_odd ^= index as u8;
        }
    }

    let parity = |mask: u8| ((column & mask).count_ones() & 1) as u8;
    let column_code = parity(0x55) << 1
        | parity(0x33) << 2
        | parity(0x0F) << 3
        | parity(0xAA) << 4
        | parity(0xCC) << 5
        | parity(0xF0) << 6;

    [column_code, line_even, line_odd]
}

/// Verifies `chunk` against its `stored` ECC, correcting a single flipped
/// data bit in place.
pub fn verify(chunk: &mut [u8], stored: &[u8; ECC_SIZE]) -> Check {
    let computed = compute(chunk);
    let test = [
        stored[0] ^ computed[0],
        stored[1] ^ computed[1],
        stored[2] ^ computed[2],
    ];
    let bits: u32 = test.iter().map(|byte| byte.count_ones()).sum();

    match bits {
        0 => Check::Valid,
        1 => Check::EccCorrected(computed),
        10 if test[1] & 0x80 == 0 && ((127 - test[1]) as usize) < chunk.len() => {
            let byte = (127 - test[1]) as usize;
            let bit = test[0] >> 4;
            chunk[byte] ^= 1 << bit;
            Check::DataCorrected { byte, bit }
        }
        _ => Check::Invalid,
    }
}

/// Synthesizes the spare area of a page: one ECC triplet per chunk, padded to
/// `spare_size` with the card's erased byte. Writes that do not originate
/// from a dump must use this; the card never recomputes ECC on write.
pub fn page_spare(data: &[u8], spare_size: usize, erased_byte: u8) -> Vec<u8> {
    let mut spare = Vec::with_capacity(spare_size);
    for chunk in data.chunks(CHUNK_SIZE) {
        spare.extend_from_slice(&compute(chunk));
    }
    spare.resize(spare_size, erased_byte);
    spare
}
