//! Microsoft QuickXorHash.
//!
//! A 160-bit non-cryptographic digest used by OneDrive for Business: each
//! input byte is XORed into a circularly-shifting 160-bit window at 11-bit
//! strides, and the total input length is XORed little-endian into the
//! trailing 8 bytes of the result.

/// Digest width in bytes.
pub const SIZE: usize = 20;

const WIDTH_IN_BITS: usize = 8 * SIZE;
const DATA_CELLS: usize = (WIDTH_IN_BITS - 1) / 64 + 1;
const BITS_IN_LAST_CELL: usize = WIDTH_IN_BITS - 64 * (DATA_CELLS - 1);
const SHIFT: usize = 11;

/// Streaming QuickXorHash state.
#[derive(Debug, Clone)]
pub struct QuickXorHash {
    data: [u64; DATA_CELLS],
    length_so_far: u64,
    shift_so_far: usize,
}

impl QuickXorHash {
    pub fn new() -> Self {
        QuickXorHash {
            data: [0; DATA_CELLS],
            length_so_far: 0,
            shift_so_far: 0,
        }
    }

    /// Absorb `p` into the hash state.
    pub fn update(&mut self, p: &[u8]) {
        let current_shift = self.shift_so_far;
        let mut vector_array_index = current_shift / 64;
        let mut vector_offset = current_shift % 64;
        let iterations = p.len().min(WIDTH_IN_BITS);

        for i in 0..iterations {
            let is_last_cell = vector_array_index == DATA_CELLS - 1;
            let bits_in_vector_cell = if is_last_cell { BITS_IN_LAST_CELL } else { 64 };

            if vector_offset <= bits_in_vector_cell - 8 {
                let mut j = i;
                while j < p.len() {
                    self.data[vector_array_index] ^= (p[j] as u64) << vector_offset;
                    j += WIDTH_IN_BITS;
                }
            } else {
                // The byte straddles two cells; split it at the boundary.
                let index1 = vector_array_index;
                let index2 = if is_last_cell { 0 } else { vector_array_index + 1 };
                let low = (bits_in_vector_cell - vector_offset) as u32;

                let mut xored_byte = 0u8;
                let mut j = i;
                while j < p.len() {
                    xored_byte ^= p[j];
                    j += WIDTH_IN_BITS;
                }
                self.data[index1] ^= (xored_byte as u64) << vector_offset;
                self.data[index2] ^= (xored_byte as u64) >> low;
            }

            vector_offset += SHIFT;
            while vector_offset >= bits_in_vector_cell {
                vector_array_index = if is_last_cell {
                    0
                } else {
                    vector_array_index + 1
                };
                vector_offset -= bits_in_vector_cell;
            }
        }

        self.shift_so_far =
            (self.shift_so_far + SHIFT * (p.len() % WIDTH_IN_BITS)) % WIDTH_IN_BITS;
        self.length_so_far += p.len() as u64;
    }

    /// Produce the 20-byte digest.
    pub fn finalize(&self) -> [u8; SIZE] {
        let mut h = [0u8; SIZE];
        for (i, cell) in self.data.iter().enumerate().take(DATA_CELLS - 1) {
            h[i * 8..i * 8 + 8].copy_from_slice(&cell.to_le_bytes());
        }
        let last = self.data[DATA_CELLS - 1].to_le_bytes();
        h[(DATA_CELLS - 1) * 8..].copy_from_slice(&last[..SIZE - (DATA_CELLS - 1) * 8]);

        // XOR the total length into the least significant position.
        for (i, b) in self.length_so_far.to_le_bytes().iter().enumerate() {
            h[SIZE - 8 + i] ^= b;
        }
        h
    }
}

impl Default for QuickXorHash {
    fn default() -> Self {
        Self::new()
    }
}
