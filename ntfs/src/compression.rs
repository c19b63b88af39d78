// Pluggable block compression for compressed attributes, with the LZNT1 codec
// LZNT1 works on 4K chunks; a chunk header carries the stored size and a
// compressed flag, and back-reference tokens split their 16 bits between
// displacement and length depending on the position inside the chunk

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use ntfsrw_core::{NtfsError, Result};

pub const LZNT1_CHUNK_SIZE: usize = 4096;

const CHUNK_COMPRESSED: u16 = 0x8000;
const CHUNK_SIGNATURE: u16 = 0x3000;
const HASH_BITS: u32 = 12;
const MAX_CHAIN: usize = 64;
const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionOutcome {
    /// The returned bytes are smaller than the input.
    Compressed,
    /// Not worth compressing; the caller stores the plaintext.
    Stored,
    /// The input is entirely zero; nothing needs storing.
    AllZeros,
}

pub trait Compressor: Send {
    /// Compress one compression unit. Only `Compressed` returns bytes.
    fn compress(&self, block: &[u8]) -> Result<(CompressionOutcome, Vec<u8>)>;

    /// Expand a stored unit to exactly `output_len` bytes.
    fn decompress(&self, block: &[u8], output_len: usize) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Lznt1;

impl Compressor for Lznt1 {
    fn compress(&self, block: &[u8]) -> Result<(CompressionOutcome, Vec<u8>)> {
        let Some(last_nonzero) = block.iter().rposition(|&b| b != 0) else {
            return Ok((CompressionOutcome::AllZeros, Vec::new()));
        };
        // Trailing all-zero chunks are implied by the end marker
        let used = (last_nonzero / LZNT1_CHUNK_SIZE + 1) * LZNT1_CHUNK_SIZE;
        let mut out = Vec::with_capacity(block.len() / 2);
        for chunk in block[..used.min(block.len())].chunks(LZNT1_CHUNK_SIZE) {
            compress_chunk(chunk, &mut out);
            if out.len() >= block.len() {
                return Ok((CompressionOutcome::Stored, Vec::new()));
            }
        }
        trace!("LZNT1 compressed {} bytes to {}", block.len(), out.len());
        if out.len() + 2 <= block.len() {
            out.extend_from_slice(&[0, 0]);
        }
        Ok((CompressionOutcome::Compressed, out))
    }

    fn decompress(&self, block: &[u8], output_len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(output_len + LZNT1_CHUNK_SIZE);
        let mut pos = 0;
        while pos + 2 <= block.len() && out.len() < output_len {
            let header = LittleEndian::read_u16(&block[pos..]);
            if header == 0 {
                break;
            }
            pos += 2;
            let size = (header & 0x0FFF) as usize + 1;
            if pos + size > block.len() {
                return Err(NtfsError::FormatCorruption("LZNT1 chunk extends beyond buffer".to_string()));
            }
            let chunk_start = out.len();
            let data = &block[pos..pos + size];
            if header & CHUNK_COMPRESSED != 0 {
                decompress_chunk(data, &mut out, chunk_start)?;
            } else {
                out.extend_from_slice(data);
            }
            if out.len() - chunk_start > LZNT1_CHUNK_SIZE {
                return Err(NtfsError::FormatCorruption("LZNT1 chunk expands past 4096 bytes".to_string()));
            }
            // Short chunks are zero padded
            out.resize(chunk_start + LZNT1_CHUNK_SIZE, 0);
            pos += size;
        }
        out.resize(output_len, 0);
        Ok(out)
    }
}

/// Bits of a token given to the match length at `pos` within the chunk.
fn length_bits(pos: usize) -> u32 {
    let mut bits = 12;
    let mut p = pos.saturating_sub(1);
    while p >= 0x10 {
        p >>= 1;
        bits -= 1;
    }
    bits
}

fn hash3(bytes: &[u8]) -> usize {
    let v = (bytes[0] as u32) << 16 | (bytes[1] as u32) << 8 | bytes[2] as u32;
    (v.wrapping_mul(2654435761) >> (32 - HASH_BITS)) as usize
}

fn decompress_chunk(data: &[u8], out: &mut Vec<u8>, chunk_start: usize) -> Result<()> {
    let mut i = 0;
    while i < data.len() {
        let flags = data[i];
        i += 1;
        for bit in 0..8 {
            if i >= data.len() {
                break;
            }
            if flags & (1 << bit) == 0 {
                out.push(data[i]);
                i += 1;
                continue;
            }
            if i + 2 > data.len() {
                return Err(NtfsError::FormatCorruption("LZNT1 token truncated".to_string()));
            }
            let token = LittleEndian::read_u16(&data[i..]);
            i += 2;
            let pos = out.len() - chunk_start;
            let l_bits = length_bits(pos);
            let length = (token & ((1u16 << l_bits) - 1)) as usize + 3;
            let displacement = (token >> l_bits) as usize + 1;
            if displacement > pos {
                return Err(NtfsError::FormatCorruption(format!(
                    "LZNT1 back-reference {} before chunk start at {}",
                    displacement, pos
                )));
            }
            for _ in 0..length {
                let b = out[out.len() - displacement];
                out.push(b);
            }
        }
    }
    Ok(())
}

fn compress_chunk(chunk: &[u8], out: &mut Vec<u8>) {
    let header_pos = out.len();
    out.extend_from_slice(&[0, 0]);
    let body_start = out.len();
    let n = chunk.len();

    let mut head = vec![NIL; 1 << HASH_BITS];
    let mut prev = vec![NIL; n];

    let mut pos = 0;
    while pos < n {
        let flag_pos = out.len();
        out.push(0);
        let mut flags = 0u8;
        for bit in 0..8 {
            if pos >= n {
                break;
            }
            let (length, displacement) = longest_match(chunk, pos, &head, &prev);
            if length >= 3 {
                let l_bits = length_bits(pos);
                let token = (((displacement - 1) as u16) << l_bits) | (length - 3) as u16;
                out.extend_from_slice(&token.to_le_bytes());
                flags |= 1 << bit;
                for p in pos..pos + length {
                    insert_hash(chunk, p, &mut head, &mut prev);
                }
                pos += length;
            } else {
                out.push(chunk[pos]);
                insert_hash(chunk, pos, &mut head, &mut prev);
                pos += 1;
            }
        }
        out[flag_pos] = flags;
        if out.len() - body_start >= n {
            break;
        }
    }

    let body = out.len() - body_start;
    if body >= n {
        out.truncate(header_pos);
        out.extend_from_slice(&(CHUNK_SIGNATURE | (n - 1) as u16).to_le_bytes());
        out.extend_from_slice(chunk);
    } else {
        let header = CHUNK_COMPRESSED | CHUNK_SIGNATURE | (body - 1) as u16;
        out[header_pos..body_start].copy_from_slice(&header.to_le_bytes());
    }
}

fn insert_hash(chunk: &[u8], pos: usize, head: &mut [usize], prev: &mut [usize]) {
    if pos + 3 <= chunk.len() {
        let h = hash3(&chunk[pos..]);
        prev[pos] = head[h];
        head[h] = pos;
    }
}

fn longest_match(chunk: &[u8], pos: usize, head: &[usize], prev: &[usize]) -> (usize, usize) {
    if pos == 0 || pos + 3 > chunk.len() {
        return (0, 0);
    }
    let l_bits = length_bits(pos);
    let max_len = ((1usize << l_bits) - 1 + 3).min(chunk.len() - pos);
    let max_disp = (1usize << (16 - l_bits)).min(pos);

    let mut best = (0, 0);
    let mut candidate = head[hash3(&chunk[pos..])];
    let mut steps = 0;
    while candidate != NIL && steps < MAX_CHAIN {
        let displacement = pos - candidate;
        if displacement > max_disp {
            break;
        }
        let mut length = 0;
        while length < max_len && chunk[candidate + length] == chunk[pos + length] {
            length += 1;
        }
        if length > best.0 {
            best = (length, displacement);
            if length == max_len {
                break;
            }
        }
        candidate = prev[candidate];
        steps += 1;
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    #[test]
    fn test_length_bits() {
        assert_eq!(length_bits(1), 12);
        assert_eq!(length_bits(16), 12);
        assert_eq!(length_bits(17), 11);
        assert_eq!(length_bits(4095), 4);
    }

    #[test]
    fn test_decompress_literal_chunk() {
        // Compressed chunk with 3 literals "abc"
        let block = [0x03, 0xB0, 0x00, b'a', b'b', b'c', 0x00, 0x00];
        let out = Lznt1.decompress(&block, 8).unwrap();
        assert_eq!(&out[..3], b"abc");
        assert!(out[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_compressible_roundtrip() {
        let data: Vec<u8> = b"The quick brown fox jumps over the lazy dog. ".iter().cycle().take(65536).copied().collect();
        let (outcome, compressed) = Lznt1.compress(&data).unwrap();
        assert_eq!(outcome, CompressionOutcome::Compressed);
        assert!(compressed.len() < 8192);
        assert_eq!(Lznt1.decompress(&compressed, data.len()).unwrap(), data);
    }

    #[test]
    fn test_long_runs_and_trailing_zeros() {
        let mut data = vec![0u8; 65536];
        data[..5000].fill(b'x');
        data[5000] = 1;
        let (outcome, compressed) = Lznt1.compress(&data).unwrap();
        assert_eq!(outcome, CompressionOutcome::Compressed);
        assert_eq!(Lznt1.decompress(&compressed, data.len()).unwrap(), data);
    }

    #[test]
    fn test_random_data_is_stored() {
        let mut data = vec![0u8; 16384];
        StdRng::seed_from_u64(7).fill_bytes(&mut data);
        let (outcome, bytes) = Lznt1.compress(&data).unwrap();
        assert_eq!(outcome, CompressionOutcome::Stored);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_all_zeros() {
        let (outcome, _) = Lznt1.compress(&[0u8; 8192]).unwrap();
        assert_eq!(outcome, CompressionOutcome::AllZeros);
    }

    #[test]
    fn test_mixed_chunks_roundtrip() {
        let mut rng = StdRng::seed_from_u64(99);
        let mut data = vec![0u8; 65536];
        rng.fill_bytes(&mut data[..4096]);
        for (i, b) in data[4096..20000].iter_mut().enumerate() {
            *b = (i % 13) as u8;
        }
        let (outcome, compressed) = Lznt1.compress(&data).unwrap();
        assert_eq!(outcome, CompressionOutcome::Compressed);
        assert_eq!(Lznt1.decompress(&compressed, data.len()).unwrap(), data);
    }

    #[test]
    fn test_bad_backreference() {
        // Token at position 0 cannot refer backwards
        let block = [0x02, 0xB0, 0x01, 0x00, 0x00];
        assert!(matches!(Lznt1.decompress(&block, 16), Err(NtfsError::FormatCorruption(_))));
    }
}
