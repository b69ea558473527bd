//! LZSS codec for `data_format_identifier = 0x10` blocks
//!
//! Bit-oriented LZSS with a 1024-byte window (10-bit offsets) and 4-bit
//! lengths. A set flag bit is followed by one literal byte; a clear flag bit
//! by an absolute window position and a length biased by 2. The window starts
//! filled with spaces and writing begins at `N - F`. Bits are packed MSB
//! first; the stream ends when too few bits remain for the next token.

const EI: u32 = 10;
const EJ: u32 = 4;
/// Matches no longer than this are emitted as literals
const P: usize = 1;
const N: usize = 1 << EI;
const F: usize = (1 << EJ) + P;
const FILL: u8 = b' ';

struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    fn read(&mut self, bits: u32) -> Option<u32> {
        if self.bit + bits as usize > self.data.len() * 8 {
            return None;
        }
        let mut value = 0u32;
        for _ in 0..bits {
            let byte = self.data[self.bit / 8];
            let set = (byte >> (7 - (self.bit % 8))) & 1;
            value = (value << 1) | set as u32;
            self.bit += 1;
        }
        Some(value)
    }
}

#[derive(Default)]
struct BitWriter {
    out: Vec<u8>,
    acc: u8,
    used: u32,
}

impl BitWriter {
    fn write(&mut self, value: u32, bits: u32) {
        for k in (0..bits).rev() {
            self.acc = (self.acc << 1) | ((value >> k) & 1) as u8;
            self.used += 1;
            if self.used == 8 {
                self.out.push(self.acc);
                self.acc = 0;
                self.used = 0;
            }
        }
    }

    /// Pad the last byte with zero bits
    fn finish(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.out.push(self.acc << (8 - self.used));
        }
        self.out
    }
}

pub fn decompress(data: &[u8]) -> Vec<u8> {
    let mut window = [FILL; N];
    let mut r = N - F;
    let mut reader = BitReader::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);

    while let Some(flag) = reader.read(1) {
        if flag == 1 {
            let Some(c) = reader.read(8) else { break };
            let c = c as u8;
            out.push(c);
            window[r] = c;
            r = (r + 1) & (N - 1);
        } else {
            let Some(position) = reader.read(EI) else { break };
            let Some(length) = reader.read(EJ) else { break };
            for k in 0..=(length as usize + P) {
                let c = window[(position as usize + k) & (N - 1)];
                out.push(c);
                window[r] = c;
                r = (r + 1) & (N - 1);
            }
        }
    }

    out
}

pub fn compress(data: &[u8]) -> Vec<u8> {
    // Virtual buffer: the prefilled window followed by the input
    let mut buffer = vec![FILL; N - F];
    buffer.extend_from_slice(data);

    let end = buffer.len();
    let mut writer = BitWriter::default();
    let mut r = N - F;

    while r < end {
        let max_len = F.min(end - r);
        let (mut best_pos, mut best_len) = (0usize, 1usize);

        for i in (r - (N - F)..r).rev() {
            if buffer[i] != buffer[r] {
                continue;
            }
            let mut j = 1;
            while j < max_len && buffer[i + j] == buffer[r + j] {
                j += 1;
            }
            if j > best_len {
                best_pos = i;
                best_len = j;
                if j == max_len {
                    break;
                }
            }
        }

        if best_len <= P {
            writer.write(1, 1);
            writer.write(buffer[r] as u32, 8);
            r += 1;
        } else {
            writer.write(0, 1);
            writer.write((best_pos & (N - 1)) as u32, EI);
            writer.write((best_len - (P + 1)) as u32, EJ);
            r += best_len;
        }
    }

    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decompress_known_stream() {
        // literal 'a', then a 3-byte match overlapping the write position
        assert_eq!(decompress(&[0xB0, 0xBE, 0xF1]), b"aaaa".to_vec());
    }

    #[test]
    fn test_matches_reach_prefilled_window() {
        let compressed = compress(b"    hello");
        assert_eq!(compressed, vec![0x7D, 0xC5, 0x68, 0xB2, 0xDB, 0x2D, 0x96, 0xF0]);
        assert_eq!(decompress(&compressed), b"    hello".to_vec());
    }

    #[test]
    fn test_compress_known_stream() {
        assert_eq!(compress(b"aaaa"), vec![0xB0, 0xBE, 0xF1]);
    }

    #[test]
    fn test_repetitive_data_shrinks() {
        let data: Vec<u8> = b"ABAB".iter().cycle().take(360).copied().collect();
        let compressed = compress(&data);
        assert!(compressed.len() < data.len() / 4);
        assert_eq!(decompress(&compressed), data);
    }

    #[test]
    fn test_window_wraps() {
        let data: Vec<u8> = (0..5000u32).map(|i| ((i * 31) % 251) as u8).collect();
        assert_eq!(decompress(&compress(&data)), data);
    }

    #[test]
    fn test_empty() {
        assert!(compress(&[]).is_empty());
        assert!(decompress(&[]).is_empty());
    }
}
