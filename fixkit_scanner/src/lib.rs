use std::fmt::Display;

use anyhow::{bail, Error, Result};

/// Byte signature with a per-byte mask. A mask of `0xff` requires an exact byte, `0x00`
/// accepts any byte and anything in between is a partial (nibble or bit) wildcard.
#[derive(Clone, Eq, PartialEq)]
pub struct PatternSimple {
    pub sig: Vec<u8>,
    pub mask: Vec<u8>,
}
impl PatternSimple {
    /// Caller guarantees `index + self.len() <= data.len()`.
    #[inline(always)]
    pub fn is_match(&self, data: &[u8], index: usize) -> bool {
        for i in 0..self.len() {
            if data[index + i] & self.mask[i] != self.sig[i] {
                return false;
            }
        }
        true
    }
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.sig.len()
    }
    pub fn iter(&self) -> std::iter::Zip<std::slice::Iter<u8>, std::slice::Iter<u8>> {
        self.sig.iter().zip(&self.mask)
    }
}
impl Display for PatternSimple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (sig, mask)) in self.iter().enumerate() {
            if i != 0 {
                write!(f, " ")?;
            }
            write_token(f, *sig, *mask)?;
        }
        Ok(())
    }
}
impl std::fmt::Debug for PatternSimple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PatternSimple(\"{self}\")")
    }
}

fn write_token(f: &mut std::fmt::Formatter<'_>, sig: u8, mask: u8) -> std::fmt::Result {
    match mask {
        0 => write!(f, "??"),
        0xff => write!(f, "{:02X}", sig),
        0xf0 => write!(f, "{:X}?", sig >> 4),
        0x0f => write!(f, "?{:X}", sig & 0xf),
        _ => {
            for bit in (0..8).rev() {
                if mask & (1 << bit) == 0 {
                    write!(f, "?")?;
                } else {
                    write!(f, "{}", (sig >> bit) & 1)?;
                }
            }
            Ok(())
        }
    }
}

/// A signature plus the offset of the interesting instruction inside it.
///
/// Pattern text is a list of whitespace separated words:
///  - `8B` exact byte
///  - `??` any byte, `8?`/`?B` nibble wildcards
///  - `01?10?11` bit pattern
///  - `|` marks `custom_offset`, the position the caller actually wants (e.g. the
///    instruction to hook) relative to the start of the match
#[derive(Clone, Eq, PartialEq)]
pub struct Pattern {
    pub simple: PatternSimple,
    pub custom_offset: usize,
}

impl TryFrom<String> for Pattern {
    type Error = Error;
    fn try_from(string: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        Self::new(string)
    }
}
impl TryFrom<&str> for Pattern {
    type Error = Error;
    fn try_from(string: &str) -> Result<Self, <Self as TryFrom<&str>>::Error> {
        Self::new(string)
    }
}
impl std::str::FromStr for Pattern {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl Pattern {
    fn parse_binary_patern(s: &str) -> Option<(u8, u8)> {
        if s.len() == 8 {
            let mut sig = 0;
            let mut mask = 0;
            for (i, b) in s.chars().enumerate() {
                let i = 7 - i;
                match b {
                    '0' => {
                        mask |= 1 << i;
                    }
                    '1' => {
                        sig |= 1 << i;
                        mask |= 1 << i;
                    }
                    '?' => {}
                    _ => return None,
                }
            }
            Some((sig, mask))
        } else {
            None
        }
    }

    fn parse_hex_pattern(s: &str) -> Option<(u8, u8)> {
        if s.len() == 2 {
            let mut sig = 0;
            let mut mask = 0;
            for (i, b) in s.chars().enumerate() {
                let i = (1 - i) * 4;
                if let Some(digit) = b.to_digit(16) {
                    sig |= (digit as u8) << i;
                    mask |= 0xf << i;
                } else if b != '?' {
                    return None;
                }
            }
            Some((sig, mask))
        } else {
            None
        }
    }

    pub fn new<S: AsRef<str>>(s: S) -> Result<Self> {
        let mut sig = vec![];
        let mut mask = vec![];
        let mut custom_offset = None;

        for w in s.as_ref().split_whitespace() {
            if let Some((s, m)) =
                Self::parse_hex_pattern(w).or_else(|| Self::parse_binary_patern(w))
            {
                sig.push(s);
                mask.push(m);
            } else if w == "|" {
                if custom_offset.is_some() {
                    bail!("duplicate offset marker at word {}", sig.len());
                }
                custom_offset = Some(sig.len());
            } else {
                bail!("bad pattern word \"{}\"", w)
            }
        }
        if sig.is_empty() {
            bail!("pattern must match at least one byte");
        }

        Ok(Self {
            simple: PatternSimple { sig, mask },
            custom_offset: custom_offset.unwrap_or_default(),
        })
    }
    /// Create a pattern from a literal `Vec<u8>` with `mask` filled with 0xff and `custom_offset = 0`.
    pub fn from_bytes(sig: Vec<u8>) -> Result<Self> {
        if sig.is_empty() {
            bail!("pattern must match at least one byte");
        }
        Ok(Self {
            simple: PatternSimple {
                mask: vec![0xff; sig.len()],
                sig,
            },
            custom_offset: 0,
        })
    }
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.simple.len()
    }
    #[inline(always)]
    pub fn is_match(&self, data: &[u8], index: usize) -> bool {
        index + self.len() <= data.len() && self.simple.is_match(data, index)
    }
    /// Address the caller is interested in for a match starting at `match_address`.
    pub fn hook_address(&self, match_address: usize) -> usize {
        match_address + self.custom_offset
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (sig, mask)) in self.simple.iter().enumerate() {
            if i != 0 {
                write!(f, " ")?;
            }
            if i == self.custom_offset && i != 0 {
                write!(f, "| ")?;
            }
            write_token(f, *sig, *mask)?;
        }
        Ok(())
    }
}
impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pattern(\"{self}\")")
    }
}

/// Find the first occurrence of `pattern` in `data` and return its address assuming `data`
/// starts at `base_address`.
///
/// Short circuits on the first match. When the first byte of the pattern is exact, memchr is
/// used to skip to candidate offsets, otherwise every offset is tried.
pub fn scan_first(pattern: &Pattern, base_address: usize, data: &[u8]) -> Option<usize> {
    let len = pattern.len();
    if len == 0 || data.len() < len {
        return None;
    }
    // every candidate start in `0..=last` has room for the whole pattern
    let last = data.len() - len;

    let simple = &pattern.simple;
    if simple.mask[0] == 0xff {
        memchr::memchr_iter(simple.sig[0], &data[..=last])
            .find(|&i| simple.is_match(data, i))
            .map(|i| base_address + i)
    } else {
        (0..=last)
            .find(|&i| simple.is_match(data, i))
            .map(|i| base_address + i)
    }
}

/// Scan for every occurrence of every pattern. Returns one bin of match addresses per
/// pattern, in the order the patterns were given. Addresses within a bin are sorted.
pub fn scan_pattern(patterns: &[&Pattern], base_address: usize, data: &[u8]) -> Vec<Vec<usize>> {
    use rayon::prelude::*;

    let mut bins = patterns.iter().map(|_| vec![]).collect::<Vec<_>>();

    if patterns.is_empty() || data.is_empty() {
        return bins;
    }

    let chunk_size = (data.len()
        / std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get))
    .max(1);

    // chunks only decide where a match may *start*; the comparison itself reads past the
    // chunk end into the full data slice
    let matches: Vec<(usize, usize)> = data
        .par_chunks(chunk_size)
        .enumerate()
        .flat_map_iter(|(index, chunk)| {
            let offset = index * chunk_size;
            let mut matches = vec![];
            for (pi, p) in patterns.iter().enumerate() {
                let simple = &p.simple;
                if simple.mask[0] == 0xff {
                    for i in memchr::memchr_iter(simple.sig[0], chunk) {
                        if p.is_match(data, offset + i) {
                            matches.push((pi, base_address + offset + i));
                        }
                    }
                } else {
                    for i in 0..chunk.len() {
                        if p.is_match(data, offset + i) {
                            matches.push((pi, base_address + offset + i));
                        }
                    }
                }
            }
            matches
        })
        .collect();

    for (pi, addr) in matches {
        bins[pi].push(addr);
    }
    for bin in &mut bins {
        bin.sort_unstable();
    }

    bins
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_bits() {
        assert_eq!(None, Pattern::parse_binary_patern("0000000"));
        assert_eq!(None, Pattern::parse_binary_patern("000000000"));
        assert_eq!(Some((0, 0xff)), Pattern::parse_binary_patern("00000000"));
        assert_eq!(
            Some((0b0000_0000, 0b0111_1111)),
            Pattern::parse_binary_patern("?0000000")
        );
        assert_eq!(
            Some((0b0100_0000, 0b0111_1111)),
            Pattern::parse_binary_patern("?1000000")
        );
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(Some((0xff, 0xff)), Pattern::parse_hex_pattern("ff"));
        assert_eq!(Some((0x00, 0xff)), Pattern::parse_hex_pattern("00"));
        assert_eq!(Some((0x0f, 0x0f)), Pattern::parse_hex_pattern("?f"));
        assert_eq!(Some((0x00, 0x0f)), Pattern::parse_hex_pattern("?0"));
        assert_eq!(Some((0x00, 0xf0)), Pattern::parse_hex_pattern("0?"));
        assert_eq!(None, Pattern::parse_hex_pattern("z0"));
        assert_eq!(None, Pattern::parse_hex_pattern("0"));
        assert_eq!(None, Pattern::parse_hex_pattern("000"));
    }

    #[test]
    fn test_build_pattern() {
        assert!(Pattern::new("?? ??").is_ok());
        assert!(Pattern::new("").is_err());
        assert!(Pattern::new("   ").is_err());
        assert!(Pattern::new("|").is_err());
        assert!(Pattern::new("00 | 01 | 02").is_err());
        assert!(Pattern::new("00 0x01").is_err());
        assert!(Pattern::from_bytes(vec![]).is_err());
        assert_eq!(
            Pattern {
                simple: PatternSimple {
                    sig: vec![0x10, 0],
                    mask: vec![0xff, 0],
                },
                custom_offset: 0,
            },
            Pattern::new("10 ??").unwrap()
        );
        assert_eq!(
            Pattern {
                simple: PatternSimple {
                    sig: vec![0x10, 0, 0b01010011],
                    mask: vec![0xff, 0, 0b11011011],
                },
                custom_offset: 0,
            },
            Pattern::new("10 ?? 01?10?11").unwrap()
        );
        assert_eq!(
            Pattern {
                simple: PatternSimple {
                    sig: vec![0x45, 0x0f, 0, 0, 0x8b],
                    mask: vec![0xff, 0xff, 0, 0, 0xff],
                },
                custom_offset: 4,
            },
            Pattern::new("45 0F ?? ?? | 8B").unwrap()
        );
    }

    #[test]
    fn test_display_pattern() {
        assert_eq!(
            Pattern::new("12 34 | 56").unwrap().to_string(),
            "12 34 | 56"
        );
        assert_eq!(Pattern::new("12 34 | 56").unwrap().simple.to_string(), "12 34 56");
        assert_eq!(Pattern::new("12 ?? 5? ?6").unwrap().to_string(), "12 ?? 5? ?6");
        assert_eq!(Pattern::new("01?10?11").unwrap().to_string(), "01?10?11");
    }

    #[test]
    fn test_hook_address() {
        let pattern = Pattern::new("C6 ?? ?? | 01 E8").unwrap();
        assert_eq!(0x1003, pattern.hook_address(0x1000));
        assert_eq!(0x1000, Pattern::new("C6 01").unwrap().hook_address(0x1000));
    }

    #[test]
    fn test_scan_first_returns_first_offset() {
        let data = [0x00, 0x11, 0x45, 0x0f, 0x99, 0x45, 0x0f, 0x98, 0x45, 0x0f, 0x97];
        let pattern = Pattern::new("45 0F ??").unwrap();
        assert_eq!(Some(100 + 2), scan_first(&pattern, 100, &data));

        let pattern = Pattern::new("45 0F 98").unwrap();
        assert_eq!(Some(5), scan_first(&pattern, 0, &data));

        // wildcard first token takes the non-memchr path
        let pattern = Pattern::new("?? 0F 97").unwrap();
        assert_eq!(Some(8), scan_first(&pattern, 0, &data));
    }

    #[test]
    fn test_scan_first_match_at_region_end() {
        let data = [0x90, 0x90, 0x90, 0xc3];
        assert_eq!(
            Some(2),
            scan_first(&Pattern::new("90 C3").unwrap(), 0, &data)
        );
        assert_eq!(
            Some(2),
            scan_first(&Pattern::new("?? C3").unwrap(), 0, &data)
        );
    }

    #[test]
    fn test_scan_first_not_found() {
        let data = [0x45, 0x0f, 0x99, 0x45];
        assert_eq!(None, scan_first(&Pattern::new("45 0F 98").unwrap(), 0, &data));
        // partial match running off the end of the region
        assert_eq!(None, scan_first(&Pattern::new("45 0F ??").unwrap(), 0, &data[1..]));
    }

    #[test]
    fn test_scan_first_pattern_longer_than_region() {
        let data = [0x45, 0x0f];
        assert_eq!(None, scan_first(&Pattern::new("45 0F ??").unwrap(), 0, &data));
        assert_eq!(None, scan_first(&Pattern::new("?? ?? ??").unwrap(), 0, &data));
    }

    #[test]
    fn test_scan_first_empty_region() {
        assert_eq!(None, scan_first(&Pattern::new("??").unwrap(), 0, &[]));
        assert_eq!(None, scan_first(&Pattern::new("45").unwrap(), 0, &[]));
    }

    #[test]
    fn test_scan_first_all_wildcards() {
        let pattern = Pattern::new("?? ?? ??").unwrap();
        for len in 3..16 {
            let data = vec![0xab; len];
            assert_eq!(Some(0x400000), scan_first(&pattern, 0x400000, &data));
        }
    }

    #[test]
    fn test_scan_first_full_length_sensitivity() {
        let data = [0x0f, 0x28, 0xc5, 0xf3, 0x44, 0x0f, 0x10, 0x45];
        let pattern = Pattern::new("0F 28 ?? F3 44 ?? 10 45").unwrap();
        assert_eq!(Some(0), scan_first(&pattern, 0, &data));

        // flipping any single non-wildcard byte must break the only possible match site
        for (i, mask) in pattern.simple.mask.iter().enumerate() {
            if *mask == 0 {
                continue;
            }
            let mut changed = data;
            changed[i] ^= 0x01;
            assert_eq!(None, scan_first(&pattern, 0, &changed), "byte {i}");
        }
    }

    type PatternScanFn =
        fn(patterns: &[&Pattern], base_address: usize, data: &[u8]) -> Vec<Vec<usize>>;

    #[test]
    fn test_scan_pattern() {
        test_scan_algo(scan_pattern);
    }

    fn test_scan_algo(scan: PatternScanFn) {
        let patterns = [&Pattern::new("01").unwrap()];

        let len = 64;
        let lanes = 32;
        let base = 123;

        let data = vec![1; len + lanes];
        let matches: Vec<_> = (base..len + base).collect();

        for i in 0..lanes {
            let slice = &data[i..i + len];
            assert_eq!(vec![matches.clone()], scan(&patterns, base, slice));
        }

        let patterns = [&Pattern::new("01 02").unwrap()];

        // obtuse generator to test every combination of chunk boundaries
        let data: Vec<_> = std::iter::repeat([1, 2, 3]).take(32).flatten().collect();
        let matches: Vec<_> = (0..3)
            .map(|offset| {
                (0..len / 3)
                    .map(|i| i * 3 + offset + base)
                    .collect::<Vec<_>>()
            })
            .collect();

        for i in 0..(len - lanes) {
            let slice = &data[i..i + len];
            let res = scan(&patterns, base, slice);
            assert_eq!(vec![matches[(3 - (i % 3)) % 3].clone()], res);
        }
    }

    #[test]
    fn test_scan_pattern_agrees_with_scan_first() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
        let patterns = [
            Pattern::new("1F ?? 5D").unwrap(),
            Pattern::new("?? 3E").unwrap(),
            Pattern::new("FF FF FF FF").unwrap(),
        ];
        let refs = patterns.iter().collect::<Vec<_>>();
        let bins = scan_pattern(&refs, 0x1000, &data);
        for (pattern, bin) in patterns.iter().zip(&bins) {
            assert_eq!(bin.first().copied(), scan_first(pattern, 0x1000, &data));
        }
    }
}
