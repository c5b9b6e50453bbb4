//! Fixed-width integer layouts written in struct-format notation (`I`, `2H`,
//! `<Q`, `IIII16B`). Only the integer and pad codes are understood; a leaf
//! whose format fails to parse here is rejected as an unknown tag.

use super::{LayoutError, MAX_FIELD_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Code {
    Pad,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
}

impl Code {
    fn from_char(c: char) -> Option<Self> {
        let code = match c {
            'x' => Code::Pad,
            '?' => Code::Bool,
            'b' => Code::I8,
            'B' => Code::U8,
            'h' => Code::I16,
            'H' => Code::U16,
            'i' | 'l' => Code::I32,
            'I' | 'L' => Code::U32,
            'q' => Code::I64,
            'Q' => Code::U64,
            _ => return None,
        };
        Some(code)
    }

    fn width(self) -> usize {
        match self {
            Code::Pad | Code::Bool | Code::I8 | Code::U8 => 1,
            Code::I16 | Code::U16 => 2,
            Code::I32 | Code::U32 => 4,
            Code::I64 | Code::U64 => 8,
        }
    }

    fn range(self) -> (i128, i128) {
        match self {
            Code::Pad | Code::Bool => (i128::MIN, i128::MAX),
            Code::I8 => (i8::MIN.into(), i8::MAX.into()),
            Code::U8 => (0, u8::MAX.into()),
            Code::I16 => (i16::MIN.into(), i16::MAX.into()),
            Code::U16 => (0, u16::MAX.into()),
            Code::I32 => (i32::MIN.into(), i32::MAX.into()),
            Code::U32 => (0, u32::MAX.into()),
            Code::I64 => (i64::MIN.into(), i64::MAX.into()),
            Code::U64 => (0, u64::MAX.into()),
        }
    }
}

/// A parsed struct-format string.
///
/// Without a byte-order prefix every item is aligned to its own width and
/// packed little-endian. `<`, `=` pack unaligned little-endian; `>`, `!` pack
/// unaligned big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackFormat {
    order: ByteOrder,
    aligned: bool,
    items: Vec<(Code, usize)>,
}

impl PackFormat {
    pub fn parse(format: &str) -> Result<Self, LayoutError> {
        let unknown = || LayoutError::UnknownTag(format.to_string());
        let mut chars = format.trim().chars().peekable();
        let (order, aligned) = match chars.peek() {
            Some('<') | Some('=') => (ByteOrder::Little, false),
            Some('>') | Some('!') => (ByteOrder::Big, false),
            _ => (ByteOrder::Little, true),
        };
        if !aligned {
            chars.next();
        }

        let mut items = Vec::new();
        let mut count: Option<usize> = None;
        for c in chars {
            if c.is_whitespace() {
                continue;
            }
            if let Some(digit) = c.to_digit(10) {
                let so_far = count.unwrap_or(0);
                count = Some(
                    so_far
                        .checked_mul(10)
                        .and_then(|n| n.checked_add(digit as usize))
                        .ok_or_else(unknown)?,
                );
                continue;
            }
            let code = Code::from_char(c).ok_or_else(unknown)?;
            items.push((code, count.take().unwrap_or(1)));
        }
        if items.is_empty() || count.is_some() {
            return Err(unknown());
        }
        let parsed = Self { order, aligned, items };
        parsed.size()?;
        Ok(parsed)
    }

    /// Packed size in bytes, alignment padding included. Zero-count items
    /// still align, so `B0I` is four bytes.
    pub fn size(&self) -> Result<usize, LayoutError> {
        let mut size = 0usize;
        for &(code, count) in &self.items {
            size = code
                .width()
                .checked_mul(count)
                .and_then(|bytes| {
                    size.checked_add(self.padding_before(code, size))?
                        .checked_add(bytes)
                })
                .filter(|total| *total <= MAX_FIELD_SIZE)
                .ok_or_else(|| LayoutError::FieldTooLarge(self.describe()))?;
        }
        Ok(size)
    }

    /// Number of literal values the format consumes. Pad bytes take none.
    pub fn value_count(&self) -> usize {
        self.items
            .iter()
            .filter(|(code, _)| *code != Code::Pad)
            .map(|(_, count)| count)
            .sum()
    }

    pub fn zeroed(&self) -> Result<Vec<u8>, LayoutError> {
        Ok(vec![0; self.size()?])
    }

    pub fn pack(&self, values: &[i128]) -> Result<Vec<u8>, LayoutError> {
        if values.len() != self.value_count() {
            return Err(LayoutError::LiteralMismatch {
                spec: self.describe(),
                expected: self.value_count(),
                found: values.len(),
            });
        }

        let mut out = Vec::with_capacity(self.size()?);
        let mut values = values.iter();
        for &(code, count) in &self.items {
            let pad = self.padding_before(code, out.len());
            out.resize(out.len() + pad, 0);
            if code == Code::Pad {
                out.resize(out.len() + count, 0);
                continue;
            }
            for &value in values.by_ref().take(count) {
                let (min, max) = code.range();
                if value < min || value > max {
                    return Err(LayoutError::ValueOutOfRange {
                        value,
                        width: code.width(),
                    });
                }
                let value = if code == Code::Bool { (value != 0) as i128 } else { value };
                let mut bytes = value.to_le_bytes()[..code.width()].to_vec();
                if self.order == ByteOrder::Big {
                    bytes.reverse();
                }
                out.extend_from_slice(&bytes);
            }
        }
        Ok(out)
    }

    fn padding_before(&self, code: Code, at: usize) -> usize {
        if !self.aligned {
            return 0;
        }
        let width = code.width();
        (width - at % width) % width
    }

    fn describe(&self) -> String {
        self.items
            .iter()
            .map(|(code, count)| format!("{count}{code:?}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Splits a literal into hex integer tokens. Braces are ignored and tokens
/// are separated by commas or whitespace; `0x` prefixes and signs are allowed.
pub fn parse_literal(literal: &str) -> Result<Vec<i128>, LayoutError> {
    literal
        .split(|c: char| c == ',' || c == '{' || c == '}' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(parse_hex_token)
        .collect()
}

fn parse_hex_token(token: &str) -> Result<i128, LayoutError> {
    let invalid = || LayoutError::InvalidLiteral(format!("`{token}` is not a hex integer"));
    let (negative, digits) = match token.as_bytes().first() {
        Some(b'-') => (true, &token[1..]),
        Some(b'+') => (false, &token[1..]),
        _ => (false, token),
    };
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits)
        .replace('_', "");
    if digits.is_empty() {
        return Err(invalid());
    }
    let magnitude = i128::from_str_radix(&digits, 16).map_err(|_| invalid())?;
    Ok(if negative { -magnitude } else { magnitude })
}

#[cfg(test)]
mod tests {
    use super::{parse_literal, PackFormat};
    use crate::layout::{LayoutError, MAX_FIELD_SIZE};

    #[test]
    fn sizes_follow_native_alignment() {
        assert_eq!(PackFormat::parse("I").unwrap().size().unwrap(), 4);
        assert_eq!(PackFormat::parse("IIII16B").unwrap().size().unwrap(), 32);
        assert_eq!(PackFormat::parse("BI").unwrap().size().unwrap(), 8);
        assert_eq!(PackFormat::parse("<BI").unwrap().size().unwrap(), 5);
        assert_eq!(PackFormat::parse("3x H").unwrap().size().unwrap(), 6);
    }

    #[test]
    fn zero_count_items_still_align() {
        let format = PackFormat::parse("B0I").unwrap();
        assert_eq!(format.size().unwrap(), 4);
        assert_eq!(format.value_count(), 1);
        assert_eq!(format.pack(&[0x7F]).unwrap(), vec![0x7F, 0, 0, 0]);
        assert_eq!(PackFormat::parse("<B0I").unwrap().size().unwrap(), 1);
    }

    #[test]
    fn oversized_repeat_counts_are_rejected() {
        assert!(matches!(
            PackFormat::parse("18446744073709551615Q"),
            Err(LayoutError::FieldTooLarge(_))
        ));
        assert!(matches!(
            PackFormat::parse("9223372036854775807H"),
            Err(LayoutError::FieldTooLarge(_))
        ));
        let limit = format!("{}B", MAX_FIELD_SIZE + 1);
        assert!(matches!(PackFormat::parse(&limit), Err(LayoutError::FieldTooLarge(_))));
        let at_limit = format!("{MAX_FIELD_SIZE}B");
        assert_eq!(PackFormat::parse(&at_limit).unwrap().size().unwrap(), MAX_FIELD_SIZE);
    }

    #[test]
    fn packs_little_endian_by_default() {
        let format = PackFormat::parse("HI").unwrap();
        let values = parse_literal("0x1234, 0xAABBCCDD").unwrap();
        assert_eq!(
            format.pack(&values).unwrap(),
            vec![0x34, 0x12, 0, 0, 0xDD, 0xCC, 0xBB, 0xAA]
        );
    }

    #[test]
    fn packs_big_endian_with_prefix() {
        let format = PackFormat::parse(">H").unwrap();
        assert_eq!(format.pack(&[0x0102]).unwrap(), vec![0x01, 0x02]);
    }

    #[test]
    fn packs_signed_values_twos_complement() {
        let format = PackFormat::parse("<b h").unwrap();
        let values = parse_literal("-1 -2").unwrap();
        assert_eq!(format.pack(&values).unwrap(), vec![0xFF, 0xFE, 0xFF]);
    }

    #[test]
    fn literal_accepts_braces_and_mixed_separators() {
        let values = parse_literal("{0x01, 02}\n\t0X3").unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn rejects_wrong_value_count() {
        let format = PackFormat::parse("4B").unwrap();
        let err = format.pack(&[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            LayoutError::LiteralMismatch { expected: 4, found: 3, .. }
        ));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let format = PackFormat::parse("B").unwrap();
        assert!(matches!(
            format.pack(&[0x100]),
            Err(LayoutError::ValueOutOfRange { width: 1, .. })
        ));
    }

    #[test]
    fn rejects_unknown_codes() {
        assert!(matches!(PackFormat::parse("Z"), Err(LayoutError::UnknownTag(_))));
        assert!(matches!(PackFormat::parse("4"), Err(LayoutError::UnknownTag(_))));
        assert!(matches!(PackFormat::parse(""), Err(LayoutError::UnknownTag(_))));
    }

    #[test]
    fn rejects_non_hex_tokens() {
        assert!(matches!(parse_literal("0xZZ"), Err(LayoutError::InvalidLiteral(_))));
    }
}
