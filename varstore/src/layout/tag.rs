//! Leaf specs: `FORMAT[:LITERAL]`.
//!
//! The format part picks one tag out of a closed set; each tag knows how to
//! encode its literal into bytes and how to render bytes back for humans.
//! Whether a leaf may change size is decided by its tag alone.

use uuid::Uuid;

use super::format::{parse_literal, PackFormat};
use super::functions::{parse_argument, ComputedFn, EvalContext, FunctionTable};
use super::LayoutError;

const GUID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sizing {
    /// Writes are truncated or padded to the declared size.
    Fixed,
    /// Writes replace the buffer and shift everything after it.
    Free,
    /// Value is derived from position; external writes are rejected.
    Computed,
}

/// A bound `@:name(args)` call.
#[derive(Debug, Clone)]
pub struct Call {
    name: String,
    args: Vec<u64>,
    func: ComputedFn,
}

impl Call {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn eval(&self, ctx: &EvalContext) -> Result<Vec<u8>, LayoutError> {
        (self.func)(&self.args, ctx)
    }
}

#[derive(Debug, Clone)]
pub enum LeafTag {
    Packed(PackFormat),
    Guid,
    Utf16,
    Ascii,
    Computed(Call),
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Packed,
    Guid,
    Utf16,
    Ascii,
    Computed,
    Raw,
}

/// Formats with a reserved meaning. Anything else is a struct format.
const RESERVED_FORMATS: &[(&str, TagKind)] = &[
    ("G", TagKind::Guid),
    ("U", TagKind::Utf16),
    ("S", TagKind::Ascii),
    ("@", TagKind::Computed),
    ("", TagKind::Raw),
];

impl TagKind {
    fn classify(format: &str) -> Self {
        RESERVED_FORMATS
            .iter()
            .find(|(name, _)| *name == format)
            .map(|(_, kind)| *kind)
            .unwrap_or(TagKind::Packed)
    }
}

impl LeafTag {
    pub fn sizing(&self) -> Sizing {
        match self {
            LeafTag::Packed(_) | LeafTag::Guid => Sizing::Fixed,
            LeafTag::Utf16 | LeafTag::Ascii | LeafTag::Raw => Sizing::Free,
            LeafTag::Computed(_) => Sizing::Computed,
        }
    }

    /// Renders a buffer of this tag for diagnostics.
    pub fn render(&self, buf: &[u8]) -> String {
        match self {
            LeafTag::Guid => match <[u8; GUID_LEN]>::try_from(buf) {
                Ok(bytes) => Uuid::from_bytes_le(bytes).hyphenated().to_string(),
                Err(_) => hex::encode(buf),
            },
            LeafTag::Utf16 => {
                let units: Vec<u16> = buf
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .take_while(|unit| *unit != 0)
                    .collect();
                String::from_utf16_lossy(&units)
            }
            LeafTag::Ascii => {
                let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
                String::from_utf8_lossy(&buf[..end]).into_owned()
            }
            LeafTag::Packed(_) | LeafTag::Computed(_) | LeafTag::Raw => hex::encode(buf),
        }
    }
}

/// Resolves a leaf spec into its tag and initial bytes.
pub fn resolve(
    spec: &str,
    ctx: &EvalContext,
    functions: &FunctionTable,
) -> Result<(LeafTag, Vec<u8>), LayoutError> {
    let (format, literal) = match spec.split_once(':') {
        Some((format, literal)) => (format.trim(), literal.trim()),
        None => (spec.trim(), ""),
    };

    match TagKind::classify(format) {
        TagKind::Guid => Ok((LeafTag::Guid, encode_guid(literal, ctx.filler)?)),
        TagKind::Utf16 => {
            let mut buf: Vec<u8> = literal.encode_utf16().flat_map(u16::to_le_bytes).collect();
            buf.extend_from_slice(&[0, 0]);
            Ok((LeafTag::Utf16, buf))
        }
        TagKind::Ascii => {
            if !literal.is_ascii() {
                return Err(LayoutError::InvalidLiteral(format!(
                    "`{literal}` is not single-byte text"
                )));
            }
            let mut buf = literal.as_bytes().to_vec();
            buf.push(0);
            Ok((LeafTag::Ascii, buf))
        }
        TagKind::Computed => {
            let call = bind_call(literal, functions)?;
            let buf = call.eval(ctx)?;
            Ok((LeafTag::Computed(call), buf))
        }
        TagKind::Raw => Ok((LeafTag::Raw, decode_raw(literal)?)),
        TagKind::Packed => {
            let packed = PackFormat::parse(format)?;
            let buf = if literal.is_empty() {
                packed.zeroed()?
            } else {
                let values = parse_literal(literal)?;
                if values.len() != packed.value_count() {
                    return Err(LayoutError::LiteralMismatch {
                        spec: spec.to_string(),
                        expected: packed.value_count(),
                        found: values.len(),
                    });
                }
                packed.pack(&values)?
            };
            Ok((LeafTag::Packed(packed), buf))
        }
    }
}

fn encode_guid(literal: &str, filler: u8) -> Result<Vec<u8>, LayoutError> {
    if literal.is_empty() {
        return Ok(vec![filler; GUID_LEN]);
    }
    let guid = Uuid::parse_str(literal)
        .map_err(|e| LayoutError::InvalidLiteral(format!("guid `{literal}`: {e}")))?;
    Ok(guid.to_bytes_le().to_vec())
}

fn decode_raw(literal: &str) -> Result<Vec<u8>, LayoutError> {
    let digits: String = literal
        .replace("0x", "")
        .replace("0X", "")
        .chars()
        .filter(|c| !matches!(c, ',' | '{' | '}' | '/' | '\\') && !c.is_whitespace())
        .collect();
    hex::decode(&digits).map_err(|e| LayoutError::InvalidLiteral(format!("bytes `{literal}`: {e}")))
}

fn bind_call(literal: &str, functions: &FunctionTable) -> Result<Call, LayoutError> {
    let (name, rest) = literal.split_once('(').ok_or_else(|| {
        LayoutError::InvalidArgument(format!("`{literal}` is not a function call"))
    })?;
    let name = name.trim();
    let inner = rest.split(')').next().unwrap_or_default();
    let args = inner
        .split(',')
        .map(str::trim)
        .filter(|arg| !arg.is_empty())
        .map(parse_argument)
        .collect::<Result<Vec<_>, _>>()?;
    let func = functions
        .lookup(name)
        .ok_or_else(|| LayoutError::UnknownFunction(name.to_string()))?;
    Ok(Call {
        name: name.to_string(),
        args,
        func,
    })
}

#[cfg(test)]
mod tests {
    use super::{resolve, LeafTag, Sizing};
    use crate::layout::functions::{EvalContext, FunctionTable};
    use crate::layout::LayoutError;

    fn at(offset: usize) -> EvalContext {
        EvalContext {
            offset,
            filler: 0xFF,
        }
    }

    fn resolve_at(spec: &str, offset: usize) -> Result<(LeafTag, Vec<u8>), LayoutError> {
        resolve(spec, &at(offset), &FunctionTable::with_builtins())
    }

    #[test]
    fn packed_literal_and_zero_fill() {
        let (tag, buf) = resolve_at("I:0x12345678", 0).unwrap();
        assert_eq!(tag.sizing(), Sizing::Fixed);
        assert_eq!(buf, vec![0x78, 0x56, 0x34, 0x12]);

        let (_, buf) = resolve_at("Q", 0).unwrap();
        assert_eq!(buf, vec![0; 8]);
    }

    #[test]
    fn packed_literal_count_must_match() {
        let err = resolve_at("2H: 0x1", 0).unwrap_err();
        assert!(matches!(err, LayoutError::LiteralMismatch { expected: 2, found: 1, .. }));
    }

    #[test]
    fn guid_is_mixed_endian() {
        let (tag, buf) = resolve_at("G: 8BE4DF61-93CA-11D2-AA0D-00E098032B8C", 0).unwrap();
        assert_eq!(
            buf,
            vec![
                0x61, 0xDF, 0xE4, 0x8B, 0xCA, 0x93, 0xD2, 0x11, 0xAA, 0x0D, 0x00, 0xE0, 0x98,
                0x03, 0x2B, 0x8C
            ]
        );
        assert_eq!(tag.render(&buf), "8be4df61-93ca-11d2-aa0d-00e098032b8c");
    }

    #[test]
    fn empty_guid_uses_filler() {
        let (_, buf) = resolve_at("G", 0).unwrap();
        assert_eq!(buf, vec![0xFF; 16]);
    }

    #[test]
    fn text_tags_are_terminated_and_free() {
        let (tag, buf) = resolve_at("U:Ab", 0).unwrap();
        assert_eq!(tag.sizing(), Sizing::Free);
        assert_eq!(buf, vec![b'A', 0, b'b', 0, 0, 0]);
        assert_eq!(tag.render(&buf), "Ab");

        let (tag, buf) = resolve_at("S:Ab", 0).unwrap();
        assert_eq!(buf, vec![b'A', b'b', 0]);
        assert_eq!(tag.render(&buf), "Ab");
    }

    #[test]
    fn raw_bytes_strip_separators() {
        let (tag, buf) = resolve_at(": {0x01, 0x02}, 0A\\ 0b", 0).unwrap();
        assert_eq!(tag.sizing(), Sizing::Free);
        assert_eq!(buf, vec![0x01, 0x02, 0x0A, 0x0B]);
    }

    #[test]
    fn computed_field_uses_offset() {
        let (tag, buf) = resolve_at("@:_align_(8)", 13).unwrap();
        assert_eq!(tag.sizing(), Sizing::Computed);
        assert_eq!(buf, vec![0xFF; 3]);
        match tag {
            LeafTag::Computed(call) => assert_eq!(call.name(), "_align_"),
            other => panic!("unexpected tag {other:?}"),
        }
    }

    #[test]
    fn unknown_function_and_tag_fail() {
        assert!(matches!(
            resolve_at("@:nope(1)", 0),
            Err(LayoutError::UnknownFunction(name)) if name == "nope"
        ));
        assert!(matches!(resolve_at("Z:00", 0), Err(LayoutError::UnknownTag(_))));
    }
}
