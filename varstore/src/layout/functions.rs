//! Registered computed-field functions. A leaf spelled `@:name(args)` is bound
//! to an entry of this table when the descriptor is parsed, and re-evaluated
//! whenever a resize moves it.

use std::collections::HashMap;

use super::{alignment_padding, LayoutError};

/// Position information handed to a computed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalContext {
    /// Absolute byte offset of the field inside the image.
    pub offset: usize,
    pub filler: u8,
}

pub type ComputedFn = fn(&[u64], &EvalContext) -> Result<Vec<u8>, LayoutError>;

#[derive(Debug, Clone)]
pub struct FunctionTable {
    entries: HashMap<&'static str, ComputedFn>,
}

impl FunctionTable {
    /// An empty table. Descriptors using `@:` fields will fail to build.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The table every tree starts with: `_align_(n)` and its alias `align(n)`.
    pub fn with_builtins() -> Self {
        let mut table = Self::empty();
        table.register("_align_", align);
        table.register("align", align);
        table
    }

    pub fn register(&mut self, name: &'static str, func: ComputedFn) {
        self.entries.insert(name, func);
    }

    pub fn lookup(&self, name: &str) -> Option<ComputedFn> {
        self.entries.get(name).copied()
    }
}

impl Default for FunctionTable {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn align(args: &[u64], ctx: &EvalContext) -> Result<Vec<u8>, LayoutError> {
    match args {
        [alignment] => alignment_padding(*alignment, ctx.offset, ctx.filler),
        _ => Err(LayoutError::InvalidArgument(format!(
            "align takes one argument, got {}",
            args.len()
        ))),
    }
}

/// Parses an integer argument the way descriptor authors write them:
/// decimal, or `0x`/`0o`/`0b` prefixed.
pub fn parse_argument(token: &str) -> Result<u64, LayoutError> {
    let token = token.trim();
    let lower = token.to_ascii_lowercase();
    let parsed = if let Some(hex) = lower.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else if let Some(oct) = lower.strip_prefix("0o") {
        u64::from_str_radix(oct, 8)
    } else if let Some(bin) = lower.strip_prefix("0b") {
        u64::from_str_radix(bin, 2)
    } else {
        lower.parse::<u64>()
    };
    parsed.map_err(|_| LayoutError::InvalidArgument(format!("`{token}` is not an integer")))
}

#[cfg(test)]
mod tests {
    use super::{parse_argument, EvalContext, FunctionTable};
    use crate::layout::LayoutError;

    #[test]
    fn align_pads_to_boundary() {
        let table = FunctionTable::with_builtins();
        let align = table.lookup("_align_").expect("builtin");
        let ctx = EvalContext {
            offset: 0x4D,
            filler: 0xFF,
        };
        assert_eq!(align(&[4], &ctx).unwrap(), vec![0xFF; 3]);
        assert_eq!(align(&[1], &ctx).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn align_checks_arguments() {
        let table = FunctionTable::default();
        let align = table.lookup("align").expect("alias");
        let ctx = EvalContext { offset: 3, filler: 0 };
        assert!(matches!(align(&[], &ctx), Err(LayoutError::InvalidArgument(_))));
        assert!(matches!(align(&[3], &ctx), Err(LayoutError::InvalidArgument(_))));
    }

    #[test]
    fn empty_table_has_no_builtins() {
        assert!(FunctionTable::empty().lookup("_align_").is_none());
    }

    #[test]
    fn parses_prefixed_arguments() {
        assert_eq!(parse_argument("8").unwrap(), 8);
        assert_eq!(parse_argument(" 0x10 ").unwrap(), 16);
        assert_eq!(parse_argument("0b100").unwrap(), 4);
        assert!(parse_argument("eight").is_err());
    }
}
