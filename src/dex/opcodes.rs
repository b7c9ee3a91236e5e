use bitflags::bitflags;
use once_cell::sync::Lazy;

use crate::dex::error::DexError;
use crate::dex::formats::Format;
use crate::dex::scanner::DexScanner;

bitflags! {
    /// Control-flow attributes of an opcode; everything the CFG builder
    /// needs to classify an instruction.
    pub struct OpcodeFlags: u32 {
        /// Execution may continue into the following instruction.
        const CAN_CONTINUE = 0x01;
        /// Leaves the method: return-void / return / return-wide / return-object.
        const RETURN       = 0x02;
        /// Raises: throw.
        const THROW        = 0x04;
        /// Two-register conditional branch (if-eq .. if-le).
        const IF_TEST      = 0x08;
        /// One-register conditional branch (if-eqz .. if-lez).
        const IF_TEST_Z    = 0x10;
        /// Unconditional jump (goto / goto/16 / goto/32).
        const GOTO         = 0x20;
    }
}

/// One row of the instruction table.
pub struct Opcode {
    pub name: &'static str,
    pub format: Format,
    pub flags: OpcodeFlags,
}

impl Opcode
{
    pub fn is_return(&self) -> bool { self.flags.contains(OpcodeFlags::RETURN) }
    pub fn is_throw(&self) -> bool { self.flags.contains(OpcodeFlags::THROW) }
    pub fn is_goto(&self) -> bool { self.flags.contains(OpcodeFlags::GOTO) }

    /// Conditional branch of either arity.
    pub fn is_branch(&self) -> bool
    {
        self.flags.intersects(OpcodeFlags::IF_TEST | OpcodeFlags::IF_TEST_Z)
    }

    /// Instruction size in code units at `offs`.
    pub fn size(&self, dex: &DexScanner, offs: usize) -> Result<u32, DexError>
    {
        self.format.size(dex, offs)
    }

    /// Disassembly line for the raw listing.
    pub fn dasm(&self, dex: &DexScanner, offs: usize) -> Result<String, DexError>
    {
        let operands = self.format.dasm(dex, offs)?;
        if operands.is_empty() {
            Ok(self.name.to_string())
        } else {
            Ok(format!("{} {}", self.name, operands))
        }
    }
}

/// Looks up the table row for an opcode byte.
pub fn opcode(op: u8) -> &'static Opcode
{
    &OPCODES[op as usize]
}

/// The 256-entry instruction table. Gaps in the opcode space keep the
/// `<unimpl>` placeholder: size 1, plain fall-through.
pub static OPCODES: Lazy<Vec<Opcode>> = Lazy::new(|| {
    let mut table: Vec<Opcode> = (0..256)
        .map(|_| Opcode {
            name: "<unimpl>",
            format: Format::Format10x,
            flags: OpcodeFlags::CAN_CONTINUE,
        })
        .collect();

    let cont = OpcodeFlags::CAN_CONTINUE;
    let defs: Vec<(u8, &'static str, Format, OpcodeFlags)> = vec![
        // nop also hosts the switch/array payload pseudo-ops
        (0x00, "nop", Format::Payload, cont),
        (0x01, "move", Format::Format12x, cont),
        (0x02, "move/from16", Format::Format22x, cont),
        (0x03, "move/16", Format::Format32x, cont),
        (0x04, "move-wide", Format::Format12x, cont),
        (0x05, "move-wide/from16", Format::Format22x, cont),
        (0x06, "move-wide/16", Format::Format32x, cont),
        (0x07, "move-object", Format::Format12x, cont),
        (0x08, "move-object/from16", Format::Format22x, cont),
        (0x09, "move-object/16", Format::Format32x, cont),
        (0x0a, "move-result", Format::Format11x, cont),
        (0x0b, "move-result-wide", Format::Format11x, cont),
        (0x0c, "move-result-object", Format::Format11x, cont),
        (0x0d, "move-exception", Format::Format11x, cont),
        (0x0e, "return-void", Format::Format10x, OpcodeFlags::RETURN),
        (0x0f, "return", Format::Format11x, OpcodeFlags::RETURN),
        (0x10, "return-wide", Format::Format11x, OpcodeFlags::RETURN),
        (0x11, "return-object", Format::Format11x, OpcodeFlags::RETURN),
        (0x12, "const/4", Format::Format11n, cont),
        (0x13, "const/16", Format::Format21s, cont),
        (0x14, "const", Format::Format31i, cont),
        (0x15, "const/high16", Format::Format21h, cont),
        (0x16, "const-wide/16", Format::Format21s, cont),
        (0x17, "const-wide/32", Format::Format31i, cont),
        (0x18, "const-wide", Format::Format51l, cont),
        (0x19, "const-wide/high16", Format::Format21h, cont),
        (0x1a, "const-string", Format::Format21c, cont),
        (0x1b, "const-string/jumbo", Format::Format31c, cont),
        (0x1c, "const-class", Format::Format21c, cont),
        (0x1d, "monitor-enter", Format::Format11x, cont),
        (0x1e, "monitor-exit", Format::Format11x, cont),
        (0x1f, "check-cast", Format::Format21c, cont),
        (0x20, "instance-of", Format::Format22c, cont),
        (0x21, "array-length", Format::Format12x, cont),
        (0x22, "new-instance", Format::Format21c, cont),
        (0x23, "new-array", Format::Format22c, cont),
        (0x24, "filled-new-array", Format::Format35c, cont),
        (0x25, "filled-new-array/range", Format::Format3rc, cont),
        (0x26, "fill-array-data", Format::Format31t, cont),
        (0x27, "throw", Format::Format11x, OpcodeFlags::THROW),
        (0x28, "goto", Format::Format10t, OpcodeFlags::GOTO),
        (0x29, "goto/16", Format::Format20t, OpcodeFlags::GOTO),
        (0x2a, "goto/32", Format::Format30t, OpcodeFlags::GOTO),
        (0x2b, "packed-switch", Format::Format31t, cont),
        (0x2c, "sparse-switch", Format::Format31t, cont),
        (0x2d, "cmpl-float", Format::Format23x, cont),
        (0x2e, "cmpg-float", Format::Format23x, cont),
        (0x2f, "cmpl-double", Format::Format23x, cont),
        (0x30, "cmpg-double", Format::Format23x, cont),
        (0x31, "cmp-long", Format::Format23x, cont),
        (0x32, "if-eq", Format::Format22t, cont | OpcodeFlags::IF_TEST),
        (0x33, "if-ne", Format::Format22t, cont | OpcodeFlags::IF_TEST),
        (0x34, "if-lt", Format::Format22t, cont | OpcodeFlags::IF_TEST),
        (0x35, "if-ge", Format::Format22t, cont | OpcodeFlags::IF_TEST),
        (0x36, "if-gt", Format::Format22t, cont | OpcodeFlags::IF_TEST),
        (0x37, "if-le", Format::Format22t, cont | OpcodeFlags::IF_TEST),
        (0x38, "if-eqz", Format::Format21t, cont | OpcodeFlags::IF_TEST_Z),
        (0x39, "if-nez", Format::Format21t, cont | OpcodeFlags::IF_TEST_Z),
        (0x3a, "if-ltz", Format::Format21t, cont | OpcodeFlags::IF_TEST_Z),
        (0x3b, "if-gez", Format::Format21t, cont | OpcodeFlags::IF_TEST_Z),
        (0x3c, "if-gtz", Format::Format21t, cont | OpcodeFlags::IF_TEST_Z),
        (0x3d, "if-lez", Format::Format21t, cont | OpcodeFlags::IF_TEST_Z),
        (0x44, "aget", Format::Format23x, cont),
        (0x45, "aget-wide", Format::Format23x, cont),
        (0x46, "aget-object", Format::Format23x, cont),
        (0x47, "aget-boolean", Format::Format23x, cont),
        (0x48, "aget-byte", Format::Format23x, cont),
        (0x49, "aget-char", Format::Format23x, cont),
        (0x4a, "aget-short", Format::Format23x, cont),
        (0x4b, "aput", Format::Format23x, cont),
        (0x4c, "aput-wide", Format::Format23x, cont),
        (0x4d, "aput-object", Format::Format23x, cont),
        (0x4e, "aput-boolean", Format::Format23x, cont),
        (0x4f, "aput-byte", Format::Format23x, cont),
        (0x50, "aput-char", Format::Format23x, cont),
        (0x51, "aput-short", Format::Format23x, cont),
        (0x52, "iget", Format::Format22c, cont),
        (0x53, "iget-wide", Format::Format22c, cont),
        (0x54, "iget-object", Format::Format22c, cont),
        (0x55, "iget-boolean", Format::Format22c, cont),
        (0x56, "iget-byte", Format::Format22c, cont),
        (0x57, "iget-char", Format::Format22c, cont),
        (0x58, "iget-short", Format::Format22c, cont),
        (0x59, "iput", Format::Format22c, cont),
        (0x5a, "iput-wide", Format::Format22c, cont),
        (0x5b, "iput-object", Format::Format22c, cont),
        (0x5c, "iput-boolean", Format::Format22c, cont),
        (0x5d, "iput-byte", Format::Format22c, cont),
        (0x5e, "iput-char", Format::Format22c, cont),
        (0x5f, "iput-short", Format::Format22c, cont),
        (0x60, "sget", Format::Format21c, cont),
        (0x61, "sget-wide", Format::Format21c, cont),
        (0x62, "sget-object", Format::Format21c, cont),
        (0x63, "sget-boolean", Format::Format21c, cont),
        (0x64, "sget-byte", Format::Format21c, cont),
        (0x65, "sget-char", Format::Format21c, cont),
        (0x66, "sget-short", Format::Format21c, cont),
        (0x67, "sput", Format::Format21c, cont),
        (0x68, "sput-wide", Format::Format21c, cont),
        (0x69, "sput-object", Format::Format21c, cont),
        (0x6a, "sput-boolean", Format::Format21c, cont),
        (0x6b, "sput-byte", Format::Format21c, cont),
        (0x6c, "sput-char", Format::Format21c, cont),
        (0x6d, "sput-short", Format::Format21c, cont),
        (0x6e, "invoke-virtual", Format::Format35c, cont),
        (0x6f, "invoke-super", Format::Format35c, cont),
        (0x70, "invoke-direct", Format::Format35c, cont),
        (0x71, "invoke-static", Format::Format35c, cont),
        (0x72, "invoke-interface", Format::Format35c, cont),
        (0x74, "invoke-virtual/range", Format::Format3rc, cont),
        (0x75, "invoke-super/range", Format::Format3rc, cont),
        (0x76, "invoke-direct/range", Format::Format3rc, cont),
        (0x77, "invoke-static/range", Format::Format3rc, cont),
        (0x78, "invoke-interface/range", Format::Format3rc, cont),
        (0x7b, "neg-int", Format::Format12x, cont),
        (0x7c, "not-int", Format::Format12x, cont),
        (0x7d, "neg-long", Format::Format12x, cont),
        (0x7e, "not-long", Format::Format12x, cont),
        (0x7f, "neg-float", Format::Format12x, cont),
        (0x80, "neg-double", Format::Format12x, cont),
        (0x81, "int-to-long", Format::Format12x, cont),
        (0x82, "int-to-float", Format::Format12x, cont),
        (0x83, "int-to-double", Format::Format12x, cont),
        (0x84, "long-to-int", Format::Format12x, cont),
        (0x85, "long-to-float", Format::Format12x, cont),
        (0x86, "long-to-double", Format::Format12x, cont),
        (0x87, "float-to-int", Format::Format12x, cont),
        (0x88, "float-to-long", Format::Format12x, cont),
        (0x89, "float-to-double", Format::Format12x, cont),
        (0x8a, "double-to-int", Format::Format12x, cont),
        (0x8b, "double-to-long", Format::Format12x, cont),
        (0x8c, "double-to-float", Format::Format12x, cont),
        (0x8d, "int-to-byte", Format::Format12x, cont),
        (0x8e, "int-to-char", Format::Format12x, cont),
        (0x8f, "int-to-short", Format::Format12x, cont),
        (0x90, "add-int", Format::Format23x, cont),
        (0x91, "sub-int", Format::Format23x, cont),
        (0x92, "mul-int", Format::Format23x, cont),
        (0x93, "div-int", Format::Format23x, cont),
        (0x94, "rem-int", Format::Format23x, cont),
        (0x95, "and-int", Format::Format23x, cont),
        (0x96, "or-int", Format::Format23x, cont),
        (0x97, "xor-int", Format::Format23x, cont),
        (0x98, "shl-int", Format::Format23x, cont),
        (0x99, "shr-int", Format::Format23x, cont),
        (0x9a, "ushr-int", Format::Format23x, cont),
        (0x9b, "add-long", Format::Format23x, cont),
        (0x9c, "sub-long", Format::Format23x, cont),
        (0x9d, "mul-long", Format::Format23x, cont),
        (0x9e, "div-long", Format::Format23x, cont),
        (0x9f, "rem-long", Format::Format23x, cont),
        (0xa0, "and-long", Format::Format23x, cont),
        (0xa1, "or-long", Format::Format23x, cont),
        (0xa2, "xor-long", Format::Format23x, cont),
        (0xa3, "shl-long", Format::Format23x, cont),
        (0xa4, "shr-long", Format::Format23x, cont),
        (0xa5, "ushr-long", Format::Format23x, cont),
        (0xa6, "add-float", Format::Format23x, cont),
        (0xa7, "sub-float", Format::Format23x, cont),
        (0xa8, "mul-float", Format::Format23x, cont),
        (0xa9, "div-float", Format::Format23x, cont),
        (0xaa, "rem-float", Format::Format23x, cont),
        (0xab, "add-double", Format::Format23x, cont),
        (0xac, "sub-double", Format::Format23x, cont),
        (0xad, "mul-double", Format::Format23x, cont),
        (0xae, "div-double", Format::Format23x, cont),
        (0xaf, "rem-double", Format::Format23x, cont),
        (0xb0, "add-int/2addr", Format::Format12x, cont),
        (0xb1, "sub-int/2addr", Format::Format12x, cont),
        (0xb2, "mul-int/2addr", Format::Format12x, cont),
        (0xb3, "div-int/2addr", Format::Format12x, cont),
        (0xb4, "rem-int/2addr", Format::Format12x, cont),
        (0xb5, "and-int/2addr", Format::Format12x, cont),
        (0xb6, "or-int/2addr", Format::Format12x, cont),
        (0xb7, "xor-int/2addr", Format::Format12x, cont),
        (0xb8, "shl-int/2addr", Format::Format12x, cont),
        (0xb9, "shr-int/2addr", Format::Format12x, cont),
        (0xba, "ushr-int/2addr", Format::Format12x, cont),
        (0xbb, "add-long/2addr", Format::Format12x, cont),
        (0xbc, "sub-long/2addr", Format::Format12x, cont),
        (0xbd, "mul-long/2addr", Format::Format12x, cont),
        (0xbe, "div-long/2addr", Format::Format12x, cont),
        (0xbf, "rem-long/2addr", Format::Format12x, cont),
        (0xc0, "and-long/2addr", Format::Format12x, cont),
        (0xc1, "or-long/2addr", Format::Format12x, cont),
        (0xc2, "xor-long/2addr", Format::Format12x, cont),
        (0xc3, "shl-long/2addr", Format::Format12x, cont),
        (0xc4, "shr-long/2addr", Format::Format12x, cont),
        (0xc5, "ushr-long/2addr", Format::Format12x, cont),
        (0xc6, "add-float/2addr", Format::Format12x, cont),
        (0xc7, "sub-float/2addr", Format::Format12x, cont),
        (0xc8, "mul-float/2addr", Format::Format12x, cont),
        (0xc9, "div-float/2addr", Format::Format12x, cont),
        (0xca, "rem-float/2addr", Format::Format12x, cont),
        (0xcb, "add-double/2addr", Format::Format12x, cont),
        (0xcc, "sub-double/2addr", Format::Format12x, cont),
        (0xcd, "mul-double/2addr", Format::Format12x, cont),
        (0xce, "div-double/2addr", Format::Format12x, cont),
        (0xcf, "rem-double/2addr", Format::Format12x, cont),
        (0xd0, "add-int/lit16", Format::Format22s, cont),
        (0xd1, "rsub-int", Format::Format22s, cont),
        (0xd2, "mul-int/lit16", Format::Format22s, cont),
        (0xd3, "div-int/lit16", Format::Format22s, cont),
        (0xd4, "rem-int/lit16", Format::Format22s, cont),
        (0xd5, "and-int/lit16", Format::Format22s, cont),
        (0xd6, "or-int/lit16", Format::Format22s, cont),
        (0xd7, "xor-int/lit16", Format::Format22s, cont),
        (0xd8, "add-int/lit8", Format::Format22b, cont),
        (0xd9, "rsub-int/lit8", Format::Format22b, cont),
        (0xda, "mul-int/lit8", Format::Format22b, cont),
        (0xdb, "div-int/lit8", Format::Format22b, cont),
        (0xdc, "rem-int/lit8", Format::Format22b, cont),
        (0xdd, "and-int/lit8", Format::Format22b, cont),
        (0xde, "or-int/lit8", Format::Format22b, cont),
        (0xdf, "xor-int/lit8", Format::Format22b, cont),
        (0xe0, "shl-int/lit8", Format::Format22b, cont),
        (0xe1, "shr-int/lit8", Format::Format22b, cont),
        (0xe2, "ushr-int/lit8", Format::Format22b, cont),
        (0xfa, "invoke-polymorphic", Format::Format45cc, cont),
        (0xfb, "invoke-polymorphic/range", Format::Format4rcc, cont),
        (0xfc, "invoke-custom", Format::Format35c, cont),
        (0xfd, "invoke-custom/range", Format::Format3rc, cont),
        (0xfe, "const-method-handle", Format::Format21c, cont),
        (0xff, "const-method-type", Format::Format21c, cont),
    ];

    for (value, name, format, flags) in defs {
        table[value as usize] = Opcode { name, format, flags };
    }
    table
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_classes_cover_expected_ranges() {
        for op in 0x0e..=0x11u8 {
            assert!(opcode(op).is_return(), "{:#x}", op);
        }
        assert!(opcode(0x27).is_throw());
        for op in 0x32..=0x37u8 {
            assert!(opcode(op).is_branch());
            assert!(opcode(op).flags.contains(OpcodeFlags::IF_TEST));
        }
        for op in 0x38..=0x3du8 {
            assert!(opcode(op).is_branch());
            assert!(opcode(op).flags.contains(OpcodeFlags::IF_TEST_Z));
        }
        for op in 0x28..=0x2au8 {
            assert!(opcode(op).is_goto());
        }
    }

    #[test]
    fn terminators_do_not_continue() {
        for op in 0..=255u8 {
            let o = opcode(op);
            let terminates = o.is_return() || o.is_throw() || o.is_goto();
            assert_eq!(
                !o.flags.contains(OpcodeFlags::CAN_CONTINUE),
                terminates,
                "{:#x} {}",
                op,
                o.name
            );
        }
    }

    #[test]
    fn gaps_are_unimpl_single_unit() {
        for op in [0x3eu8, 0x43, 0x73, 0x79, 0x7a, 0xe3, 0xf9] {
            let o = opcode(op);
            assert_eq!(o.name, "<unimpl>");
            assert_eq!(o.format, Format::Format10x);
        }
    }
}
