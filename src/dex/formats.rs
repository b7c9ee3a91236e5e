//! Dalvik instruction layouts.
//!
//! Every opcode packs its operands into 16-bit code units according to one
//! of a closed set of formats. The format decides the instruction size in
//! code units, how a branch displacement is extracted, and how the operand
//! fields print.

use crate::dex::error::DexError;
use crate::dex::scanner::DexScanner;

/// Operand layout tags, named after the Dalvik format identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Format {
    Format10x,
    Format12x,
    Format11n,
    Format11x,
    Format10t,
    Format20t,
    Format20bc,
    Format22x,
    Format21t,
    Format21s,
    Format21h,
    Format21c,
    Format23x,
    Format22b,
    Format22t,
    Format22s,
    Format22c,
    Format30t,
    Format32x,
    Format31i,
    Format31t,
    Format31c,
    Format35c,
    Format3rc,
    Format45cc,
    Format4rcc,
    Format51l,
    /// nop doubles as the container for switch/array payload pseudo-ops;
    /// the size is data-dependent on the payload ident in the high byte.
    Payload,
}

// Bit-field extraction over the 16-bit code units, offsets in bytes.
fn read_field(dex: &DexScanner, offs: usize, begin: u32, length: u32) -> Result<u16, DexError>
{
    let t = dex.read_u16(offs)?;
    Ok((t >> begin) & (((1u32 << length) - 1) as u16))
}

fn read_signed(dex: &DexScanner, offs: usize, begin: u32, length: u32) -> Result<i16, DexError>
{
    let t = dex.read_u16(offs)? as i16;
    Ok((t << (16 - begin - length)) >> (16 - length))
}

impl Format
{
    /// Instruction size in code units. Constant for every format except the
    /// payload pseudo-ops, whose size is read from the payload header.
    pub fn size(&self, dex: &DexScanner, offs: usize) -> Result<u32, DexError>
    {
        Ok(match self
        {
            Format::Format10x | Format::Format12x | Format::Format11n
            | Format::Format11x | Format::Format10t => 1,

            Format::Format20t | Format::Format20bc | Format::Format22x
            | Format::Format21t | Format::Format21s | Format::Format21h
            | Format::Format21c | Format::Format23x | Format::Format22b
            | Format::Format22t | Format::Format22s | Format::Format22c => 2,

            Format::Format30t | Format::Format32x | Format::Format31i
            | Format::Format31t | Format::Format31c | Format::Format35c
            | Format::Format3rc => 3,

            Format::Format45cc | Format::Format4rcc => 4,

            Format::Format51l => 5,

            Format::Payload => match read_field(dex, offs, 8, 8)?
            {
                // packed-switch-payload: ident, size, first_key, size*2 targets
                1 => dex.read_u16(offs + 2)? as u32 * 2 + 4,
                // sparse-switch-payload: ident, size, size*2 keys, size*2 targets
                2 => dex.read_u16(offs + 2)? as u32 * 4 + 2,
                // fill-array-data-payload: ident, element_width, size, data
                3 => (dex.read_u16(offs + 2)? as u32 * dex.read_u32(offs + 4)? + 1) / 2 + 4,
                _ => 1,
            },
        })
    }

    /// Signed branch displacement in code units, for the formats that
    /// carry one. `None` for everything else.
    pub fn branch_displacement(&self, dex: &DexScanner, offs: usize) -> Result<Option<i32>, DexError>
    {
        Ok(match self
        {
            Format::Format10t => Some(read_signed(dex, offs, 8, 8)? as i32),
            Format::Format20t | Format::Format21t | Format::Format22t =>
                Some(read_signed(dex, offs + 2, 0, 16)? as i32),
            Format::Format30t | Format::Format31t =>
                Some(dex.read_u16(offs + 2)? as i32
                    | ((read_signed(dex, offs + 4, 0, 16)? as i32) << 16)),
            _ => None,
        })
    }

    /// Operand text for the raw listing. Pool references print as bare
    /// `@index`; resolving them is the caller's business.
    pub fn dasm(&self, dex: &DexScanner, offs: usize) -> Result<String, DexError>
    {
        Ok(match self
        {
            Format::Format10x => String::new(),

            Format::Format12x => format!(
                "v{}, v{}",
                read_field(dex, offs, 8, 4)?,
                read_field(dex, offs, 12, 4)?
            ),
            Format::Format11n => format!(
                "v{}, #{}",
                read_field(dex, offs, 8, 4)?,
                read_signed(dex, offs, 12, 4)?
            ),
            Format::Format11x => format!("v{}", read_field(dex, offs, 8, 8)?),
            Format::Format10t => format!("{:+}", read_signed(dex, offs, 8, 8)?),

            Format::Format20t => format!("{:+}", read_signed(dex, offs + 2, 0, 16)?),
            Format::Format22x => format!(
                "v{}, v{}",
                read_field(dex, offs, 8, 8)?,
                dex.read_u16(offs + 2)?
            ),
            Format::Format21t => format!(
                "v{}, {:+}",
                read_field(dex, offs, 8, 8)?,
                read_signed(dex, offs + 2, 0, 16)?
            ),
            Format::Format21s => format!(
                "v{}, #{}",
                read_field(dex, offs, 8, 8)?,
                read_signed(dex, offs + 2, 0, 16)?
            ),
            Format::Format21h => format!(
                "v{}, #{}0000",
                read_field(dex, offs, 8, 8)?,
                read_signed(dex, offs + 2, 0, 16)?
            ),
            Format::Format21c => format!(
                "v{}, @{}",
                read_field(dex, offs, 8, 8)?,
                dex.read_u16(offs + 2)?
            ),
            Format::Format23x => format!(
                "v{}, v{}, v{}",
                read_field(dex, offs, 8, 8)?,
                read_field(dex, offs + 2, 0, 8)?,
                read_field(dex, offs + 2, 8, 8)?
            ),
            Format::Format22b => format!(
                "v{}, v{}, #{}",
                read_field(dex, offs, 8, 8)?,
                read_field(dex, offs + 2, 0, 8)?,
                read_signed(dex, offs + 2, 8, 8)?
            ),
            Format::Format22t => format!(
                "v{}, v{}, {:+}",
                read_field(dex, offs, 8, 4)?,
                read_field(dex, offs, 12, 4)?,
                read_signed(dex, offs + 2, 0, 16)?
            ),
            Format::Format22s => format!(
                "v{}, v{}, #{}",
                read_field(dex, offs, 8, 4)?,
                read_field(dex, offs, 12, 4)?,
                read_signed(dex, offs + 2, 0, 16)?
            ),
            Format::Format22c => format!(
                "v{}, v{}, @{}",
                read_field(dex, offs, 8, 4)?,
                read_field(dex, offs, 12, 4)?,
                dex.read_u16(offs + 2)?
            ),

            Format::Format30t => {
                let disp = dex.read_u16(offs + 2)? as i32
                    | ((read_signed(dex, offs + 4, 0, 16)? as i32) << 16);
                format!("{:+}", disp)
            }
            Format::Format32x => format!(
                "v{}, v{}",
                dex.read_u16(offs + 2)?,
                dex.read_u16(offs + 4)?
            ),
            Format::Format31i | Format::Format51l => format!(
                "v{}, #...",
                read_field(dex, offs, 8, 8)?
            ),
            Format::Format31t => {
                let disp = dex.read_u16(offs + 2)? as i32
                    | ((read_signed(dex, offs + 4, 0, 16)? as i32) << 16);
                format!("v{}, {:+}", read_field(dex, offs, 8, 8)?, disp)
            }
            Format::Format31c => format!(
                "v{}, @{}",
                read_field(dex, offs, 8, 8)?,
                dex.read_u32(offs + 2)?
            ),

            Format::Format35c | Format::Format45cc => format!(
                "{{{} args}}, @{}",
                read_field(dex, offs, 12, 4)?,
                dex.read_u16(offs + 2)?
            ),
            Format::Format3rc | Format::Format4rcc => format!(
                "{{v{} ..+{}}}, @{}",
                dex.read_u16(offs + 4)?,
                read_field(dex, offs, 8, 8)?,
                dex.read_u16(offs + 2)?
            ),

            Format::Format20bc => format!(
                "{}, @{}",
                read_field(dex, offs, 8, 8)?,
                dex.read_u16(offs + 2)?
            ),

            Format::Payload => match read_field(dex, offs, 8, 8)?
            {
                1 => "packed-switch-payload".to_string(),
                2 => "sparse-switch-payload".to_string(),
                3 => "fill-array-data-payload".to_string(),
                _ => String::new(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::scanner::DexScanner;

    fn dex_of(units: &[u16]) -> DexScanner {
        let mut bytes = vec![];
        for u in units {
            bytes.extend_from_slice(&u.to_le_bytes());
        }
        DexScanner::new(bytes)
    }

    #[test]
    fn fixed_sizes() {
        let d = dex_of(&[0, 0, 0, 0, 0]);
        assert_eq!(Format::Format10x.size(&d, 0).unwrap(), 1);
        assert_eq!(Format::Format22t.size(&d, 0).unwrap(), 2);
        assert_eq!(Format::Format30t.size(&d, 0).unwrap(), 3);
        assert_eq!(Format::Format51l.size(&d, 0).unwrap(), 5);
    }

    #[test]
    fn payload_sizes() {
        // packed-switch-payload with 3 targets
        let d = dex_of(&[0x0100, 3, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Format::Payload.size(&d, 0).unwrap(), 3 * 2 + 4);

        // sparse-switch-payload with 2 entries
        let d = dex_of(&[0x0200, 2, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Format::Payload.size(&d, 0).unwrap(), 2 * 4 + 2);

        // fill-array-data-payload: 5 elements of width 2
        let d = dex_of(&[0x0300, 2, 5, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Format::Payload.size(&d, 0).unwrap(), (2 * 5 + 1) / 2 + 4);

        // plain nop
        let d = dex_of(&[0x0000]);
        assert_eq!(Format::Payload.size(&d, 0).unwrap(), 1);
    }

    #[test]
    fn branch_displacements() {
        // goto -2: displacement in the high byte of the first unit
        let d = dex_of(&[0x28 | ((-2i8 as u8 as u16) << 8)]);
        assert_eq!(Format::Format10t.branch_displacement(&d, 0).unwrap(), Some(-2));

        // if-eqz v0, +5
        let d = dex_of(&[0x0038, 5]);
        assert_eq!(Format::Format21t.branch_displacement(&d, 0).unwrap(), Some(5));

        // goto/16 -300
        let d = dex_of(&[0x0029, -300i16 as u16]);
        assert_eq!(Format::Format20t.branch_displacement(&d, 0).unwrap(), Some(-300));

        // goto/32, low unit then high unit
        let d = dex_of(&[0x002A, 0x5678, 0x0001]);
        assert_eq!(
            Format::Format30t.branch_displacement(&d, 0).unwrap(),
            Some(0x0001_5678)
        );
        let d = dex_of(&[0x002A, 0xFFFE, 0xFFFF]);
        assert_eq!(Format::Format30t.branch_displacement(&d, 0).unwrap(), Some(-2));
    }

    #[test]
    fn dasm_registers_and_literals() {
        // if-eq v1, v2, +7
        let d = dex_of(&[0x0032 | (1 << 8) | (2 << 12), 7]);
        assert_eq!(Format::Format22t.dasm(&d, 0).unwrap(), "v1, v2, +7");

        // const/4 v3, #-1
        let d = dex_of(&[0x0012 | (3 << 8) | (0xF << 12)]);
        assert_eq!(Format::Format11n.dasm(&d, 0).unwrap(), "v3, #-1");
    }
}
