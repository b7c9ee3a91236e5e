//! DEX container reader.
//!
//! Walks the fixed header offsets, materializes the string/type/method and
//! class-def tables, and exposes the endian-aware primitive reads the rest
//! of the pipeline borrows. All reads are bounds-checked; a truncated or
//! out-of-range container surfaces as a `DexError` and fails the whole file.

use log::debug;

use crate::dex::error::DexError;
use crate::dex::leb::{decode_sleb128, decode_uleb128};
use crate::dex::opcodes;

/* Constants */
pub const ENDIAN_CONSTANT: u32 = 0x12345678;
pub const NO_INDEX: u32 = 0xffff_ffff;

const HEADER_SIZE: usize = 0x70;
const ENDIANNESS_OFFSET: usize = 40;
const STRING_IDS_OFFSET: usize = 56;
const TYPE_IDS_OFFSET: usize = 64;
const METHOD_IDS_OFFSET: usize = 88;
const CLASS_DEFS_OFFSET: usize = 96;

const METHOD_ID_SIZE: usize = 8;
const CLASS_DEF_SIZE: usize = 32;

/// A string from the string pool; MUTF-8 data that survives conversion is
/// kept decoded, anything else is kept raw with its utf16 length.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum DexString
{
    Decoded(String),
    Raw(u32, Vec<u8>),
}

impl DexString
{
    pub fn as_str(&self) -> Result<&str, DexError>
    {
        match self
        {
            DexString::Decoded(s) => Ok(s),
            DexString::Raw(_, _) => Err(DexError::new("string is not valid MUTF-8")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodIdItem
{
    pub class_idx: u16,
    pub proto_idx: u16,
    pub name_idx: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct EncodedFieldItem
{
    pub field_idx_diff: u32,
    pub access_flags: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct EncodedMethod
{
    pub method_idx_diff: u32,
    pub access_flags: u32,
    pub code_offs: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct TryItem
{
    pub start_addr: u32,
    pub insn_count: u16,
    pub handler_idx: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct EncodedTypeAddrPair
{
    pub type_idx: u32,
    pub addr: u32,
}

/// One entry of the encoded handler list; `offset` is relative to the
/// start of the list so try-items can refer to it.
#[derive(Debug, Clone)]
pub struct EncodedCatchHandler
{
    pub offset: u32,
    pub handlers: Vec<EncodedTypeAddrPair>,
    pub catch_all_addr: u32,
}

/// Per-method code record. The instruction stream starts 16 bytes past
/// `def_offs`; try/handler tables follow the (4-byte aligned) stream end.
#[derive(Debug)]
pub struct CodeItem
{
    def_offs: usize,
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub tries_size: u16,
    pub debug_info_offs: u32,
    insns_size: u32,
    pub tries: Vec<TryItem>,
    pub handlers: Vec<EncodedCatchHandler>,
}

impl CodeItem
{
    pub fn read(dex: &DexScanner, def_offs: usize) -> Result<CodeItem, DexError>
    {
        let mut code = CodeItem {
            def_offs,
            registers_size: dex.read_u16(def_offs)?,
            ins_size: dex.read_u16(def_offs + 2)?,
            outs_size: dex.read_u16(def_offs + 4)?,
            tries_size: dex.read_u16(def_offs + 6)?,
            debug_info_offs: dex.read_u32(def_offs + 8)?,
            insns_size: dex.read_u32(def_offs + 12)?,
            tries: vec![],
            handlers: vec![],
        };
        code.read_tries(dex)?;
        Ok(code)
    }

    fn read_tries(&mut self, dex: &DexScanner) -> Result<(), DexError>
    {
        if self.tries_size == 0 {
            return Ok(());
        }

        // try-items start on the next 4-byte boundary past the insns array
        let tries_offs = (self.def_offs + 16 + 2 * self.insns_size as usize + 2) & !3usize;
        let catch_offs = tries_offs + 8 * self.tries_size as usize;

        let mut scan = catch_offs;
        let catch_size = dex.read_uleb128(&mut scan)?;
        for _ in 0..catch_size
        {
            let offset = (scan - catch_offs) as u32;
            let types_size = dex.read_sleb128(&mut scan)?;
            let mut handlers = vec![];
            for _ in 0..types_size.unsigned_abs()
            {
                let type_idx = dex.read_uleb128(&mut scan)?;
                let addr = dex.read_uleb128(&mut scan)?;
                handlers.push(EncodedTypeAddrPair { type_idx, addr });
            }
            let catch_all_addr = if types_size <= 0 { dex.read_uleb128(&mut scan)? } else { 0 };
            self.handlers.push(EncodedCatchHandler { offset, handlers, catch_all_addr });
        }

        for t in 0..self.tries_size as usize
        {
            let start_addr = dex.read_u32(tries_offs + 8 * t)?;
            let insn_count = dex.read_u16(tries_offs + 8 * t + 4)?;
            let handler_offs = dex.read_u16(tries_offs + 8 * t + 6)? as u32;
            // the handler list is emitted in increasing offset order
            let handler_idx = self.handlers.partition_point(|h| h.offset < handler_offs) as u16;
            self.tries.push(TryItem { start_addr, insn_count, handler_idx });
        }

        Ok(())
    }

    /// Byte offset of the instruction stream.
    pub fn instr_offs(&self) -> usize
    {
        self.def_offs + 16
    }

    /// Instruction stream length in 16-bit code units.
    pub fn instr_size(&self) -> u32
    {
        self.insns_size
    }

    /// Opcode byte of the instruction at code-unit position `addr`.
    pub fn opcode(&self, dex: &DexScanner, addr: u32) -> Result<u8, DexError>
    {
        Ok((dex.read_u16(self.instr_offs() + 2 * addr as usize)? & 0xff) as u8)
    }

    /// Size in code units of the instruction at `addr`.
    pub fn opsize(&self, dex: &DexScanner, addr: u32) -> Result<u32, DexError>
    {
        let op = opcodes::opcode(self.opcode(dex, addr)?);
        op.size(dex, self.instr_offs() + 2 * addr as usize)
    }
}

/// The class_def_item record plus its parsed class-data lists.
#[derive(Debug)]
pub struct ClassDefItem
{
    pub type_idx: u32,
    pub access_flags: u32,
    pub superclass_idx: u32,
    pub interfaces_offs: u32,
    pub source_file_idx: u32,
    pub annotations_offs: u32,
    pub class_data_offs: u32,
    pub static_values_offs: u32,

    pub static_fields: Vec<EncodedFieldItem>,
    pub instance_fields: Vec<EncodedFieldItem>,
    pub direct_methods: Vec<EncodedMethod>,
    pub virtual_methods: Vec<EncodedMethod>,
}

impl ClassDefItem
{
    pub fn read(dex: &DexScanner, def_offs: usize) -> Result<ClassDefItem, DexError>
    {
        let mut class = ClassDefItem {
            type_idx: dex.read_u32(def_offs)?,
            access_flags: dex.read_u32(def_offs + 4)?,
            superclass_idx: dex.read_u32(def_offs + 8)?,
            interfaces_offs: dex.read_u32(def_offs + 12)?,
            source_file_idx: dex.read_u32(def_offs + 16)?,
            annotations_offs: dex.read_u32(def_offs + 20)?,
            class_data_offs: dex.read_u32(def_offs + 24)?,
            static_values_offs: dex.read_u32(def_offs + 28)?,
            static_fields: vec![],
            instance_fields: vec![],
            direct_methods: vec![],
            virtual_methods: vec![],
        };
        class.read_class_data(dex)?;
        Ok(class)
    }

    fn read_class_data(&mut self, dex: &DexScanner) -> Result<(), DexError>
    {
        if self.class_data_offs == 0 {
            return Ok(());
        }
        let mut scan = self.class_data_offs as usize;
        let static_fields_size = dex.read_uleb128(&mut scan)?;
        let instance_fields_size = dex.read_uleb128(&mut scan)?;
        let direct_methods_size = dex.read_uleb128(&mut scan)?;
        let virtual_methods_size = dex.read_uleb128(&mut scan)?;

        for _ in 0..static_fields_size
        {
            let field_idx_diff = dex.read_uleb128(&mut scan)?;
            let access_flags = dex.read_uleb128(&mut scan)?;
            self.static_fields.push(EncodedFieldItem { field_idx_diff, access_flags });
        }

        for _ in 0..instance_fields_size
        {
            let field_idx_diff = dex.read_uleb128(&mut scan)?;
            let access_flags = dex.read_uleb128(&mut scan)?;
            self.instance_fields.push(EncodedFieldItem { field_idx_diff, access_flags });
        }

        for _ in 0..direct_methods_size
        {
            let method_idx_diff = dex.read_uleb128(&mut scan)?;
            let access_flags = dex.read_uleb128(&mut scan)?;
            let code_offs = dex.read_uleb128(&mut scan)?;
            self.direct_methods.push(EncodedMethod { method_idx_diff, access_flags, code_offs });
        }

        for _ in 0..virtual_methods_size
        {
            let method_idx_diff = dex.read_uleb128(&mut scan)?;
            let access_flags = dex.read_uleb128(&mut scan)?;
            let code_offs = dex.read_uleb128(&mut scan)?;
            self.virtual_methods.push(EncodedMethod { method_idx_diff, access_flags, code_offs });
        }

        Ok(())
    }
}

/// Reader over the raw container bytes.
#[derive(Debug)]
pub struct DexScanner
{
    content: Vec<u8>,
    endianness: u32,

    strings: Vec<DexString>,
    type_ids: Vec<u32>,
    method_ids: Vec<MethodIdItem>,
    class_defs: Vec<ClassDefItem>,
}

impl DexScanner
{
    /// Wraps the file bytes. Nothing is read until `parse`; primitive reads
    /// assume the little-endian layout until the endian tag says otherwise.
    pub fn new(content: Vec<u8>) -> DexScanner
    {
        DexScanner {
            content,
            endianness: ENDIAN_CONSTANT,
            strings: vec![],
            type_ids: vec![],
            method_ids: vec![],
            class_defs: vec![],
        }
    }

    pub fn parse(&mut self) -> Result<(), DexError>
    {
        self.parse_header()?;
        self.load_strings()?;
        self.load_types()?;
        self.load_methods()?;
        self.load_class_defs()?;
        Ok(())
    }

    fn parse_header(&mut self) -> Result<(), DexError>
    {
        if self.content.len() < HEADER_SIZE {
            fail!("container too short for a header: {} bytes", self.content.len());
        }
        if &self.content[0..3] != b"dex" {
            fail!("bad magic");
        }
        self.endianness = u32::from_le_bytes(
            self.content[ENDIANNESS_OFFSET..ENDIANNESS_OFFSET + 4].try_into().unwrap(),
        );
        debug!(
            "endianness: {}",
            if self.is_machine_endian() { "machine" } else { "reverse" }
        );
        Ok(())
    }

    fn is_machine_endian(&self) -> bool
    {
        self.endianness == ENDIAN_CONSTANT
    }

    pub fn read_u16(&self, position: usize) -> Result<u16, DexError>
    {
        if self.content.len() < position.saturating_add(2) {
            fail!("unexpected end of container reading u16 at {}", position);
        }
        let result = u16::from_le_bytes(self.content[position..position + 2].try_into().unwrap());
        if self.is_machine_endian() {
            Ok(result)
        } else {
            Ok(result.swap_bytes())
        }
    }

    pub fn read_u32(&self, position: usize) -> Result<u32, DexError>
    {
        if self.content.len() < position.saturating_add(4) {
            fail!("unexpected end of container reading u32 at {}", position);
        }
        let result = u32::from_le_bytes(self.content[position..position + 4].try_into().unwrap());
        if self.is_machine_endian() {
            Ok(result)
        } else {
            Ok(result.swap_bytes())
        }
    }

    pub fn read_u8(&self, position: usize) -> Result<u8, DexError>
    {
        if self.content.len() < position.saturating_add(1) {
            fail!("unexpected end of container reading u8 at {}", position);
        }
        Ok(self.content[position])
    }

    pub fn read_uleb128(&self, position: &mut usize) -> Result<u32, DexError>
    {
        let slice = self
            .content
            .get(*position..)
            .ok_or_else(|| DexError::new("uleb128 read past end of container"))?;
        let (val, size) = decode_uleb128(slice);
        if size == 0 || slice[size - 1] & 0x80 != 0 {
            fail!("uleb128 at {} runs past end of container", *position);
        }
        *position += size;
        Ok(val)
    }

    pub fn read_sleb128(&self, position: &mut usize) -> Result<i32, DexError>
    {
        let slice = self
            .content
            .get(*position..)
            .ok_or_else(|| DexError::new("sleb128 read past end of container"))?;
        let (val, size) = decode_sleb128(slice);
        if size == 0 || slice[size - 1] & 0x80 != 0 {
            fail!("sleb128 at {} runs past end of container", *position);
        }
        *position += size;
        Ok(val)
    }

    fn load_strings(&mut self) -> Result<(), DexError>
    {
        let size = self.read_u32(STRING_IDS_OFFSET)?;
        let offs = self.read_u32(STRING_IDS_OFFSET + 4)? as usize;
        for t in 0..size as usize
        {
            let mut data_offs = self.read_u32(offs + 4 * t)? as usize;
            let ds = self
                .read_string(&mut data_offs)
                .map_err(|e| err!(e, "string {}", t))?;
            self.strings.push(ds);
        }
        debug!("strings: {} loaded", self.strings.len());
        Ok(())
    }

    fn read_string(&self, position: &mut usize) -> Result<DexString, DexError>
    {
        let utf16_size = self.read_uleb128(position)?;
        let mut v = vec![];
        loop
        {
            let u = self.read_u8(*position)?;
            *position += 1;
            if u != 0 { v.push(u); } else { break; }
        }

        Ok(match cesu8::from_java_cesu8(v.as_slice())
        {
            Ok(converted) => DexString::Decoded(converted.to_string()),
            _ => DexString::Raw(utf16_size, v),
        })
    }

    fn load_types(&mut self) -> Result<(), DexError>
    {
        let size = self.read_u32(TYPE_IDS_OFFSET)?;
        let offs = self.read_u32(TYPE_IDS_OFFSET + 4)? as usize;
        for t in 0..size as usize
        {
            let descriptor_idx = self.read_u32(offs + 4 * t)?;
            if descriptor_idx as usize >= self.strings.len() {
                fail!("type {} names string {} outside the pool", t, descriptor_idx);
            }
            self.type_ids.push(descriptor_idx);
        }
        debug!("types: {} loaded", self.type_ids.len());
        Ok(())
    }

    fn load_methods(&mut self) -> Result<(), DexError>
    {
        let size = self.read_u32(METHOD_IDS_OFFSET)?;
        let offs = self.read_u32(METHOD_IDS_OFFSET + 4)? as usize;
        for t in 0..size as usize
        {
            let class_idx = self.read_u16(offs + METHOD_ID_SIZE * t)?;
            let proto_idx = self.read_u16(offs + METHOD_ID_SIZE * t + 2)?;
            let name_idx = self.read_u32(offs + METHOD_ID_SIZE * t + 4)?;
            self.method_ids.push(MethodIdItem { class_idx, proto_idx, name_idx });
        }
        debug!("methods: {} loaded", self.method_ids.len());
        Ok(())
    }

    fn load_class_defs(&mut self) -> Result<(), DexError>
    {
        let size = self.read_u32(CLASS_DEFS_OFFSET)?;
        let offs = self.read_u32(CLASS_DEFS_OFFSET + 4)? as usize;
        for t in 0..size as usize
        {
            let class = ClassDefItem::read(self, offs + CLASS_DEF_SIZE * t)
                .map_err(|e| err!(e, "class def {}", t))?;
            self.class_defs.push(class);
        }
        debug!("class defs: {} loaded", self.class_defs.len());
        Ok(())
    }

    pub fn strings(&self) -> &[DexString] { &self.strings }
    pub fn type_ids(&self) -> &[u32] { &self.type_ids }
    pub fn method_ids(&self) -> &[MethodIdItem] { &self.method_ids }
    pub fn class_defs(&self) -> &[ClassDefItem] { &self.class_defs }

    pub fn string(&self, idx: u32) -> Result<&str, DexError>
    {
        self.strings
            .get(idx as usize)
            .ok_or_else(|| DexError::new("string index out of range"))?
            .as_str()
    }

    /// JNI-style descriptor of a type, e.g. `Lcom/example/Main;`.
    pub fn type_descriptor(&self, type_idx: u32) -> Result<&str, DexError>
    {
        let descriptor_idx = *self
            .type_ids
            .get(type_idx as usize)
            .ok_or_else(|| DexError::new("type index out of range"))?;
        self.string(descriptor_idx)
    }

    pub fn method_name(&self, method_idx: u32) -> Result<&str, DexError>
    {
        let item = self
            .method_ids
            .get(method_idx as usize)
            .ok_or_else(|| DexError::new("method index out of range"))?;
        self.string(item.name_idx)
    }
}
