//! # dexrev
//!
//! A decompiler front half for DEX bytecode: parses the container, walks
//! its classes and methods, and for each method body rebuilds a structured
//! control-flow tree (loops, conditionals, returns, throws) ready for
//! emission as source-level code.
//!
//! The pipeline per method: [`flow::cfg::FlowGraph`] discovers basic
//! blocks over the variable-width instruction stream,
//! [`flow::dominators::DominatorEval`] computes the dominator tree
//! (Lengauer–Tarjan), and [`flow::method::MethodDasm`] classifies each
//! dominated region into while/do/if shapes.
//!
//! ```no_run
//! use dexrev::dex::scanner::DexScanner;
//! use dexrev::flow::method::MethodDasm;
//!
//! let bytes = std::fs::read("classes.dex").unwrap();
//! let mut dex = DexScanner::new(bytes);
//! dex.parse().unwrap();
//! for m in dexrev::methods(&dex) {
//!     let mut dasm = MethodDasm::run(&dex, m.code_offs).unwrap();
//!     dasm.reconstruct_ast().unwrap();
//!     println!("{}", dasm.render_ast());
//! }
//! ```

pub mod dex;
pub mod flow;

pub use dex::error::DexError;
pub use dex::scanner::DexScanner;
pub use flow::method::MethodDasm;

/// A method with a code item, resolved from the class-data diff encoding.
#[derive(Debug, Clone, Copy)]
pub struct MethodRef
{
    /// type_id of the declaring class.
    pub class_type_idx: u32,
    /// Resolved index into the method-id table.
    pub method_idx: u32,
    pub access_flags: u32,
    pub code_offs: u32,
}

/// Every method in the container that carries code, in class-def order.
/// The `method_idx_diff` accumulation restarts per list, the way the
/// class-data encoding defines it.
pub fn methods(dex: &DexScanner) -> Vec<MethodRef>
{
    let mut out = vec![];
    for class_def in dex.class_defs()
    {
        for list in [&class_def.direct_methods, &class_def.virtual_methods]
        {
            let mut method_idx = 0u32;
            for m in list
            {
                method_idx += m.method_idx_diff;
                if m.code_offs == 0 {
                    continue;
                }
                out.push(MethodRef {
                    class_type_idx: class_def.type_idx,
                    method_idx,
                    access_flags: m.access_flags,
                    code_offs: m.code_offs,
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Lays out a minimal container: one class, one direct method whose
    // code is a two-armed conditional.
    fn tiny_dex() -> Vec<u8> {
        let mut b = vec![0u8; 0x70];
        b[0..4].copy_from_slice(b"dex\n");
        b[40..44].copy_from_slice(&0x12345678u32.to_le_bytes());

        let put = |b: &mut Vec<u8>, at: usize, v: u32| {
            b[at..at + 4].copy_from_slice(&v.to_le_bytes());
        };

        // string pool: "LFoo;", "run"
        let mut string_data_offs = vec![];
        for s in ["LFoo;", "run"] {
            string_data_offs.push(b.len() as u32);
            b.push(s.len() as u8); // utf16 length, uleb128 single byte
            b.extend_from_slice(s.as_bytes());
            b.push(0);
        }
        let string_ids = b.len() as u32;
        for offs in &string_data_offs {
            b.extend_from_slice(&offs.to_le_bytes());
        }

        // one type: LFoo;
        let type_ids = b.len() as u32;
        b.extend_from_slice(&0u32.to_le_bytes());

        // one method id: class 0, proto 0, name "run"
        let method_ids = b.len() as u32;
        b.extend_from_slice(&0u16.to_le_bytes());
        b.extend_from_slice(&0u16.to_le_bytes());
        b.extend_from_slice(&1u32.to_le_bytes());

        // code item: if-eqz v0, +3 -> 3; nop; nop; return-void
        while b.len() % 4 != 0 {
            b.push(0);
        }
        let code_offs = b.len() as u32;
        for v in [1u16, 0, 0, 0] {
            b.extend_from_slice(&v.to_le_bytes());
        }
        b.extend_from_slice(&0u32.to_le_bytes());
        b.extend_from_slice(&5u32.to_le_bytes());
        for u in [0x0038u16, 3, 0x0000, 0x0000, 0x000e] {
            b.extend_from_slice(&u.to_le_bytes());
        }

        // class data: no fields, one direct method, no virtual methods
        let class_data = b.len() as u32;
        b.push(0);
        b.push(0);
        b.push(1);
        b.push(0);
        b.push(0); // method_idx_diff
        b.push(1); // access_flags
        // code_offs as uleb128
        let mut v = code_offs;
        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            b.push(byte);
            if v == 0 {
                break;
            }
        }

        // class def
        let class_defs = b.len() as u32;
        for field in [0u32, 0, 0xffff_ffff, 0, 0xffff_ffff, 0, class_data, 0] {
            b.extend_from_slice(&field.to_le_bytes());
        }

        put(&mut b, 56, 2);
        put(&mut b, 60, string_ids);
        put(&mut b, 64, 1);
        put(&mut b, 68, type_ids);
        put(&mut b, 88, 1);
        put(&mut b, 92, method_ids);
        put(&mut b, 96, 1);
        put(&mut b, 100, class_defs);
        b
    }

    #[test]
    fn parses_and_reconstructs_a_whole_container() {
        let mut dex = DexScanner::new(tiny_dex());
        dex.parse().unwrap();
        assert_eq!(dex.class_defs().len(), 1);
        assert_eq!(dex.type_descriptor(0).unwrap(), "LFoo;");

        let ms = methods(&dex);
        assert_eq!(ms.len(), 1);
        assert_eq!(dex.method_name(ms[0].method_idx).unwrap(), "run");

        let mut dasm = MethodDasm::run(&dex, ms[0].code_offs).unwrap();
        dasm.reconstruct_ast().unwrap();
        let rendered = dasm.render_ast();
        assert!(rendered.starts_with("if ("), "{}", rendered);
    }

    #[test]
    fn truncated_container_is_a_file_level_error() {
        let mut short = tiny_dex();
        short.truncate(50);
        let mut dex = DexScanner::new(short);
        assert!(dex.parse().is_err());
    }
}
