//! Basic-block discovery over a method's instruction stream.
//!
//! A single linear walk assigns every code unit to a block while branch
//! targets are still being discovered. A backward target landing inside an
//! already-walked block splits that block in place: the target inherits the
//! block's successor list and the old head keeps a single fall-through edge
//! to it. A second walk derives the block sizes once the edges settle.

use log::trace;

use crate::dex::error::DexError;
use crate::fail;
use crate::dex::opcodes;
use crate::dex::scanner::{CodeItem, DexScanner};
use crate::flow::dominators::Edges;

/// State of one code-unit position in the edge table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot
{
    /// Not walked yet.
    Unvisited,
    /// Inside the block whose head is the payload.
    Interior(u32),
    /// Block head with its successors (empty until they are recorded).
    Head(Vec<u32>),
}

/// The resolved per-method flow graph.
#[derive(Debug)]
pub struct FlowGraph
{
    pub slots: Vec<Slot>,
    /// pc -> size in code units; nonzero exactly at block heads.
    pub block_size: Vec<u32>,
    /// `prev_instr[k - 1]` is the pc of the instruction ending at `k - 1`.
    pub prev_instr: Vec<u32>,
}

struct Builder
{
    slots: Vec<Slot>,
    prev_instr: Vec<u32>,
    current_pc: u32,
    current_block: u32,
}

impl Builder
{
    /// Records an edge from the current block to `to`, splitting the block
    /// `to` lands in when the jump goes backward into walked territory.
    fn put_edge(&mut self, to: u32) -> Result<(), DexError>
    {
        if to as usize >= self.slots.len() {
            fail!("branch target {} outside the method body", to);
        }

        match &mut self.slots[self.current_block as usize]
        {
            Slot::Head(succ) => succ.push(to),
            _ => fail!("block head {} lost its slot", self.current_block),
        }

        if to > self.current_pc {
            // forward jump: the target becomes a pending head
            self.slots[to as usize] = Slot::Head(Vec::new());
            return Ok(());
        }

        if let Slot::Interior(b_start) = self.slots[to as usize]
        {
            // `to` takes over the successors recorded for the block it
            // lands in; the shortened block keeps `to` as its only exit
            let succ = std::mem::replace(
                &mut self.slots[b_start as usize],
                Slot::Head(vec![to]),
            );
            self.slots[to as usize] = succ;
            if b_start == self.current_block {
                self.current_block = to;
            }
            let mut q = to + 1;
            while (q as usize) < self.slots.len()
                && self.slots[q as usize] == Slot::Interior(b_start)
            {
                self.slots[q as usize] = Slot::Interior(to);
                q += 1;
            }
            trace!("split block {} at {}", b_start, to);
        }
        Ok(())
    }
}

impl FlowGraph
{
    pub fn build(dex: &DexScanner, code: &CodeItem) -> Result<FlowGraph, DexError>
    {
        let code_size = code.instr_size();
        if code_size == 0 {
            fail!("empty code item");
        }

        let mut b = Builder {
            slots: vec![Slot::Unvisited; code_size as usize],
            prev_instr: vec![0; code_size as usize],
            current_pc: 0,
            current_block: 0,
        };
        b.slots[0] = Slot::Head(Vec::new());

        let mut next_pc = 0u32;
        let mut cont = false;
        while next_pc <= code_size
        {
            for q in b.current_pc + 1..next_pc
            {
                b.slots[q as usize] = Slot::Interior(b.current_block);
                b.prev_instr[q as usize - 1] = b.current_pc;
            }
            if next_pc > 0 {
                b.prev_instr[next_pc as usize - 1] = b.current_pc;
            }
            b.current_pc = next_pc;
            if b.current_pc == code_size {
                break;
            }

            if matches!(b.slots[b.current_pc as usize], Slot::Head(_))
            {
                // arriving at a head: close out a fall-through from the
                // previous block when it recorded no successor yet
                if cont {
                    let pc = b.current_pc;
                    if let Slot::Head(succ) = &mut b.slots[b.current_block as usize] {
                        if succ.is_empty() {
                            succ.push(pc);
                        }
                    }
                }
                b.current_block = b.current_pc;
            }
            else
            {
                b.slots[b.current_pc as usize] = Slot::Interior(b.current_block);
            }

            cont = false;
            let offs = code.instr_offs() + 2 * b.current_pc as usize;
            let op = opcodes::opcode(code.opcode(dex, b.current_pc)?);
            next_pc = b.current_pc + op.size(dex, offs)?;

            if op.is_return() || op.is_throw()
            {
                if next_pc < code_size {
                    b.slots[next_pc as usize] = Slot::Head(Vec::new());
                }
            }
            else if op.is_branch()
            {
                let disp = op
                    .format
                    .branch_displacement(dex, offs)?
                    .ok_or_else(|| DexError::new("branch opcode without a displacement"))?;
                b.put_edge(offset_target(b.current_pc, disp, code_size)?)?;
                b.put_edge(next_pc)?;
            }
            else if op.is_goto()
            {
                let disp = op
                    .format
                    .branch_displacement(dex, offs)?
                    .ok_or_else(|| DexError::new("goto opcode without a displacement"))?;
                b.put_edge(offset_target(b.current_pc, disp, code_size)?)?;
                if next_pc < code_size {
                    b.slots[next_pc as usize] = Slot::Head(Vec::new());
                }
            }
            else
            {
                cont = true;
            }
        }

        // second walk: sizes, now that every head is known
        let mut block_size = vec![0u32; code_size as usize];
        let mut current_block = 0u32;
        let mut current_pc = 0u32;
        while current_pc <= code_size
        {
            if current_pc == code_size
                || !matches!(b.slots[current_pc as usize], Slot::Interior(_))
            {
                block_size[current_block as usize] = current_pc - current_block;
                current_block = current_pc;
            }
            if current_pc == code_size {
                break;
            }
            current_pc += code.opsize(dex, current_pc)?;
        }

        Ok(FlowGraph { slots: b.slots, block_size, prev_instr: b.prev_instr })
    }

    /// True when `pc` heads a basic block.
    pub fn is_head(&self, pc: u32) -> bool
    {
        self.block_size[pc as usize] > 0
    }

    /// pc of the last instruction of the block headed at `head`.
    pub fn block_last(&self, head: u32) -> u32
    {
        self.prev_instr[(head + self.block_size[head as usize] - 1) as usize]
    }

    /// Adjacency lists for the dominator engine: interior and unvisited
    /// positions become empty vertices, heads keep their successors.
    pub fn edges(&self) -> Result<Edges, DexError>
    {
        let mut out: Edges = vec![vec![]; self.slots.len()];
        for (pc, slot) in self.slots.iter().enumerate()
        {
            if let Slot::Head(succ) = slot
            {
                for &v in succ {
                    if !self.is_head(v) {
                        fail!("edge {} -> {} targets a non-head position", pc, v);
                    }
                }
                out[pc] = succ.clone();
            }
        }
        Ok(out)
    }
}

fn offset_target(pc: u32, displacement: i32, code_size: u32) -> Result<u32, DexError>
{
    let target = pc as i64 + displacement as i64;
    if target < 0 || target >= code_size as i64 {
        fail!("jump from {} lands at {} outside the method body", pc, target);
    }
    Ok(target as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::scanner::{CodeItem, DexScanner};

    fn method(units: &[u16]) -> (DexScanner, CodeItem) {
        let mut bytes = vec![];
        for v in [1u16, 0, 0, 0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&(units.len() as u32).to_le_bytes());
        for u in units {
            bytes.extend_from_slice(&u.to_le_bytes());
        }
        let dex = DexScanner::new(bytes);
        let code = CodeItem::read(&dex, 0).unwrap();
        (dex, code)
    }

    fn goto(disp: i8) -> u16 {
        0x28 | ((disp as u8 as u16) << 8)
    }

    fn if_eqz(reg: u8, disp: i16) -> [u16; 2] {
        [0x38 | ((reg as u16) << 8), disp as u16]
    }

    const NOP: u16 = 0x0000;
    const RETURN_VOID: u16 = 0x000e;

    fn succ(fg: &FlowGraph, head: u32) -> Vec<u32> {
        match &fg.slots[head as usize] {
            Slot::Head(s) => s.clone(),
            other => panic!("{} is not a head: {:?}", head, other),
        }
    }

    #[test]
    fn straight_line_is_one_block() {
        let (dex, code) = method(&[NOP, NOP, RETURN_VOID]);
        let fg = FlowGraph::build(&dex, &code).unwrap();
        assert_eq!(fg.block_size, vec![3, 0, 0]);
        assert!(succ(&fg, 0).is_empty());
        assert_eq!(fg.block_last(0), 2);
    }

    #[test]
    fn conditional_splits_three_ways() {
        // 0: if-eqz v0, +3 -> 3;  2: nop;  3: nop;  4: return-void
        let [b0, b1] = if_eqz(0, 3);
        let (dex, code) = method(&[b0, b1, NOP, NOP, RETURN_VOID]);
        let fg = FlowGraph::build(&dex, &code).unwrap();
        assert_eq!(fg.block_size, vec![2, 0, 1, 2, 0]);
        assert_eq!(succ(&fg, 0), vec![3, 2]); // taken target first
        assert_eq!(succ(&fg, 2), vec![3]); // fall-through edge
        assert!(succ(&fg, 3).is_empty());
    }

    #[test]
    fn goto_ends_a_block_without_fallthrough() {
        // 0: nop;  1: goto +2 -> 3;  2: nop (unreachable);  3: return-void
        let (dex, code) = method(&[NOP, goto(2), NOP, RETURN_VOID]);
        let fg = FlowGraph::build(&dex, &code).unwrap();
        assert_eq!(fg.block_size, vec![2, 0, 1, 1]);
        assert_eq!(succ(&fg, 0), vec![3]);
        assert_eq!(succ(&fg, 2), vec![3]); // the dead block still falls through
    }

    #[test]
    fn backward_goto_splits_a_walked_block() {
        // 0: nop;  1: nop;  2: nop;  3: goto -2 -> 1
        let (dex, code) = method(&[NOP, NOP, NOP, goto(-2)]);
        let fg = FlowGraph::build(&dex, &code).unwrap();
        // the run [0..4) is split at the late-discovered target 1
        assert_eq!(fg.block_size, vec![1, 3, 0, 0]);
        assert_eq!(succ(&fg, 0), vec![1]);
        assert_eq!(succ(&fg, 1), vec![1]); // self loop of the split-off tail
        assert_eq!(fg.block_last(0), 0);
        assert_eq!(fg.block_last(1), 3);
        // both halves are real vertices for the dominator engine
        let edges = fg.edges().unwrap();
        assert_eq!(edges[0], vec![1]);
        assert_eq!(edges[1], vec![1]);
    }

    #[test]
    fn no_marker_survives_into_the_edge_list() {
        let [b0, b1] = if_eqz(0, 4);
        let (dex, code) = method(&[b0, b1, NOP, goto(-3), NOP, RETURN_VOID]);
        let fg = FlowGraph::build(&dex, &code).unwrap();
        for (pc, e) in fg.edges().unwrap().iter().enumerate() {
            if !e.is_empty() {
                assert!(fg.is_head(pc as u32));
            }
            for &v in e {
                assert!(fg.is_head(v));
            }
        }
    }

    #[test]
    fn jump_outside_the_body_is_rejected() {
        let (dex, code) = method(&[goto(5), NOP]);
        assert!(FlowGraph::build(&dex, &code).is_err());
    }
}
