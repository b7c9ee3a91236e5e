//! Per-method pipeline: code item -> flow graph -> dominators -> tree.
//!
//! `reconstruct_block` classifies each dominator-tree node by three facts:
//! whether a back edge makes it a loop header, what its last instruction
//! is, and how many of its dominator children still have outgoing edges.
//! The classification follows the dominance relation only; no register or
//! exception-table state is consulted.

use log::debug;

use crate::dex::error::DexError;
use crate::fail;
use crate::dex::opcodes::{self, Opcode};
use crate::dex::scanner::{CodeItem, DexScanner};
use crate::flow::ast::{Ast, NodeId, NodeKind};
use crate::flow::cfg::{FlowGraph, Slot};
use crate::flow::dominators::DominatorEval;

/// An active loop during reconstruction. `continue_pc` is the block a
/// `continue` re-enters (the header, or the cond block of a do-loop);
/// `exit_pc` is where a `break` lands.
struct LoopCtx
{
    node: NodeId,
    body: NodeId,
    continue_pc: u32,
    exit_pc: Option<u32>,
}

// One reconstruct_block activation. Continuations that leave the region's
// dominance land in `deferred` and are emitted as siblings once the
// region closes.
struct Region
{
    head: u32,
    deferred: Vec<u32>,
}

pub struct MethodDasm<'a>
{
    dex: &'a DexScanner,
    code: CodeItem,
    flow: FlowGraph,
    doms: DominatorEval,

    ast: Ast,
    root: NodeId,
    current_compound: NodeId,
    reconstructed: Vec<bool>,
    loops: Vec<LoopCtx>,
    regions: Vec<Region>,
}

impl<'a> MethodDasm<'a>
{
    /// Builds the flow graph and dominator tree for the code item at
    /// `code_offs`. The structured tree is produced by `reconstruct_ast`.
    pub fn run(dex: &'a DexScanner, code_offs: u32) -> Result<MethodDasm<'a>, DexError>
    {
        let code = CodeItem::read(dex, code_offs as usize)?;
        let flow = FlowGraph::build(dex, &code)?;
        let mut doms = DominatorEval::new(flow.edges()?);
        doms.compute();

        let mut ast = Ast::new();
        let root = ast.alloc(None, 0, NodeKind::Compound { children: vec![] });
        let code_size = code.instr_size() as usize;
        Ok(MethodDasm {
            dex,
            code,
            flow,
            doms,
            ast,
            root,
            current_compound: root,
            reconstructed: vec![false; code_size],
            loops: vec![],
            regions: vec![],
        })
    }

    pub fn ast(&self) -> &Ast { &self.ast }
    pub fn root(&self) -> NodeId { self.root }
    pub fn flow(&self) -> &FlowGraph { &self.flow }
    pub fn doms(&self) -> &DominatorEval { &self.doms }
    pub fn code(&self) -> &CodeItem { &self.code }

    /// Walks the dominator tree from the entry block and fills the arena.
    /// Structural violations abort the method; the container stays usable
    /// for the remaining methods.
    pub fn reconstruct_ast(&mut self) -> Result<NodeId, DexError>
    {
        debug!("reconstructing {} code units", self.code.instr_size());
        self.reconstruct_block(0, false)?;
        Ok(self.root)
    }

    pub fn render_ast(&self) -> String
    {
        self.ast.render(self.root)
    }

    fn opcode_at(&self, pc: u32) -> Result<&'static Opcode, DexError>
    {
        Ok(opcodes::opcode(self.code.opcode(self.dex, pc)?))
    }

    fn block_last(&self, head: u32) -> u32
    {
        self.flow.block_last(head)
    }

    fn attach(&mut self, head: u32, kind: NodeKind) -> NodeId
    {
        let id = self.ast.alloc(Some(self.current_compound), head, kind);
        self.ast.push_child(self.current_compound, id);
        id
    }

    fn make_compound(&mut self, parent: NodeId, head: u32) -> NodeId
    {
        self.ast.alloc(Some(parent), head, NodeKind::Compound { children: vec![] })
    }

    fn set_branch_arm(&mut self, branch: NodeId, true_arm: bool, arm: NodeId)
    {
        if let NodeKind::Branch { on_true, on_false, .. } = &mut self.ast.node_mut(branch).kind
        {
            if true_arm { *on_true = Some(arm); } else { *on_false = Some(arm); }
        }
    }

    fn reconstruct_block(&mut self, head: u32, ignore_loop: bool) -> Result<(), DexError>
    {
        debug!("head: {}", head);
        if !ignore_loop
        {
            // the pending condition of an active do-loop; its instructions
            // already live in that loop's cond node
            if self.loops.iter().any(|l| l.continue_pc == head)
            {
                self.reconstructed[head as usize] = true;
                return Ok(());
            }
            if self.reconstructed[head as usize] {
                fail!("block {} reconstructed twice", head);
            }
        }
        self.reconstructed[head as usize] = true;
        self.regions.push(Region { head, deferred: vec![] });
        let prev_compound = self.current_compound;

        let result = self.reconstruct_block_inner(head, ignore_loop, prev_compound);

        let region = match self.regions.pop()
        {
            Some(r) => r,
            None => fail!("region stack underflow at {}", head),
        };
        self.current_compound = prev_compound;
        result?;
        for to in region.deferred
        {
            self.reconstruct_continuation(to)?;
        }
        Ok(())
    }

    fn reconstruct_block_inner(
        &mut self,
        head: u32,
        ignore_loop: bool,
        prev_compound: NodeId,
    ) -> Result<(), DexError>
    {
        let opcode = self.opcode_at(self.block_last(head))?;
        let inbound = self.doms.inbound()[head as usize].clone();
        let outbound = self.doms.outbound()[head as usize].clone();

        let cyclic: Vec<u32> = inbound
            .iter()
            .copied()
            .filter(|&p| self.doms.is_dominated(p, head))
            .collect();

        if !ignore_loop && !cyclic.is_empty()
        {
            return self.reconstruct_loop(head, opcode, &cyclic, &outbound);
        }

        if opcode.is_return()
        {
            if !outbound.is_empty() {
                fail!("return block {} has successors", head);
            }
            self.attach(head, NodeKind::Return);
        }
        else if opcode.is_throw()
        {
            if !outbound.is_empty() {
                fail!("throw block {} has successors", head);
            }
            self.attach(head, NodeKind::Throw);
        }
        else if opcode.is_branch()
        {
            self.reconstruct_branch(head, &outbound, prev_compound)?;
        }
        else if opcode.is_goto()
        {
            if outbound.len() != 1 {
                fail!("goto block {} has {} successors", head, outbound.len());
            }
            // a goto block with real content contributes a Basic; a bare
            // goto is only an edge
            let last = self.block_last(head);
            if self.flow.block_size[head as usize] > self.code.opsize(self.dex, last)? {
                self.attach(head, NodeKind::Basic);
            }
            self.reconstruct_continuation(outbound[0])?;
        }
        else
        {
            if outbound.len() != 1 {
                fail!("fall-through block {} has {} successors", head, outbound.len());
            }
            self.attach(head, NodeKind::Basic);
            self.reconstruct_continuation(outbound[0])?;
        }
        Ok(())
    }

    fn reconstruct_loop(
        &mut self,
        head: u32,
        opcode: &Opcode,
        cyclic: &[u32],
        outbound: &[u32],
    ) -> Result<(), DexError>
    {
        let back_op = self.opcode_at(self.block_last(cyclic[0]))?;
        let pretested = opcode.is_branch() && (cyclic.len() != 1 || !back_op.is_branch());

        if pretested
        {
            // while (cond) { body } cont;
            if outbound.len() != 2 {
                fail!("loop header {} has {} successors", head, outbound.len());
            }
            let then_block = outbound[0];
            let else_block = outbound[1];
            let invert = !self.doms.is_dominated(then_block, head)
                || !self.doms.is_dominated(cyclic[0], then_block);
            let body_block = if invert { else_block } else { then_block };
            if !self.doms.is_dominated(body_block, head)
                || !self.doms.is_dominated(cyclic[0], body_block)
            {
                fail!(
                    "loop at {} has no body among successors {} and {}",
                    head, then_block, else_block
                );
            }

            let cond = self.ast.alloc(None, head, NodeKind::Basic);
            let loop_id = self.attach(head, NodeKind::While { invert, cond, body: None });
            self.ast.node_mut(cond).parent = Some(loop_id);

            let exit = then_block + else_block - body_block;
            self.reconstruct_continuation(exit)?;

            let body = self.make_compound(loop_id, body_block);
            if let NodeKind::While { body: b, .. } = &mut self.ast.node_mut(loop_id).kind {
                *b = Some(body);
            }
            self.loops.push(LoopCtx { node: loop_id, body, continue_pc: head, exit_pc: Some(exit) });
            self.current_compound = body;
            let result = self.reconstruct_block(body_block, false);
            self.loops.pop();
            result
        }
        else if back_op.is_branch()
        {
            // do { body } while (cond); cont;
            let cond_head = cyclic[0];
            let cond_out = self.doms.outbound()[cond_head as usize].clone();
            if cond_out.len() != 2 {
                fail!("do-loop condition {} has {} successors", cond_head, cond_out.len());
            }
            if cond_out[0] != head && cond_out[1] != head {
                fail!("back edge {} -> {} is not among the condition successors", cond_head, head);
            }
            let invert = cond_out[0] != head;
            let exit = cond_out[0] + cond_out[1] - head;

            let cond = self.ast.alloc(None, cond_head, NodeKind::Basic);
            let loop_id = self.attach(head, NodeKind::Do { invert, cond, body: None });
            self.ast.node_mut(cond).parent = Some(loop_id);
            self.reconstructed[cond_head as usize] = true;

            self.reconstruct_continuation(exit)?;

            if cond_head != head
            {
                let body = self.make_compound(loop_id, head);
                if let NodeKind::Do { body: b, .. } = &mut self.ast.node_mut(loop_id).kind {
                    *b = Some(body);
                }
                self.loops.push(LoopCtx {
                    node: loop_id,
                    body,
                    continue_pc: cond_head,
                    exit_pc: Some(exit),
                });
                self.current_compound = body;
                let result = self.reconstruct_block(head, true);
                self.loops.pop();
                result
            }
            else
            {
                Ok(())
            }
        }
        else
        {
            // do { body } while (true);
            if !back_op.is_goto() {
                fail!("back edge source {} ends in neither branch nor goto", cyclic[0]);
            }
            let body = self.ast.alloc(None, head, NodeKind::Compound { children: vec![] });
            let loop_id = self.attach(head, NodeKind::DoForever { body });
            self.ast.node_mut(body).parent = Some(loop_id);

            self.loops.push(LoopCtx { node: loop_id, body, continue_pc: head, exit_pc: None });
            self.current_compound = body;
            let result = self.reconstruct_block(head, true);
            self.loops.pop();
            result
        }
    }

    fn reconstruct_branch(
        &mut self,
        head: u32,
        outbound: &[u32],
        prev_compound: NodeId,
    ) -> Result<(), DexError>
    {
        if outbound.len() != 2 {
            fail!("branch block {} has {} successors", head, outbound.len());
        }
        let cond = self.ast.alloc(None, head, NodeKind::Basic);
        let branch = self.attach(
            head,
            NodeKind::Branch { invert: false, cond, on_true: None, on_false: None },
        );
        self.ast.node_mut(cond).parent = Some(branch);

        // dominator children that still branch somewhere; joins and
        // terminals sort to the tail (reverse postorder)
        let dominated: Vec<u32> = self.doms.dom_tree()[head as usize]
            .iter()
            .copied()
            .filter(|&v| !self.doms.outbound()[v as usize].is_empty())
            .collect();

        match dominated.len()
        {
            0 =>
            {
                // pure diamond: both arms are continuations
                let on_true = self.make_compound(branch, head);
                self.set_branch_arm(branch, true, on_true);
                self.current_compound = on_true;
                self.reconstruct_continuation(outbound[0])?;

                let on_false = self.make_compound(branch, head);
                self.set_branch_arm(branch, false, on_false);
                self.current_compound = on_false;
                self.reconstruct_continuation(outbound[1])?;
            }
            1 =>
            {
                if dominated[0] != outbound[0] && dominated[0] != outbound[1] {
                    fail!(
                        "branch at {} dominates {} but does not branch to it",
                        head, dominated[0]
                    );
                }
                if let NodeKind::Branch { invert, .. } = &mut self.ast.node_mut(branch).kind {
                    *invert = dominated[0] != outbound[0];
                }
                let on_true = self.make_compound(branch, dominated[0]);
                self.set_branch_arm(branch, true, on_true);
                self.current_compound = on_true;
                self.reconstruct_block(dominated[0], false)?;

                let on_false = self.make_compound(branch, head);
                self.set_branch_arm(branch, false, on_false);
                self.current_compound = on_false;
                self.reconstruct_continuation(outbound[0] + outbound[1] - dominated[0])?;
            }
            2 =>
            {
                let has_else = self.doms.inbound()[dominated[1] as usize]
                    .iter()
                    .all(|&v| !self.doms.is_dominated(v, dominated[0]));
                if has_else
                {
                    let on_true = self.make_compound(branch, outbound[0]);
                    self.set_branch_arm(branch, true, on_true);
                    self.current_compound = on_true;
                    self.reconstruct_block(outbound[0], false)?;

                    let on_false = self.make_compound(branch, outbound[1]);
                    self.set_branch_arm(branch, false, on_false);
                    self.current_compound = on_false;
                    self.reconstruct_block(outbound[1], false)?;
                }
                else
                {
                    // dominated[1] is the join; it follows the branch as a
                    // sibling in the enclosing compound
                    self.current_compound = prev_compound;
                    self.reconstruct_block(dominated[1], false)?;
                    if let NodeKind::Branch { invert, .. } = &mut self.ast.node_mut(branch).kind {
                        *invert = dominated[0] != outbound[0];
                    }
                    let on_true = self.make_compound(branch, dominated[0]);
                    self.set_branch_arm(branch, true, on_true);
                    self.current_compound = on_true;
                    self.reconstruct_block(dominated[0], false)?;
                }
            }
            3 =>
            {
                // outer join first, then both arms
                self.current_compound = prev_compound;
                self.reconstruct_block(dominated[2], false)?;

                let on_true = self.make_compound(branch, outbound[0]);
                self.set_branch_arm(branch, true, on_true);
                self.current_compound = on_true;
                self.reconstruct_block(outbound[0], false)?;

                let on_false = self.make_compound(branch, outbound[1]);
                self.set_branch_arm(branch, false, on_false);
                self.current_compound = on_false;
                self.reconstruct_block(outbound[1], false)?;
            }
            n => fail!("branch at {} dominates {} open blocks", head, n),
        }
        Ok(())
    }

    /// Emits the continuation rooted at `to` into the current compound.
    ///
    /// Loop targets become Break/Continue; a target some enclosing region
    /// owns is parked until that region closes; a target already emitted
    /// is a fall-through into its sibling and produces nothing.
    fn reconstruct_continuation(&mut self, to: u32) -> Result<(), DexError>
    {
        if let Some(l) = self.loops.last()
        {
            // the natural loop-around at the body tail stays implicit
            if l.continue_pc == to && self.current_compound == l.body {
                return Ok(());
            }
        }
        for i in (0..self.loops.len()).rev()
        {
            if self.loops[i].exit_pc == Some(to)
            {
                let target = self.loops[i].node;
                self.attach(to, NodeKind::Break { target });
                return Ok(());
            }
            if self.loops[i].continue_pc == to
            {
                let target = self.loops[i].node;
                self.attach(to, NodeKind::Continue { target });
                return Ok(());
            }
        }
        if self.reconstructed[to as usize] {
            return Ok(());
        }

        match self.owning_region(to)
        {
            Some(owner) if owner + 1 < self.regions.len() =>
            {
                if !self.regions[owner].deferred.contains(&to) {
                    self.regions[owner].deferred.push(to);
                }
                Ok(())
            }
            _ => self.reconstruct_block(to, false),
        }
    }

    // Innermost active region whose head dominates `to`.
    fn owning_region(&self, to: u32) -> Option<usize>
    {
        self.regions
            .iter()
            .rposition(|r| self.doms.is_dominated(to, r.head))
    }

    /// Raw instruction listing with block annotations, one instruction per
    /// line, a blank line between basic blocks.
    pub fn raw_listing(&self) -> Result<String, DexError>
    {
        let mut out = String::new();
        let size = self.code.instr_size();
        let mut pc = 0u32;
        while pc < size
        {
            let offs = self.code.instr_offs() + 2 * pc as usize;
            let op = self.opcode_at(pc)?;
            let sz = op.size(self.dex, offs)?;
            out.push_str(&format!("{}\t{} [{}]", pc, op.dasm(self.dex, offs)?, sz));
            if let Slot::Head(succ) = &self.flow.slots[pc as usize]
            {
                out.push_str(" {");
                for s in succ {
                    out.push_str(&format!(" {}", s));
                }
                out.push_str(" }");
            }
            out.push('\n');
            pc += sz;
            if pc == size || self.flow.is_head(pc) {
                out.push('\n');
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(units: &[u16]) -> DexScanner {
        let mut bytes = vec![];
        for v in [1u16, 0, 0, 0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&(units.len() as u32).to_le_bytes());
        for u in units {
            bytes.extend_from_slice(&u.to_le_bytes());
        }
        DexScanner::new(bytes)
    }

    fn reconstructed(dex: &DexScanner) -> MethodDasm<'_> {
        let mut dasm = MethodDasm::run(dex, 0).unwrap();
        dasm.reconstruct_ast().unwrap();
        dasm
    }

    fn goto(disp: i8) -> u16 {
        0x28 | ((disp as u8 as u16) << 8)
    }

    fn if_eqz(reg: u8, disp: i16) -> [u16; 2] {
        [0x38 | ((reg as u16) << 8), disp as u16]
    }

    const NOP: u16 = 0x0000;
    const RETURN_VOID: u16 = 0x000e;
    const THROW_V0: u16 = 0x0027;

    #[test]
    fn straight_line_method() {
        let dex = method(&[NOP, NOP, RETURN_VOID]);
        let dasm = reconstructed(&dex);
        assert_eq!(dasm.render_ast(), "return (b0)\n");
    }

    #[test]
    fn throw_method() {
        let dex = method(&[NOP, THROW_V0]);
        let dasm = reconstructed(&dex);
        assert_eq!(dasm.render_ast(), "throw (b0)\n");
    }

    #[test]
    fn if_then_else_with_terminal_join() {
        // 0: if-eqz +4 -> 4;  2: nop;  3: goto +3 -> 6;  4: nop;  5: nop;
        // 6: return-void
        let [b0, b1] = if_eqz(0, 4);
        let dex = method(&[b0, b1, NOP, goto(3), NOP, NOP, RETURN_VOID]);
        let dasm = reconstructed(&dex);
        assert_eq!(
            dasm.render_ast(),
            "if (b0) {\n  b4\n} else {\n  b2\n}\nreturn (b6)\n"
        );
    }

    #[test]
    fn if_then_with_live_join() {
        // 0: if-eqz +3 -> 3;  2: nop;  3: nop;  4: goto +1 -> 5;
        // 5: return-void
        let [b0, b1] = if_eqz(0, 3);
        let dex = method(&[b0, b1, NOP, NOP, goto(1), RETURN_VOID]);
        let dasm = reconstructed(&dex);
        assert_eq!(
            dasm.render_ast(),
            "if (!b0) {\n  b2\n}\nb3\nreturn (b5)\n"
        );
    }

    #[test]
    fn while_loop() {
        // 0: if-eqz +4 -> 4 (exit);  2: nop;  3: goto -3 -> 0;
        // 4: return-void
        let [b0, b1] = if_eqz(0, 4);
        let dex = method(&[b0, b1, NOP, goto(-3), RETURN_VOID]);
        let dasm = reconstructed(&dex);
        assert_eq!(
            dasm.render_ast(),
            "while (!b0) {\n  b2\n}\nreturn (b4)\n"
        );
    }

    #[test]
    fn single_block_do_while() {
        // 0: nop;  1: if-nez v0, -1 -> 0;  3: return-void
        let dex = method(&[NOP, 0x0039, -1i16 as u16, RETURN_VOID]);
        let dasm = reconstructed(&dex);
        assert_eq!(dasm.render_ast(), "do {\n} while (b0)\nreturn (b3)\n");
    }

    #[test]
    fn do_while_with_split_body() {
        // a backward branch into the middle of the walked run splits it:
        // 0: nop;  1: nop;  2: if-nez v0, -1 -> 1;  4: return-void
        let dex = method(&[NOP, NOP, 0x0039, -1i16 as u16, RETURN_VOID]);
        let dasm = reconstructed(&dex);
        assert_eq!(
            dasm.render_ast(),
            "b0\ndo {\n} while (b1)\nreturn (b4)\n"
        );
    }

    #[test]
    fn do_while_with_branching_body() {
        // 0: if-eqz +3 -> 3 (skip);  2: nop;  3: if-nez -3 -> 0;
        // 5: return-void
        let [b0, b1] = if_eqz(0, 3);
        let dex = method(&[b0, b1, NOP, 0x0039, -3i16 as u16, RETURN_VOID]);
        let dasm = reconstructed(&dex);
        assert_eq!(
            dasm.render_ast(),
            "do {\n  if (!b0) {\n    b2\n    continue (loop@0)\n  }\n} while (b3)\nreturn (b5)\n"
        );
    }

    #[test]
    fn do_forever() {
        // 0: nop;  1: goto -1 -> 0
        let dex = method(&[NOP, goto(-1)]);
        let dasm = reconstructed(&dex);
        assert_eq!(dasm.render_ast(), "for (;;) {\n  b0\n}\n");
    }

    #[test]
    fn while_loop_with_break_and_continue() {
        // 0: if-eqz v0, +7 -> 7 (exit)
        // 2: if-eqz v1, +3 -> 5 (loop around)
        // 4: goto +3 -> 7 (break)
        // 5: nop;  6: goto -6 -> 0
        // 7: return-void
        let [b0, b1] = if_eqz(0, 7);
        let [b2, b3] = if_eqz(1, 3);
        let dex = method(&[b0, b1, b2, b3, goto(3), NOP, goto(-6), RETURN_VOID]);
        let dasm = reconstructed(&dex);
        assert_eq!(
            dasm.render_ast(),
            "while (!b0) {\n  if (b2) {\n    b5\n    continue (loop@0)\n  } else {\n    break (loop@0)\n  }\n}\nreturn (b7)\n"
        );
    }

    #[test]
    fn every_basic_head_is_a_block_head() {
        let [b0, b1] = if_eqz(0, 7);
        let [b2, b3] = if_eqz(1, 3);
        let dex = method(&[b0, b1, b2, b3, goto(3), NOP, goto(-6), RETURN_VOID]);
        let dasm = reconstructed(&dex);
        for node in dasm.ast().iter() {
            if matches!(node.kind, NodeKind::Basic | NodeKind::Return | NodeKind::Throw) {
                assert!(dasm.flow().is_head(node.head), "head {}", node.head);
            }
        }
    }

    #[test]
    fn raw_listing_annotates_heads() {
        let [b0, b1] = if_eqz(0, 4);
        let dex = method(&[b0, b1, NOP, goto(-3), RETURN_VOID]);
        let dasm = reconstructed(&dex);
        let listing = dasm.raw_listing().unwrap();
        assert!(listing.contains("0\tif-eqz v0, +4 [2] { 4 2 }"));
        assert!(listing.contains("3\tgoto -3 [1]"));
        assert!(listing.contains("4\treturn-void [1] {"));
    }

    #[test]
    fn method_with_unreachable_tail_still_reconstructs() {
        // dead code after return never reaches the tree
        let dex = method(&[RETURN_VOID, NOP, RETURN_VOID]);
        let dasm = reconstructed(&dex);
        assert_eq!(dasm.render_ast(), "return (b0)\n");
    }
}
