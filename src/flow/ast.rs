//! The structured tree the reconstructor produces.
//!
//! Nodes live in an index arena owned by the per-method run. `Compound`
//! child lists are the only ownership edges; `parent` and the Break/
//! Continue `target` are back-references by id and never extend lifetime.

/// Handle into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(u32);

/// The closed set of block shapes.
#[derive(Debug)]
pub enum NodeKind
{
    /// Straight-line run of instructions, identified by its block head.
    Basic,
    /// Ordered sequence of child nodes.
    Compound { children: Vec<NodeId> },
    /// Two-way conditional. `cond` is the Basic holding the test; an arm
    /// is `None` until (or unless) construction fills it.
    Branch { invert: bool, cond: NodeId, on_true: Option<NodeId>, on_false: Option<NodeId> },
    /// Reserved for switch reconstruction; never built by this crate.
    Switch,
    DoForever { body: NodeId },
    While { invert: bool, cond: NodeId, body: Option<NodeId> },
    /// Post-tested loop; `body` is `None` when the condition block is the
    /// whole loop.
    Do { invert: bool, cond: NodeId, body: Option<NodeId> },
    Break { target: NodeId },
    Continue { target: NodeId },
    Return,
    Throw,
}

#[derive(Debug)]
pub struct AstNode
{
    pub parent: Option<NodeId>,
    /// Block head this node was synthesized for.
    pub head: u32,
    pub kind: NodeKind,
}

/// Arena of AST nodes for one method.
#[derive(Debug, Default)]
pub struct Ast
{
    nodes: Vec<AstNode>,
}

impl Ast
{
    pub fn new() -> Ast
    {
        Ast { nodes: vec![] }
    }

    pub fn alloc(&mut self, parent: Option<NodeId>, head: u32, kind: NodeKind) -> NodeId
    {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(AstNode { parent, head, kind });
        id
    }

    pub fn node(&self, id: NodeId) -> &AstNode
    {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut AstNode
    {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize
    {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AstNode>
    {
        self.nodes.iter()
    }

    pub fn push_child(&mut self, compound: NodeId, child: NodeId)
    {
        match &mut self.node_mut(compound).kind
        {
            NodeKind::Compound { children } => children.push(child),
            other => panic!("push_child on non-compound node: {:?}", other),
        }
    }

    pub fn children(&self, compound: NodeId) -> &[NodeId]
    {
        match &self.node(compound).kind
        {
            NodeKind::Compound { children } => children,
            _ => &[],
        }
    }

    /// Indented one-node-per-line rendering; loops and conditionals print
    /// with their block-head pc so the listing can be read next to the raw
    /// disassembly.
    pub fn render(&self, id: NodeId) -> String
    {
        let mut out = String::new();
        self.render_into(id, 0, &mut out);
        out
    }

    fn render_into(&self, id: NodeId, indent: usize, out: &mut String)
    {
        let node = self.node(id);
        let pad = "  ".repeat(indent);
        match &node.kind
        {
            NodeKind::Basic => out.push_str(&format!("{}b{}\n", pad, node.head)),
            NodeKind::Return => out.push_str(&format!("{}return (b{})\n", pad, node.head)),
            NodeKind::Throw => out.push_str(&format!("{}throw (b{})\n", pad, node.head)),
            NodeKind::Break { target } =>
                out.push_str(&format!("{}break (loop@{})\n", pad, self.node(*target).head)),
            NodeKind::Continue { target } =>
                out.push_str(&format!("{}continue (loop@{})\n", pad, self.node(*target).head)),
            NodeKind::Switch => out.push_str(&format!("{}switch (b{})\n", pad, node.head)),
            NodeKind::Compound { children } =>
            {
                for &c in children {
                    self.render_into(c, indent, out);
                }
            }
            NodeKind::Branch { invert, cond, on_true, on_false } =>
            {
                let bang = if *invert { "!" } else { "" };
                out.push_str(&format!("{}if ({}b{}) {{\n", pad, bang, self.node(*cond).head));
                if let Some(t) = on_true {
                    self.render_into(*t, indent + 1, out);
                }
                match on_false
                {
                    Some(f) if !self.children(*f).is_empty() =>
                    {
                        out.push_str(&format!("{}}} else {{\n", pad));
                        self.render_into(*f, indent + 1, out);
                    }
                    _ => {}
                }
                out.push_str(&format!("{}}}\n", pad));
            }
            NodeKind::While { invert, cond, body } =>
            {
                let bang = if *invert { "!" } else { "" };
                out.push_str(&format!("{}while ({}b{}) {{\n", pad, bang, self.node(*cond).head));
                if let Some(b) = body {
                    self.render_into(*b, indent + 1, out);
                }
                out.push_str(&format!("{}}}\n", pad));
            }
            NodeKind::Do { invert, cond, body } =>
            {
                out.push_str(&format!("{}do {{\n", pad));
                if let Some(b) = body {
                    self.render_into(*b, indent + 1, out);
                }
                let bang = if *invert { "!" } else { "" };
                out.push_str(&format!("{}}} while ({}b{})\n", pad, bang, self.node(*cond).head));
            }
            NodeKind::DoForever { body } =>
            {
                out.push_str(&format!("{}for (;;) {{\n", pad));
                self.render_into(*body, indent + 1, out);
                out.push_str(&format!("{}}}\n", pad));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_links_are_back_references() {
        let mut ast = Ast::new();
        let root = ast.alloc(None, 0, NodeKind::Compound { children: vec![] });
        let basic = ast.alloc(Some(root), 0, NodeKind::Basic);
        ast.push_child(root, basic);

        assert_eq!(ast.node(basic).parent, Some(root));
        assert_eq!(ast.children(root), &[basic]);
        assert_eq!(ast.len(), 2);
    }

    #[test]
    fn render_nests_by_ownership() {
        let mut ast = Ast::new();
        let root = ast.alloc(None, 0, NodeKind::Compound { children: vec![] });
        let cond = ast.alloc(None, 0, NodeKind::Basic);
        let body = ast.alloc(None, 1, NodeKind::Compound { children: vec![] });
        let inner = ast.alloc(Some(body), 1, NodeKind::Basic);
        ast.push_child(body, inner);
        let lp = ast.alloc(Some(root), 0, NodeKind::While { invert: false, cond, body: Some(body) });
        ast.push_child(root, lp);

        assert_eq!(ast.render(root), "while (b0) {\n  b1\n}\n");
    }
}
