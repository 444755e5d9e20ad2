//! Hash-consed expression graph over 256-bit words.
//!
//! Nodes are immutable once published and shared by reference between all
//! execution states that derive from a common ancestor. The [`ExprBuilder`]
//! interns nodes on `(kind, child ids)`, so structurally identical
//! sub-expressions always resolve to the same node and the same [`ExprId`].

mod eval;
mod simplify;
pub mod smtlib;

pub use eval::*;

use crate::word::{self, Word, U256};
use log::trace;
use std::{
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};
use strum::{Display, IntoStaticStr};

pub type ExprId = u64;
pub type Expr = Arc<Node>;

#[derive(Clone, Copy, Debug, Display, IntoStaticStr, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[strum(serialize_all = "lowercase")]
pub enum UnaryOp {
    IsZero,
    Not,
}

/// Binary operators. The left operand is the value that was on top of the
/// stack, which for shifts is the shift amount.
#[derive(Clone, Copy, Debug, Display, IntoStaticStr, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[strum(serialize_all = "lowercase")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    SDiv,
    Mod,
    SMod,
    Exp,
    SignExtend,
    Lt,
    Gt,
    SLt,
    SGt,
    Eq,
    And,
    Or,
    Xor,
    Byte,
    Shl,
    Shr,
    Sar,
}

#[derive(Clone, Copy, Debug, Display, IntoStaticStr, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[strum(serialize_all = "lowercase")]
pub enum TernaryOp {
    AddMod,
    MulMod,
    /// `ite c t e`: `t` when `c` is non-zero, `e` otherwise.
    Ite,
}

impl UnaryOp {
    pub fn apply(self, x: U256) -> U256 {
        match self {
            UnaryOp::IsZero => word::iszero(x),
            UnaryOp::Not => word::not(x),
        }
    }
}

impl BinaryOp {
    pub fn apply(self, lhs: U256, rhs: U256) -> U256 {
        match self {
            BinaryOp::Add => word::add(lhs, rhs),
            BinaryOp::Sub => word::sub(lhs, rhs),
            BinaryOp::Mul => word::mul(lhs, rhs),
            BinaryOp::Div => word::div(lhs, rhs),
            BinaryOp::SDiv => word::sdiv(lhs, rhs),
            BinaryOp::Mod => word::rem(lhs, rhs),
            BinaryOp::SMod => word::smod(lhs, rhs),
            BinaryOp::Exp => word::exp(lhs, rhs),
            BinaryOp::SignExtend => word::signextend(lhs, rhs),
            BinaryOp::Lt => word::lt(lhs, rhs),
            BinaryOp::Gt => word::gt(lhs, rhs),
            BinaryOp::SLt => word::slt(lhs, rhs),
            BinaryOp::SGt => word::sgt(lhs, rhs),
            BinaryOp::Eq => word::eq(lhs, rhs),
            BinaryOp::And => word::and(lhs, rhs),
            BinaryOp::Or => word::or(lhs, rhs),
            BinaryOp::Xor => word::xor(lhs, rhs),
            BinaryOp::Byte => word::byte(lhs, rhs),
            BinaryOp::Shl => word::shl(lhs, rhs),
            BinaryOp::Shr => word::shr(lhs, rhs),
            BinaryOp::Sar => word::sar(lhs, rhs),
        }
    }

    /// Operators whose result is always `0` or `1`.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::SLt | BinaryOp::SGt | BinaryOp::Eq
        )
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Mul
                | BinaryOp::Eq
                | BinaryOp::And
                | BinaryOp::Or
                | BinaryOp::Xor
        )
    }
}

impl TernaryOp {
    pub fn apply(self, a: U256, b: U256, n: U256) -> U256 {
        match self {
            TernaryOp::AddMod => word::addmod(a, b, n),
            TernaryOp::MulMod => word::mulmod(a, b, n),
            TernaryOp::Ite if a != U256::ZERO => b,
            TernaryOp::Ite => n,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Constant(U256),
    Input(Arc<str>),
    Unary(UnaryOp, Expr),
    Binary(BinaryOp, Expr, Expr),
    Ternary(TernaryOp, Expr, Expr, Expr),
    /// keccak-256 over the first `length` bytes of the concatenated parts
    Keccak { length: u64, parts: Vec<Expr> },
}

#[derive(Debug)]
pub struct Node {
    id: ExprId,
    kind: NodeKind,
}

impl Node {
    pub fn id(&self) -> ExprId {
        self.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn as_constant(&self) -> Option<U256> {
        match self.kind {
            NodeKind::Constant(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_input(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Input(name) => Some(name),
            _ => None,
        }
    }

    /// Returns `true` if the node only ever evaluates to `0` or `1`.
    pub fn is_boolean(&self) -> bool {
        match &self.kind {
            NodeKind::Constant(c) => *c <= U256::ONE,
            NodeKind::Unary(UnaryOp::IsZero, _) => true,
            NodeKind::Binary(op, _, _) if op.is_comparison() => true,
            NodeKind::Binary(BinaryOp::And, lhs, rhs) => lhs.is_boolean() || rhs.is_boolean(),
            NodeKind::Binary(BinaryOp::Or, lhs, rhs) => lhs.is_boolean() && rhs.is_boolean(),
            NodeKind::Ternary(TernaryOp::Ite, _, t, e) => t.is_boolean() && e.is_boolean(),
            _ => false,
        }
    }

    pub fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            NodeKind::Constant(_) | NodeKind::Input(_) => vec![],
            NodeKind::Unary(_, x) => vec![x],
            NodeKind::Binary(_, lhs, rhs) => vec![lhs, rhs],
            NodeKind::Ternary(_, a, b, n) => vec![a, b, n],
            NodeKind::Keccak { parts, .. } => parts.iter().collect(),
        }
    }

    /// Names of all inputs this expression depends on, in first-seen order.
    pub fn inputs(&self) -> Vec<Arc<str>> {
        let mut seen = std::collections::HashSet::new();
        let mut names = Vec::new();
        let mut stack = vec![self];

        while let Some(node) = stack.pop() {
            if !seen.insert(node.id) {
                continue;
            }
            if let NodeKind::Input(name) = &node.kind {
                names.push(name.clone());
            }
            stack.extend(node.children().into_iter().rev().map(|c| c.as_ref()));
        }

        names
    }
}

// interned nodes are identified by their id alone
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            NodeKind::Constant(c) if *c <= U256::from(u64::MAX) => write!(f, "{}", c),
            NodeKind::Constant(c) => write!(f, "{:#x}", c),
            NodeKind::Input(name) => write!(f, "{}", name),
            NodeKind::Unary(op, x) => write!(f, "({} {})", op, x),
            NodeKind::Binary(op, lhs, rhs) => write!(f, "({} {} {})", op, lhs, rhs),
            NodeKind::Ternary(op, a, b, n) => write!(f, "({} {} {} {})", op, a, b, n),
            NodeKind::Keccak { length, parts } => {
                write!(f, "(keccak256 {}", length)?;
                parts.iter().try_for_each(|p| write!(f, " {}", p))?;
                write!(f, ")")
            }
        }
    }
}

/// Interning factory for expression nodes and the symbolic side of all word
/// arithmetic.
#[derive(Debug, Default)]
pub struct ExprBuilder {
    nodes: HashMap<NodeKind, Expr>,
    next_id: ExprId,
}

impl ExprBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct nodes interned so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn intern(&mut self, kind: NodeKind) -> Expr {
        if let Some(node) = self.nodes.get(&kind) {
            return node.clone();
        }

        let node = Arc::new(Node {
            id: self.next_id,
            kind: kind.clone(),
        });

        self.next_id += 1;

        trace!("new node: e{} := {}", node.id, node);

        self.nodes.insert(kind, node.clone());

        node
    }

    pub fn constant(&mut self, value: U256) -> Expr {
        self.intern(NodeKind::Constant(value))
    }

    pub fn input(&mut self, name: &str) -> Expr {
        self.intern(NodeKind::Input(Arc::from(name)))
    }

    pub fn lift(&mut self, w: &Word) -> Expr {
        match w {
            Word::Concrete(c) => self.constant(*c),
            Word::Symbolic(e) => e.clone(),
        }
    }

    pub fn unary(&mut self, op: UnaryOp, x: &Word) -> Word {
        if let Word::Concrete(c) = x {
            return Word::Concrete(op.apply(*c));
        }

        if let Some(simplified) = self.simplify_unary(op, x) {
            return simplified;
        }

        let x = self.lift(x);

        Word::from(self.intern(NodeKind::Unary(op, x)))
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: &Word, rhs: &Word) -> Word {
        if let (Word::Concrete(l), Word::Concrete(r)) = (lhs, rhs) {
            return Word::Concrete(op.apply(*l, *r));
        }

        if let Some(simplified) = self.simplify_binary(op, lhs, rhs) {
            return simplified;
        }

        let (mut l, mut r) = (self.lift(lhs), self.lift(rhs));

        // canonical operand order, so `a + b` and `b + a` share one node
        if op.is_commutative() && l.id > r.id {
            std::mem::swap(&mut l, &mut r);
        }

        Word::from(self.intern(NodeKind::Binary(op, l, r)))
    }

    pub fn ternary(&mut self, op: TernaryOp, a: &Word, b: &Word, n: &Word) -> Word {
        if op == TernaryOp::Ite {
            return self.ite(a, b, n);
        }

        match (a, b, n) {
            (Word::Concrete(a), Word::Concrete(b), Word::Concrete(n)) => {
                Word::Concrete(op.apply(*a, *b, *n))
            }
            (_, _, Word::Concrete(n)) if *n == U256::ZERO => Word::zero(),
            _ => {
                let (a, b, n) = (self.lift(a), self.lift(b), self.lift(n));

                Word::from(self.intern(NodeKind::Ternary(op, a, b, n)))
            }
        }
    }

    /// Selects `then` when `condition` is non-zero and `otherwise` when it is
    /// zero.
    pub fn ite(&mut self, condition: &Word, then: &Word, otherwise: &Word) -> Word {
        if let Word::Concrete(c) = condition {
            return if *c != U256::ZERO { then.clone() } else { otherwise.clone() };
        }
        if then == otherwise {
            return then.clone();
        }

        let c = self.lift(condition);

        match (then.as_concrete(), otherwise.as_concrete()) {
            (Some(t), Some(e)) if c.is_boolean() && t == U256::ONE && e == U256::ZERO => {
                return Word::from(c);
            }
            (Some(t), Some(e)) if c.is_boolean() && t == U256::ZERO && e == U256::ONE => {
                return self.iszero(condition);
            }
            _ => {}
        }

        let (t, e) = (self.lift(then), self.lift(otherwise));

        Word::from(self.intern(NodeKind::Ternary(TernaryOp::Ite, c, t, e)))
    }

    /// Hash over `length` bytes formed by the big-endian concatenation of
    /// `parts`. Callers only reach here with at least one symbolic part.
    pub fn keccak(&mut self, length: u64, parts: &[Word]) -> Word {
        let parts = parts.iter().map(|p| self.lift(p)).collect();

        Word::from(self.intern(NodeKind::Keccak { length, parts }))
    }

    pub fn add(&mut self, lhs: &Word, rhs: &Word) -> Word {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: &Word, rhs: &Word) -> Word {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: &Word, rhs: &Word) -> Word {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: &Word, rhs: &Word) -> Word {
        self.binary(BinaryOp::Div, lhs, rhs)
    }

    pub fn rem(&mut self, lhs: &Word, rhs: &Word) -> Word {
        self.binary(BinaryOp::Mod, lhs, rhs)
    }

    pub fn lt(&mut self, lhs: &Word, rhs: &Word) -> Word {
        self.binary(BinaryOp::Lt, lhs, rhs)
    }

    pub fn gt(&mut self, lhs: &Word, rhs: &Word) -> Word {
        self.binary(BinaryOp::Gt, lhs, rhs)
    }

    pub fn eq(&mut self, lhs: &Word, rhs: &Word) -> Word {
        self.binary(BinaryOp::Eq, lhs, rhs)
    }

    pub fn and(&mut self, lhs: &Word, rhs: &Word) -> Word {
        self.binary(BinaryOp::And, lhs, rhs)
    }

    pub fn or(&mut self, lhs: &Word, rhs: &Word) -> Word {
        self.binary(BinaryOp::Or, lhs, rhs)
    }

    pub fn not(&mut self, x: &Word) -> Word {
        self.unary(UnaryOp::Not, x)
    }

    pub fn iszero(&mut self, x: &Word) -> Word {
        self.unary(UnaryOp::IsZero, x)
    }

    /// Rebuilds `expr` bottom-up through the simplifying constructors.
    pub fn simplify(&mut self, expr: &Expr) -> Word {
        let mut done = HashMap::new();

        self.rebuild(expr, &mut done)
    }

    fn rebuild(&mut self, expr: &Expr, done: &mut HashMap<ExprId, Word>) -> Word {
        if let Some(w) = done.get(&expr.id) {
            return w.clone();
        }

        let result = match &expr.kind {
            NodeKind::Constant(c) => Word::Concrete(*c),
            NodeKind::Input(_) => Word::Symbolic(expr.clone()),
            NodeKind::Unary(op, x) => {
                let x = self.rebuild(x, done);
                self.unary(*op, &x)
            }
            NodeKind::Binary(op, l, r) => {
                let (l, r) = (self.rebuild(l, done), self.rebuild(r, done));
                self.binary(*op, &l, &r)
            }
            NodeKind::Ternary(op, a, b, n) => {
                let a = self.rebuild(a, done);
                let b = self.rebuild(b, done);
                let n = self.rebuild(n, done);
                self.ternary(*op, &a, &b, &n)
            }
            NodeKind::Keccak { length, parts } => {
                let parts = parts
                    .iter()
                    .map(|p| self.rebuild(p, done))
                    .collect::<Vec<_>>();

                match concrete_keccak(*length, &parts) {
                    Some(hash) => Word::Concrete(hash),
                    None => self.keccak(*length, &parts),
                }
            }
        };

        done.insert(expr.id, result.clone());

        result
    }
}
