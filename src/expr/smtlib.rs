//! SMT-LIB v2 export of path conditions over 256-bit vectors.
//!
//! Every shared node is emitted once as a `define-fun`, which keeps the
//! script linear in the size of the expression graph. EVM corner cases that
//! bit-vector theory defines differently (division by zero, comparisons
//! yielding words) are spelled out with `ite`. Keccak and symbolic
//! exponentiation become uninterpreted functions.

use super::{BinaryOp, Expr, ExprId, NodeKind, TernaryOp, UnaryOp};
use crate::word::U256;
use std::{
    collections::{BTreeSet, HashSet},
    fmt::{self, Write},
};

const SORT: &str = "(_ BitVec 256)";
const ZERO: &str = "(_ bv0 256)";
const ONE: &str = "(_ bv1 256)";

#[derive(Clone, Debug, Default)]
pub struct Script {
    inputs: Vec<String>,
    functions: BTreeSet<String>,
    definitions: Vec<String>,
    assertions: Vec<String>,
}

impl Script {
    /// Builds the script asserting that every constraint is non-zero.
    pub fn new(constraints: &[Expr]) -> Self {
        let mut script = Script::default();
        let mut emitted = HashSet::new();

        for constraint in constraints {
            script.emit(constraint, &mut emitted);
            script
                .assertions
                .push(format!("(assert (not (= {} {})))", name(constraint), ZERO));
        }

        script
    }

    /// Names of the declared inputs, in declaration order.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn emit(&mut self, expr: &Expr, emitted: &mut HashSet<ExprId>) {
        if !emitted.insert(expr.id()) {
            return;
        }

        for child in expr.children() {
            self.emit(child, emitted);
        }

        let body = match expr.kind() {
            NodeKind::Constant(_) => return,
            NodeKind::Input(input) => {
                self.inputs.push(input.to_string());
                return;
            }
            NodeKind::Unary(op, x) => unary(*op, &name(x)),
            NodeKind::Binary(BinaryOp::Exp, base, exponent) => {
                match exponent.as_constant() {
                    Some(e) => self.power(expr.id(), &name(base), e),
                    None => {
                        self.functions.insert(format!(
                            "(declare-fun evm_exp ({} {}) {})",
                            SORT, SORT, SORT
                        ));
                        format!("(evm_exp {} {})", name(base), name(exponent))
                    }
                }
            }
            NodeKind::Binary(BinaryOp::SignExtend, b, x) => match b.as_constant() {
                Some(b) if b < U256::from(31_u64) => {
                    let bits = (b.as_u32() + 1) * 8;
                    format!(
                        "((_ sign_extend {}) ((_ extract {} 0) {}))",
                        256 - bits,
                        bits - 1,
                        name(x)
                    )
                }
                Some(_) => name(x),
                None => {
                    self.functions.insert(format!(
                        "(declare-fun evm_signextend ({} {}) {})",
                        SORT, SORT, SORT
                    ));
                    format!("(evm_signextend {} {})", name(b), name(x))
                }
            },
            NodeKind::Binary(op, lhs, rhs) => binary(*op, &name(lhs), &name(rhs)),
            NodeKind::Ternary(op, a, b, n) => ternary(*op, &name(a), &name(b), &name(n)),
            NodeKind::Keccak { length, parts } => {
                let function = format!("keccak_{}_{}", length, parts.len());
                let sorts = vec![SORT; parts.len()].join(" ");

                self.functions
                    .insert(format!("(declare-fun {} ({}) {})", function, sorts, SORT));

                let args = parts.iter().map(name).collect::<Vec<_>>().join(" ");

                format!("({} {})", function, args)
            }
        };

        self.definitions
            .push(format!("(define-fun {} () {} {})", name(expr), SORT, body));
    }

    fn power(&mut self, id: ExprId, base: &str, exponent: U256) -> String {
        if exponent == U256::ZERO {
            return ONE.to_string();
        }

        let bits = 256 - exponent.leading_zeros();
        let mut square = base.to_string();
        let mut factors = Vec::new();

        for bit in 0..bits {
            if bit > 0 {
                let next = format!("e{}_sq{}", id, bit);
                self.definitions.push(format!(
                    "(define-fun {} () {} (bvmul {} {}))",
                    next, SORT, square, square
                ));
                square = next;
            }
            if (exponent >> bit) & U256::ONE == U256::ONE {
                factors.push(square.clone());
            }
        }

        factors
            .into_iter()
            .reduce(|acc, f| format!("(bvmul {} {})", acc, f))
            .unwrap_or_else(|| ONE.to_string())
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "(set-logic QF_UFBV)")?;
        for input in &self.inputs {
            writeln!(f, "(declare-fun |{}| () {})", input, SORT)?;
        }
        for function in &self.functions {
            writeln!(f, "{}", function)?;
        }
        for definition in &self.definitions {
            writeln!(f, "{}", definition)?;
        }
        for assertion in &self.assertions {
            writeln!(f, "{}", assertion)?;
        }
        Ok(())
    }
}

fn name(expr: &Expr) -> String {
    match expr.kind() {
        NodeKind::Input(input) => format!("|{}|", input),
        NodeKind::Constant(c) => literal(*c),
        _ => format!("e{}", expr.id()),
    }
}

fn literal(value: U256) -> String {
    let mut s = String::with_capacity(66);
    let _ = write!(s, "#x{}", hex::encode(value.to_be_bytes()));
    s
}

fn boolean(condition: String) -> String {
    format!("(ite {} {} {})", condition, ONE, ZERO)
}

fn unary(op: UnaryOp, x: &str) -> String {
    match op {
        UnaryOp::IsZero => boolean(format!("(= {} {})", x, ZERO)),
        UnaryOp::Not => format!("(bvnot {})", x),
    }
}

fn guarded(divisor: &str, term: String) -> String {
    format!("(ite (= {} {}) {} {})", divisor, ZERO, ZERO, term)
}

fn binary(op: BinaryOp, a: &str, b: &str) -> String {
    match op {
        BinaryOp::Add => format!("(bvadd {} {})", a, b),
        BinaryOp::Sub => format!("(bvsub {} {})", a, b),
        BinaryOp::Mul => format!("(bvmul {} {})", a, b),
        BinaryOp::Div => guarded(b, format!("(bvudiv {} {})", a, b)),
        BinaryOp::SDiv => guarded(b, format!("(bvsdiv {} {})", a, b)),
        BinaryOp::Mod => guarded(b, format!("(bvurem {} {})", a, b)),
        BinaryOp::SMod => guarded(b, format!("(bvsrem {} {})", a, b)),
        BinaryOp::Lt => boolean(format!("(bvult {} {})", a, b)),
        BinaryOp::Gt => boolean(format!("(bvugt {} {})", a, b)),
        BinaryOp::SLt => boolean(format!("(bvslt {} {})", a, b)),
        BinaryOp::SGt => boolean(format!("(bvsgt {} {})", a, b)),
        BinaryOp::Eq => boolean(format!("(= {} {})", a, b)),
        BinaryOp::And => format!("(bvand {} {})", a, b),
        BinaryOp::Or => format!("(bvor {} {})", a, b),
        BinaryOp::Xor => format!("(bvxor {} {})", a, b),
        BinaryOp::Byte => format!(
            "(ite (bvult {i} (_ bv32 256)) (bvand (bvlshr {x} (bvmul (bvsub (_ bv31 256) {i}) (_ bv8 256))) (_ bv255 256)) {zero})",
            i = a,
            x = b,
            zero = ZERO
        ),
        BinaryOp::Shl => format!("(bvshl {} {})", b, a),
        BinaryOp::Shr => format!("(bvlshr {} {})", b, a),
        BinaryOp::Sar => format!("(bvashr {} {})", b, a),
        BinaryOp::Exp | BinaryOp::SignExtend => unreachable!("handled by the caller"),
    }
}

fn ternary(op: TernaryOp, a: &str, b: &str, n: &str) -> String {
    let wide = |x: &str| format!("((_ zero_extend 256) {})", x);
    let combined = match op {
        TernaryOp::AddMod => format!("(bvadd {} {})", wide(a), wide(b)),
        TernaryOp::MulMod => format!("(bvmul {} {})", wide(a), wide(b)),
        TernaryOp::Ite => return format!("(ite (= {} {}) {} {})", a, ZERO, n, b),
    };

    guarded(
        n,
        format!("((_ extract 255 0) (bvurem {} {}))", combined, wide(n)),
    )
}
