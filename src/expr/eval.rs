use super::{Expr, ExprId, NodeKind};
use crate::word::{Word, U256, WORD_BYTES};
use sha3::{Digest, Keccak256};
use std::collections::{BTreeMap, HashMap};

/// Assignment of concrete values to named inputs.
pub type Model = BTreeMap<String, U256>;

pub fn keccak256(bytes: &[u8]) -> U256 {
    let digest = Keccak256::digest(bytes);
    let mut buffer = [0_u8; 32];

    buffer.copy_from_slice(&digest);

    U256::from_be_bytes(buffer)
}

fn hash_words(length: u64, words: impl Iterator<Item = U256>) -> U256 {
    let mut bytes = words.flat_map(|w| w.to_be_bytes()).collect::<Vec<_>>();

    bytes.resize(length as usize, 0);

    keccak256(&bytes)
}

/// Hash of the concatenated parts, if every part is concrete.
pub fn concrete_keccak(length: u64, parts: &[Word]) -> Option<U256> {
    let words = parts.iter().map(Word::as_concrete).collect::<Option<Vec<_>>>()?;

    if length as usize > words.len() * WORD_BYTES {
        return None;
    }

    Some(hash_words(length, words.into_iter()))
}

/// Evaluates expressions under a fixed model, sharing work between all
/// expressions evaluated through the same instance. Inputs missing from the
/// model evaluate to zero.
pub struct Evaluator<'a> {
    model: &'a Model,
    cache: HashMap<ExprId, U256>,
}

impl<'a> Evaluator<'a> {
    pub fn new(model: &'a Model) -> Self {
        Self {
            model,
            cache: HashMap::new(),
        }
    }

    pub fn eval(&mut self, expr: &Expr) -> U256 {
        if let Some(v) = self.cache.get(&expr.id()) {
            return *v;
        }

        let value = match expr.kind() {
            NodeKind::Constant(c) => *c,
            NodeKind::Input(name) => self.model.get(&**name).copied().unwrap_or(U256::ZERO),
            NodeKind::Unary(op, x) => {
                let x = self.eval(x);
                op.apply(x)
            }
            NodeKind::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs);
                let rhs = self.eval(rhs);
                op.apply(lhs, rhs)
            }
            NodeKind::Ternary(op, a, b, n) => {
                let a = self.eval(a);
                let b = self.eval(b);
                let n = self.eval(n);
                op.apply(a, b, n)
            }
            NodeKind::Keccak { length, parts } => {
                let words = parts.iter().map(|p| self.eval(p)).collect::<Vec<_>>();
                hash_words(*length, words.into_iter())
            }
        };

        self.cache.insert(expr.id(), value);

        value
    }

    /// `true` if every constraint evaluates to a non-zero word.
    pub fn satisfies(&mut self, constraints: &[Expr]) -> bool {
        constraints.iter().all(|c| self.eval(c) != U256::ZERO)
    }
}

pub fn evaluate(expr: &Expr, model: &Model) -> U256 {
    Evaluator::new(model).eval(expr)
}
