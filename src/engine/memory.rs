//! Byte-addressable memory, persistent storage and the world state.
//!
//! All containers are copy-on-write: forked states share the underlying maps
//! until one of them writes.

use crate::{
    disassemble::Program,
    expr::{BinaryOp, Expr, ExprBuilder, ExprId},
    word::{self, Word, U256, WORD_BYTES},
};
use std::{collections::BTreeMap, sync::Arc};

/// A single byte, either concrete or the `index`-th big-endian byte of a
/// symbolic word.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cell {
    Concrete(u8),
    Symbolic { word: Expr, index: u8 },
}

impl Cell {
    pub fn as_concrete(&self) -> Option<u8> {
        match self {
            Cell::Concrete(b) => Some(*b),
            Cell::Symbolic { .. } => None,
        }
    }
}

static ZERO: Cell = Cell::Concrete(0);

pub fn cells_of(w: &Word) -> Vec<Cell> {
    match w {
        Word::Concrete(c) => c.to_be_bytes().iter().map(|b| Cell::Concrete(*b)).collect(),
        Word::Symbolic(e) => (0..WORD_BYTES as u8)
            .map(|index| Cell::Symbolic {
                word: e.clone(),
                index,
            })
            .collect(),
    }
}

/// Sparse byte map. Unmapped offsets read as zero.
#[derive(Clone, Debug, Default)]
pub struct ByteMap {
    cells: Arc<BTreeMap<u64, Cell>>,
    len: u64,
}

impl ByteMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_cells(bytes.iter().map(|b| Cell::Concrete(*b)).collect())
    }

    pub fn from_cells(cells: Vec<Cell>) -> Self {
        let len = cells.len() as u64;

        Self {
            cells: Arc::new((0..).zip(cells).collect()),
            len,
        }
    }

    /// Highest accessed offset (exclusive). For memory this is always a
    /// multiple of the word size.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grows the active size to cover `offset..offset + size`, rounded up to
    /// whole words.
    pub fn expand(&mut self, offset: u64, size: u64) {
        if size > 0 {
            let end = offset.saturating_add(size);
            let words = end / 32 + u64::from(end % 32 != 0);

            self.len = self.len.max(words.saturating_mul(32));
        }
    }

    pub fn cell(&self, offset: u64) -> &Cell {
        self.cells.get(&offset).unwrap_or(&ZERO)
    }

    pub fn read_range(&self, offset: u64, size: u64) -> Vec<Cell> {
        (0..size)
            .map(|i| self.cell(offset.saturating_add(i)).clone())
            .collect()
    }

    pub fn write_cells(&mut self, offset: u64, cells: Vec<Cell>) {
        if cells.is_empty() {
            return;
        }

        let map = Arc::make_mut(&mut self.cells);

        for (i, cell) in (0..).zip(cells) {
            map.insert(offset + i, cell);
        }
    }

    pub fn write_word(&mut self, offset: u64, value: &Word) {
        self.write_cells(offset, cells_of(value));
    }

    /// Stores the least significant byte of `value`.
    pub fn write_byte(&mut self, offset: u64, value: &Word) {
        let cell = match value {
            Word::Concrete(c) => Cell::Concrete(c.to_be_bytes()[31]),
            Word::Symbolic(e) => Cell::Symbolic {
                word: e.clone(),
                index: 31,
            },
        };

        self.write_cells(offset, vec![cell]);
    }

    /// Concrete contents of a range, or `None` if any byte is symbolic.
    pub fn concrete_bytes(&self, offset: u64, size: u64) -> Option<Vec<u8>> {
        (0..size)
            .map(|i| self.cell(offset.saturating_add(i)).as_concrete())
            .collect()
    }

    /// Reads a big-endian word starting at `offset`.
    pub fn read_word(&self, offset: u64, builder: &mut ExprBuilder) -> Word {
        let cells = self.read_range(offset, WORD_BYTES as u64);

        assemble_word(&cells, builder)
    }

    /// Splits a range into words for hashing, zero padding the last one.
    pub fn words(&self, offset: u64, size: u64, builder: &mut ExprBuilder) -> Vec<Word> {
        let mut cells = self.read_range(offset, size);
        let padded = (cells.len() + WORD_BYTES - 1) / WORD_BYTES * WORD_BYTES;

        cells.resize(padded, ZERO.clone());

        cells
            .chunks(WORD_BYTES)
            .map(|chunk| assemble_word(chunk, builder))
            .collect()
    }
}

/// Joins 32 cells into a word. Runs of bytes taken from the same symbolic
/// word at a constant displacement become one shifted (and, if needed,
/// masked) term.
pub fn assemble_word(cells: &[Cell], builder: &mut ExprBuilder) -> Word {
    debug_assert_eq!(cells.len(), WORD_BYTES);

    let mut concrete = [0_u8; WORD_BYTES];
    let mut runs: Vec<(Expr, i64, usize, usize)> = Vec::new();

    for (position, cell) in cells.iter().enumerate() {
        match cell {
            Cell::Concrete(b) => concrete[position] = *b,
            Cell::Symbolic { word, index } => {
                let displacement = i64::from(*index) - position as i64;

                match runs.last_mut() {
                    Some((w, d, _, last))
                        if w == word && *d == displacement && *last + 1 == position =>
                    {
                        *last = position
                    }
                    _ => runs.push((word.clone(), displacement, position, position)),
                }
            }
        }
    }

    let concrete = U256::from_be_bytes(concrete);

    if let [(word, 0, 0, 31)] = runs.as_slice() {
        return Word::Symbolic(word.clone());
    }

    let mut result = Word::Concrete(concrete);

    for (expr, displacement, first, last) in runs {
        let source = Word::from(expr);

        // byte `k` of the source lands at position `k - displacement`
        let (shifted, covered) = if displacement >= 0 {
            let shift = Word::from(8 * displacement as u64);
            let shifted = builder.binary(BinaryOp::Shl, &shift, &source);
            (shifted, (0, 31 - displacement as usize))
        } else {
            let shift = Word::from(8 * displacement.unsigned_abs());
            let shifted = builder.binary(BinaryOp::Shr, &shift, &source);
            (shifted, (displacement.unsigned_abs() as usize, 31))
        };

        let term = if covered == (first, last) {
            shifted
        } else {
            let mask = Word::from(word::byte_mask(first, last));
            builder.and(&shifted, &mask)
        };

        result = builder.or(&result, &term);
    }

    result
}

/// Storage slot identity. Two symbolic keys share a slot entry only if they
/// are the same interned expression; all other aliasing is resolved on read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StorageKey {
    Concrete(U256),
    Symbolic(ExprId),
}

impl From<&Word> for StorageKey {
    fn from(w: &Word) -> Self {
        match w {
            Word::Concrete(c) => StorageKey::Concrete(*c),
            Word::Symbolic(e) => StorageKey::Symbolic(e.id()),
        }
    }
}

#[derive(Clone, Debug)]
struct Slot {
    key: Word,
    value: Word,
    // write order, later writes shadow earlier ones on aliasing keys
    sequence: u64,
}

/// Contract storage. Unwritten slots read as zero.
///
/// A read at a symbolic key, or at any key once a symbolic key has been
/// written, yields an `ite` chain over every written slot, newest first.
#[derive(Clone, Debug, Default)]
pub struct Storage {
    slots: Arc<BTreeMap<StorageKey, Slot>>,
    symbolic_keys: usize,
    writes: u64,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Word, builder: &mut ExprBuilder) -> Word {
        if key.as_concrete().is_some() && self.symbolic_keys == 0 {
            return self
                .slots
                .get(&StorageKey::from(key))
                .map_or(Word::zero(), |slot| slot.value.clone());
        }

        // distinct concrete keys never alias
        let mut candidates = self
            .slots
            .values()
            .filter(|slot| !matches!((key, &slot.key), (Word::Concrete(a), Word::Concrete(b)) if a != b))
            .collect::<Vec<_>>();

        candidates.sort_by_key(|slot| slot.sequence);

        candidates.into_iter().fold(Word::zero(), |older, slot| {
            let matches = builder.eq(key, &slot.key);
            builder.ite(&matches, &slot.value, &older)
        })
    }

    pub fn set(&mut self, key: Word, value: Word) {
        let id = StorageKey::from(&key);
        let sequence = self.writes;

        self.writes += 1;

        let previous = Arc::make_mut(&mut self.slots).insert(id, Slot { key, value, sequence });

        if previous.is_none() && matches!(id, StorageKey::Symbolic(_)) {
            self.symbolic_keys += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// `true` once some slot was written at a symbolic key.
    pub fn has_symbolic_keys(&self) -> bool {
        self.symbolic_keys > 0
    }

    /// `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Word, &Word)> {
        self.slots.values().map(|slot| (&slot.key, &slot.value))
    }
}

impl FromIterator<(U256, U256)> for Storage {
    fn from_iter<I: IntoIterator<Item = (U256, U256)>>(iter: I) -> Self {
        let mut storage = Storage::new();

        for (key, value) in iter {
            storage.set(Word::Concrete(key), Word::Concrete(value));
        }

        storage
    }
}

#[derive(Clone, Debug, Default)]
pub struct Account {
    pub code: Option<Arc<Program>>,
    pub storage: Storage,
    pub balance: U256,
}

/// All accounts known to an exploration. Unknown addresses have no code,
/// empty storage and a zero balance.
#[derive(Clone, Debug, Default)]
pub struct WorldState {
    accounts: Arc<BTreeMap<U256, Account>>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a contract with its initial storage.
    pub fn deploy(&mut self, address: U256, program: Program, storage: Storage) {
        let account = self.account_mut(address);

        account.code = Some(Arc::new(program));
        account.storage = storage;
    }

    pub fn set_balance(&mut self, address: U256, balance: U256) {
        self.account_mut(address).balance = balance;
    }

    pub fn account(&self, address: U256) -> Option<&Account> {
        self.accounts.get(&address)
    }

    fn account_mut(&mut self, address: U256) -> &mut Account {
        Arc::make_mut(&mut self.accounts).entry(address).or_default()
    }

    pub fn code(&self, address: U256) -> Option<Arc<Program>> {
        self.account(address).and_then(|a| a.code.clone())
    }

    pub fn balance(&self, address: U256) -> U256 {
        self.account(address).map_or(U256::ZERO, |a| a.balance)
    }

    pub fn storage(&self, address: U256) -> Option<&Storage> {
        self.account(address).map(|a| &a.storage)
    }

    pub fn sload(&self, address: U256, key: &Word, builder: &mut ExprBuilder) -> Word {
        self.account(address)
            .map_or(Word::zero(), |a| a.storage.get(key, builder))
    }

    pub fn sstore(&mut self, address: U256, key: Word, value: Word) {
        self.account_mut(address).storage.set(key, value);
    }

    pub fn addresses(&self) -> impl Iterator<Item = U256> + '_ {
        self.accounts.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{evaluate, Model};

    fn model(a: u64) -> Model {
        [("a".to_string(), U256::from(a))].into_iter().collect()
    }

    #[test]
    fn unmapped_memory_reads_zero() {
        let mut builder = ExprBuilder::new();
        let memory = ByteMap::new();

        assert_eq!(memory.read_word(1000, &mut builder), Word::zero());
        assert_eq!(memory.concrete_bytes(5, 3), Some(vec![0, 0, 0]));
    }

    #[test]
    fn concrete_words_round_trip_at_unaligned_offsets() {
        let mut builder = ExprBuilder::new();
        let mut memory = ByteMap::new();
        let value = Word::from(0x1122_3344_u64);

        memory.write_word(3, &value);

        assert_eq!(memory.read_word(3, &mut builder), value);
        assert_eq!(memory.read_word(4, &mut builder), Word::from(0x1122_3344_00_u64));
        assert_eq!(memory.cell(34), &Cell::Concrete(0x44));
    }

    #[test]
    fn symbolic_word_is_returned_unchanged_when_aligned() {
        let mut builder = ExprBuilder::new();
        let a = Word::from(builder.input("a"));
        let mut memory = ByteMap::new();

        memory.write_word(4, &a);

        assert_eq!(memory.read_word(4, &mut builder), a);
    }

    #[test]
    fn selector_extraction_separates_concrete_prefix() {
        let mut builder = ExprBuilder::new();
        let a = Word::from(builder.input("a"));
        let mut cells = vec![
            Cell::Concrete(0xaa),
            Cell::Concrete(0xbb),
            Cell::Concrete(0xcc),
            Cell::Concrete(0xdd),
        ];
        cells.extend(cells_of(&a));

        let calldata = ByteMap::from_cells(cells);
        let head = calldata.read_word(0, &mut builder);
        let selector = builder.binary(BinaryOp::Shr, &Word::from(224_u64), &head);

        assert!(!head.is_concrete());
        assert_eq!(selector, Word::from(0xaabb_ccdd_u64));
    }

    #[test]
    fn partial_symbolic_overwrite_is_masked() {
        let mut builder = ExprBuilder::new();
        let a = Word::from(builder.input("a"));
        let mut memory = ByteMap::new();

        memory.write_word(0, &a);
        memory.write_byte(31, &Word::from(0x7f_u64));

        let read = memory.read_word(0, &mut builder);
        let mask = Word::from(word::byte_mask(0, 30));
        let high = builder.and(&a, &mask);
        let expected = builder.or(&Word::from(0x7f_u64), &high);

        assert_eq!(read, expected);
    }

    #[test]
    fn memory_size_grows_in_words() {
        let mut memory = ByteMap::new();

        memory.expand(0, 0);
        assert_eq!(memory.len(), 0);
        memory.expand(30, 4);
        assert_eq!(memory.len(), 64);
        memory.expand(0, 32);
        assert_eq!(memory.len(), 64);
    }

    #[test]
    fn forked_memory_is_copy_on_write() {
        let mut builder = ExprBuilder::new();
        let mut parent = ByteMap::new();

        parent.write_word(0, &Word::from(1_u64));

        let mut child = parent.clone();
        child.write_word(0, &Word::from(2_u64));

        assert_eq!(parent.read_word(0, &mut builder), Word::from(1_u64));
        assert_eq!(child.read_word(0, &mut builder), Word::from(2_u64));
    }

    #[test]
    fn identical_symbolic_keys_share_a_slot() {
        let mut builder = ExprBuilder::new();
        let k = Word::from(builder.input("k"));
        let slot = builder.keccak(64, &[k.clone(), Word::zero()]);
        let same = builder.keccak(64, &[k, Word::zero()]);

        let mut storage = Storage::new();

        assert_eq!(storage.get(&Word::from(7_u64), &mut builder), Word::zero());

        storage.set(slot, Word::from(42_u64));

        assert_eq!(storage.get(&same, &mut builder), Word::from(42_u64));
        assert_eq!(storage.len(), 1);
        assert!(storage.has_symbolic_keys());
    }

    #[test]
    fn symbolic_read_selects_over_written_slots() {
        let mut builder = ExprBuilder::new();
        let a = Word::from(builder.input("a"));
        let mut storage: Storage = [(U256::from(5_u64), U256::from(1_u64))].into_iter().collect();

        let read = storage.get(&a, &mut builder);
        let five = builder.eq(&a, &Word::from(5_u64));

        assert_eq!(read, five);

        storage.set(Word::from(5_u64), Word::from(9_u64));
        let read = storage.get(&a, &mut builder);
        let read = read.as_expr().expect("symbolic read");

        assert_eq!(evaluate(read, &model(5)), U256::from(9_u64));
        assert_eq!(evaluate(read, &model(6)), U256::ZERO);
    }

    #[test]
    fn symbolic_write_shadows_older_slots() {
        let mut builder = ExprBuilder::new();
        let a = Word::from(builder.input("a"));
        let mut storage: Storage = [(U256::from(5_u64), U256::from(1_u64))].into_iter().collect();

        storage.set(a, Word::from(7_u64));

        let read = storage.get(&Word::from(5_u64), &mut builder);
        let read = read.as_expr().expect("concrete key may alias the symbolic write");

        assert_eq!(evaluate(read, &model(5)), U256::from(7_u64));
        assert_eq!(evaluate(read, &model(4)), U256::from(1_u64));
        assert_eq!(storage.get(&Word::from(6_u64), &mut builder).as_concrete(), None);
    }

    #[test]
    fn world_state_is_shared_until_written() {
        let mut builder = ExprBuilder::new();
        let mut world = WorldState::new();
        let address = U256::from(0x1000_u64);

        world.sstore(address, Word::from(1_u64), Word::from(5_u64));

        let snapshot = world.clone();
        world.sstore(address, Word::from(1_u64), Word::from(6_u64));

        assert_eq!(snapshot.sload(address, &Word::from(1_u64), &mut builder), Word::from(5_u64));
        assert_eq!(world.sload(address, &Word::from(1_u64), &mut builder), Word::from(6_u64));
        assert_eq!(world.sload(U256::from(9_u64), &Word::one(), &mut builder), Word::zero());
    }
}
