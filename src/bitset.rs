//! Fixed-width bit vector used for tip sets and validity flags.
//!
//! # Overview
//! A split of an unrooted tree is the set of tip ids on one side of an edge.
//! Tip ids are dense (`0..n_tips`), so a split is stored as one bit per tip.
//! The same type backs the per-partition CLV and pmatrix validity maps of
//! [`crate::treeinfo::TreeInfo`].
//!
//! # Example
//! For tips [A, B, C, D] with ids [0, 1, 2, 3]:
//! - Split {B, C} → `0b0110`
//! - Split {C, D} → `0b1100`

/// A compact bitset over dense indices.
///
/// Bits are stored in `Vec<u64>` words, 64 indices per word. Ordering and
/// hashing are derived, so bitsets can be sorted and used as set keys.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Bitset(pub Vec<u64>);

impl Bitset {
    /// Number of u64 words needed to hold `bits` indices.
    pub fn words_for(bits: usize) -> usize {
        bits.div_ceil(64)
    }

    /// Creates a bitset with all bits cleared.
    ///
    /// # Example
    /// ```
    /// # use rust_python_tree_search::bitset::Bitset;
    /// let bs = Bitset::zeros(Bitset::words_for(100));
    /// assert_eq!(bs.0.len(), 2);
    /// ```
    pub fn zeros(words: usize) -> Self {
        Bitset(vec![0u64; words])
    }

    /// Creates a bitset holding `bits` indices, all set.
    ///
    /// Bits past `bits` in the last word stay cleared so equality with a
    /// bitset built bit by bit holds.
    ///
    /// # Example
    /// ```
    /// # use rust_python_tree_search::bitset::Bitset;
    /// let bs = Bitset::ones(70);
    /// assert_eq!(bs.count_ones(), 70);
    /// assert_eq!(bs.0[1], 0b111111);
    /// ```
    pub fn ones(bits: usize) -> Self {
        let mut bs = Bitset(vec![u64::MAX; Self::words_for(bits)]);
        bs.mask_tail(bits);
        bs
    }

    /// Sets the bit at `idx`.
    ///
    /// # Example
    /// ```
    /// # use rust_python_tree_search::bitset::Bitset;
    /// let mut bs = Bitset::zeros(1);
    /// bs.set(0);
    /// bs.set(5);
    /// assert_eq!(bs.0[0], 0b00100001);
    /// ```
    #[inline]
    pub fn set(&mut self, idx: usize) {
        let word = idx >> 6; // idx / 64
        let bit = idx & 63; // idx % 64
        self.0[word] |= 1u64 << bit;
    }

    /// Clears the bit at `idx`.
    #[inline]
    pub fn clear(&mut self, idx: usize) {
        self.0[idx >> 6] &= !(1u64 << (idx & 63));
    }

    /// Whether the bit at `idx` is set. Out-of-range indices read as unset.
    #[inline]
    pub fn contains(&self, idx: usize) -> bool {
        self.0
            .get(idx >> 6)
            .is_some_and(|word| word & (1u64 << (idx & 63)) != 0)
    }

    /// Clears every bit.
    pub fn clear_all(&mut self) {
        self.0.iter_mut().for_each(|w| *w = 0);
    }

    /// Sets the first `bits` bits.
    pub fn set_all(&mut self, bits: usize) {
        self.0.iter_mut().for_each(|w| *w = u64::MAX);
        self.mask_tail(bits);
    }

    /// Performs bitwise OR with another bitset (union).
    ///
    /// # Example
    /// ```
    /// # use rust_python_tree_search::bitset::Bitset;
    /// let mut left = Bitset::zeros(1);
    /// left.set(0);
    /// let mut right = Bitset::zeros(1);
    /// right.set(1);
    /// left.or_assign(&right);
    /// assert_eq!(left.0[0], 0b11);
    /// ```
    #[inline]
    pub fn or_assign(&mut self, other: &Bitset) {
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a |= *b;
        }
    }

    /// Flips the first `bits` bits in place; bits beyond stay cleared.
    ///
    /// # Example
    /// ```
    /// # use rust_python_tree_search::bitset::Bitset;
    /// let mut bs = Bitset::zeros(1);
    /// bs.set(0);
    /// bs.set(1);
    /// bs.complement(4);
    /// assert_eq!(bs.0[0], 0b1100);
    /// ```
    pub fn complement(&mut self, bits: usize) {
        self.0.iter_mut().for_each(|w| *w = !*w);
        self.mask_tail(bits);
    }

    /// Counts the set bits.
    #[inline]
    pub fn count_ones(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterates over the indices of set bits in increasing order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(w, &word)| {
            (0..64)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| (w << 6) + bit)
        })
    }

    fn mask_tail(&mut self, bits: usize) {
        let full = bits >> 6;
        let rest = bits & 63;
        for (w, word) in self.0.iter_mut().enumerate() {
            if w > full || (w == full && rest == 0) {
                *word = 0;
            } else if w == full {
                *word &= (1u64 << rest) - 1;
            }
        }
    }
}
