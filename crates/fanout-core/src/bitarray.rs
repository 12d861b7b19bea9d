//! Bit-packed arrays for per-index sub-task state.
//!
//! An array task may fan out to hundreds of thousands of sub-tasks. Tracking
//! each sub-task's phase or retry counter in a full machine word would make the
//! persisted state grow far beyond what a host is willing to store between
//! reconciliation passes, so these structures pack each entry into the
//! smallest number of bits that can represent it.
//!
//! - [`BitSet`]: one bit per index, O(1) get/set and word-level popcount
//! - [`CompactArray`]: fixed `bit_width` unsigned values per index
//!
//! ## Binary Layout
//!
//! Both types encode to a byte-exact little-endian form:
//!
//! ```text
//! BitSet:        len: u32 | words: u64 * ceil(len / 64)
//! CompactArray:  len: u32 | bit_width: u8 | words: u64 * ceil(len * bit_width / 64)
//! ```
//!
//! Padding bits past the logical end must be zero; decoding rejects anything
//! else so that equal values always have equal encodings.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

const WORD_BITS: usize = 64;

/// Returns the minimum bit width able to represent every value in `0..=max_value`.
///
/// Zero still needs one bit so that the array has addressable storage.
#[must_use]
pub const fn required_bit_width(max_value: u64) -> u8 {
    if max_value == 0 {
        1
    } else {
        // leading_zeros is at most 63 here, so the result is in 1..=64.
        (u64::BITS - max_value.leading_zeros()) as u8
    }
}

fn encode_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::InvalidInput(format!("length {len} exceeds u32")))
}

fn ensure_remaining(buf: &impl Buf, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::serialization(format!(
            "truncated {what}: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn decode_words(buf: &mut impl Buf, count: usize, what: &str) -> Result<Vec<u64>> {
    let needed = count
        .checked_mul(8)
        .ok_or_else(|| Error::serialization(format!("{what} word count overflow")))?;
    ensure_remaining(buf, needed, what)?;
    Ok((0..count).map(|_| buf.get_u64_le()).collect())
}

/// Mask of the bits that are in use in the final word of a structure holding
/// `used_bits` bits.
fn tail_mask(used_bits: usize) -> u64 {
    match used_bits % WORD_BITS {
        0 => u64::MAX,
        rem => (1u64 << rem) - 1,
    }
}

// ============================================================================
// BitSet
// ============================================================================

/// A fixed-length set of bits addressed by index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitSet {
    len: usize,
    words: Vec<u64>,
}

impl BitSet {
    /// Creates a bitset with `len` cleared bits.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            len,
            words: vec![0; len.div_ceil(WORD_BITS)],
        }
    }

    /// Returns the number of addressable bits.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the bitset has no addressable bits.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, index: usize) -> Result<()> {
        if index >= self.len {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.len,
            });
        }
        Ok(())
    }

    /// Returns whether the bit at `index` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `index >= len`.
    pub fn get(&self, index: usize) -> Result<bool> {
        self.check(index)?;
        Ok(self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0)
    }

    /// Sets the bit at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `index >= len`.
    pub fn set(&mut self, index: usize) -> Result<()> {
        self.check(index)?;
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        Ok(())
    }

    /// Clears the bit at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `index >= len`.
    pub fn clear(&mut self, index: usize) -> Result<()> {
        self.check(index)?;
        self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        Ok(())
    }

    /// Returns the number of set bits.
    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterates over the indexes of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_index, &word)| {
                let mut remaining = word;
                std::iter::from_fn(move || {
                    if remaining == 0 {
                        return None;
                    }
                    let bit = remaining.trailing_zeros() as usize;
                    remaining &= remaining - 1;
                    Some(word_index * WORD_BITS + bit)
                })
            })
    }

    /// Iterates over the indexes of cleared bits in ascending order.
    pub fn iter_zeros(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&i| self.words[i / WORD_BITS] & (1 << (i % WORD_BITS)) == 0)
    }

    /// Appends the binary encoding of this bitset to `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the length does not fit in a `u32`.
    pub fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u32_le(encode_len(self.len)?);
        for word in &self.words {
            buf.put_u64_le(*word);
        }
        Ok(())
    }

    /// Decodes a bitset previously written by [`BitSet::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the input is truncated or has
    /// non-zero padding bits.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        ensure_remaining(buf, 4, "bitset length")?;
        let len = buf.get_u32_le() as usize;
        let words = decode_words(buf, len.div_ceil(WORD_BITS), "bitset")?;

        if let Some(last) = words.last() {
            if last & !tail_mask(len) != 0 {
                return Err(Error::serialization("bitset has non-zero padding bits"));
            }
        }

        Ok(Self { len, words })
    }
}

// ============================================================================
// CompactArray
// ============================================================================

/// A fixed-length array of unsigned integers packed at `bit_width` bits each.
///
/// Values may straddle word boundaries; all access is O(1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactArray {
    len: usize,
    bit_width: u8,
    words: Vec<u64>,
}

impl CompactArray {
    /// Creates a zero-filled array of `len` items, each `bit_width` bits wide.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidWidth`] if `bit_width` is not in `1..=64`, and
    /// [`Error::InvalidInput`] if the total bit count overflows.
    pub fn new(len: usize, bit_width: u8) -> Result<Self> {
        if bit_width == 0 || usize::from(bit_width) > WORD_BITS {
            return Err(Error::invalid_width(bit_width, "must be between 1 and 64"));
        }
        let total_bits = Self::total_bits(len, bit_width)?;
        Ok(Self {
            len,
            bit_width,
            words: vec![0; total_bits.div_ceil(WORD_BITS)],
        })
    }

    /// Creates a zero-filled array wide enough to hold any value up to `max_value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the total bit count overflows.
    pub fn for_max_value(len: usize, max_value: u64) -> Result<Self> {
        Self::new(len, required_bit_width(max_value))
    }

    fn total_bits(len: usize, bit_width: u8) -> Result<usize> {
        len.checked_mul(usize::from(bit_width)).ok_or_else(|| {
            Error::InvalidInput(format!("{len} items of {bit_width} bits overflow"))
        })
    }

    /// Returns the number of items.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the array holds no items.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the width of each item in bits.
    #[must_use]
    pub const fn bit_width(&self) -> u8 {
        self.bit_width
    }

    /// Returns the largest value a single item can hold.
    #[must_use]
    pub const fn max_value(&self) -> u64 {
        if self.bit_width as usize == WORD_BITS {
            u64::MAX
        } else {
            (1u64 << self.bit_width) - 1
        }
    }

    fn check(&self, index: usize) -> Result<()> {
        if index >= self.len {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.len,
            });
        }
        Ok(())
    }

    /// Returns the item at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `index >= len`.
    pub fn get(&self, index: usize) -> Result<u64> {
        self.check(index)?;
        let width = usize::from(self.bit_width);
        let mask = self.max_value();
        let bit = index * width;
        let (word, offset) = (bit / WORD_BITS, bit % WORD_BITS);

        let low = self.words[word] >> offset;
        if offset + width <= WORD_BITS {
            Ok(low & mask)
        } else {
            let high = self.words[word + 1] << (WORD_BITS - offset);
            Ok((low | high) & mask)
        }
    }

    /// Stores `value` at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `index >= len` and
    /// [`Error::InvalidWidth`] if `value` does not fit in `bit_width` bits.
    pub fn set(&mut self, index: usize, value: u64) -> Result<()> {
        self.check(index)?;
        let mask = self.max_value();
        if value > mask {
            return Err(Error::invalid_width(
                self.bit_width,
                format!("value {value} exceeds maximum {mask}"),
            ));
        }

        let width = usize::from(self.bit_width);
        let bit = index * width;
        let (word, offset) = (bit / WORD_BITS, bit % WORD_BITS);

        self.words[word] = (self.words[word] & !(mask << offset)) | (value << offset);
        if offset + width > WORD_BITS {
            let high_bits = offset + width - WORD_BITS;
            let high_mask = (1u64 << high_bits) - 1;
            self.words[word + 1] =
                (self.words[word + 1] & !high_mask) | (value >> (WORD_BITS - offset));
        }
        Ok(())
    }

    /// Iterates over all items in index order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        // Indexes are always in range, so the fallback value is unreachable.
        (0..self.len).map(|i| self.get(i).unwrap_or_default())
    }

    /// Appends the binary encoding of this array to `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the length does not fit in a `u32`.
    pub fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u32_le(encode_len(self.len)?);
        buf.put_u8(self.bit_width);
        for word in &self.words {
            buf.put_u64_le(*word);
        }
        Ok(())
    }

    /// Decodes an array previously written by [`CompactArray::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the input is truncated or has
    /// non-zero padding bits, and [`Error::InvalidWidth`] if the encoded
    /// width is not in `1..=64`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        ensure_remaining(buf, 5, "compact array header")?;
        let len = buf.get_u32_le() as usize;
        let bit_width = buf.get_u8();

        if bit_width == 0 || usize::from(bit_width) > WORD_BITS {
            return Err(Error::invalid_width(bit_width, "must be between 1 and 64"));
        }
        // The header is untrusted; nothing is allocated until the payload is
        // known to hold every word it claims.
        let total_bits = Self::total_bits(len, bit_width)?;
        let array = Self {
            len,
            bit_width,
            words: decode_words(buf, total_bits.div_ceil(WORD_BITS), "compact array")?,
        };

        if let Some(last) = array.words.last() {
            if last & !tail_mask(total_bits) != 0 {
                return Err(Error::serialization(
                    "compact array has non-zero padding bits",
                ));
            }
        }

        Ok(array)
    }
}
