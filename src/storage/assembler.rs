use core::fmt;

use heapless::Vec;

use crate::config::ASSEMBLER_MAX_SEGMENT_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TooManyHolesError;

impl fmt::Display for TooManyHolesError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "too many holes")
    }
}

impl core::error::Error for TooManyHolesError {}

/// A run of octets received above the next expected one.
///
/// Offsets are relative to the front of the assembler, i.e. to the first
/// octet that has not arrived in order yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub start: usize,
    pub end: usize,
}

impl Block {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// A buffer (re)assembler.
///
/// Keeps the blocks of data that arrived ahead of the next expected octet,
/// sorted and pairwise disjoint with a gap between neighbours. At most
/// `ASSEMBLER_MAX_SEGMENT_COUNT` blocks are tracked; the same blocks are
/// reported to the peer in SACK options.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Assembler {
    blocks: Vec<Block, ASSEMBLER_MAX_SEGMENT_COUNT>,
}

impl fmt::Display for Assembler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[ ")?;
        let mut at = 0;
        for block in self.blocks.iter() {
            write!(f, "({}) {} ", block.start - at, block.len())?;
            at = block.end;
        }
        write!(f, "]")?;
        Ok(())
    }
}

impl Assembler {
    /// Create a new buffer assembler.
    pub const fn new() -> Assembler {
        Assembler { blocks: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Return whether the assembler holds no out-of-order data.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of octets past the front up to the end of the last block.
    pub fn extent(&self) -> usize {
        self.blocks.last().map(|block| block.end).unwrap_or(0)
    }

    /// Add a new range to the assembler, merging it with every block it
    /// overlaps or touches, or return `Err(TooManyHolesError)` if it would
    /// need a block beyond the tracked count.
    pub fn add(&mut self, offset: usize, size: usize) -> Result<(), TooManyHolesError> {
        if size == 0 {
            return Ok(());
        }

        let (mut start, mut end) = (offset, offset + size);
        let mut i = 0;
        while i < self.blocks.len() {
            let block = self.blocks[i];
            if block.end < start {
                i += 1;
                continue;
            }
            if end < block.start {
                break;
            }
            start = start.min(block.start);
            end = end.max(block.end);
            self.blocks.remove(i);
        }

        self.blocks
            .insert(i, Block { start, end })
            .map_err(|_| TooManyHolesError)
    }

    /// Remove the block starting at the front, shifting the remaining blocks
    /// down. Return its length, or 0 if there is a hole at the front.
    pub fn remove_front(&mut self) -> usize {
        match self.blocks.first() {
            Some(block) if block.start == 0 => {
                let front = block.end;
                self.blocks.remove(0);
                self.shift(front);
                front
            }
            _ => 0,
        }
    }

    /// Add a segment, then remove_front.
    ///
    /// In-order data (`offset == 0`) never fails: it is merged with any
    /// blocks it reaches and all of them leave the assembler together.
    pub fn add_then_remove_front(
        &mut self,
        offset: usize,
        size: usize,
    ) -> Result<usize, TooManyHolesError> {
        if offset == 0 {
            let mut front = size;
            while let Some(block) = self.blocks.first() {
                if front < block.start {
                    break;
                }
                front = front.max(block.end);
                self.blocks.remove(0);
            }
            self.shift(front);
            return Ok(front);
        }

        self.add(offset, size)?;
        Ok(self.remove_front())
    }

    fn shift(&mut self, by: usize) {
        for block in self.blocks.iter_mut() {
            block.start -= by;
            block.end -= by;
        }
    }

    /// Iterate over all of the data blocks, as `(start, end)` pairs offset by
    /// `first_offset`.
    ///
    ///    Hole        Data        Hole        Data
    /// |--- 100 ---|--- 100 ---|--- 200 ---|--- 100 ---|
    ///
    /// An offset of 1500 would return the ranges: ``(1600, 1700), (1900, 2000)``
    pub fn iter_data(&self, first_offset: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.blocks
            .iter()
            .map(move |block| (block.start + first_offset, block.end + first_offset))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::vec::Vec as StdVec;

    fn blocks(assr: &Assembler) -> StdVec<(usize, usize)> {
        assr.iter_data(0).collect()
    }

    #[test]
    fn test_new() {
        let assr = Assembler::new();
        assert!(assr.is_empty());
        assert_eq!(assr.extent(), 0);
        assert_eq!(format!("{assr}"), "[ ]");
    }

    #[test]
    fn test_add_disjoint() {
        let mut assr = Assembler::new();
        assert_eq!(assr.add(4, 4), Ok(()));
        assert_eq!(assr.add(12, 2), Ok(()));
        assert_eq!(blocks(&assr), vec![(4, 8), (12, 14)]);
        assert_eq!(format!("{assr}"), "[ (4) 4 (4) 2 ]");
    }

    #[test]
    fn test_add_merges_touching() {
        let mut assr = Assembler::new();
        assr.add(4, 4).unwrap();
        assr.add(12, 2).unwrap();
        assr.add(8, 4).unwrap();
        assert_eq!(blocks(&assr), vec![(4, 14)]);
    }

    #[test]
    fn test_add_merges_overlapping() {
        let mut assr = Assembler::new();
        assr.add(10, 4).unwrap();
        assr.add(20, 4).unwrap();
        assr.add(30, 4).unwrap();
        assr.add(12, 20).unwrap();
        assert_eq!(blocks(&assr), vec![(10, 34)]);
    }

    #[test]
    fn test_add_duplicate() {
        let mut assr = Assembler::new();
        assr.add(10, 10).unwrap();
        assr.add(12, 2).unwrap();
        assert_eq!(blocks(&assr), vec![(10, 20)]);
    }

    #[test]
    fn test_too_many_holes() {
        let mut assr = Assembler::new();
        for i in 0..ASSEMBLER_MAX_SEGMENT_COUNT {
            assert_eq!(assr.add(10 * (i + 1), 1), Ok(()));
        }
        let before = assr.clone();
        assert_eq!(assr.add(200, 1), Err(TooManyHolesError));
        assert_eq!(assr, before);
        // Merging into an existing block still works when full.
        assert_eq!(assr.add(11, 2), Ok(()));
    }

    #[test]
    fn test_remove_front() {
        let mut assr = Assembler::new();
        assr.add(4, 4).unwrap();
        assert_eq!(assr.remove_front(), 0);
        assr.add(0, 4).unwrap();
        assert_eq!(assr.remove_front(), 8);
        assert!(assr.is_empty());
    }

    #[test]
    fn test_add_then_remove_front_in_order() {
        let mut assr = Assembler::new();
        assr.add(8, 4).unwrap();
        assr.add(20, 4).unwrap();
        assert_eq!(assr.add_then_remove_front(0, 8), Ok(12));
        assert_eq!(blocks(&assr), vec![(8, 12)]);
    }

    #[test]
    fn test_add_then_remove_front_full_in_order() {
        let mut assr = Assembler::new();
        for i in 0..ASSEMBLER_MAX_SEGMENT_COUNT {
            assr.add(10 * (i + 1), 1).unwrap();
        }
        assert_eq!(assr.add_then_remove_front(0, 2), Ok(2));
        assert_eq!(assr.extent(), 10 * ASSEMBLER_MAX_SEGMENT_COUNT + 1 - 2);
    }

    #[test]
    fn test_add_then_remove_front_out_of_order() {
        let mut assr = Assembler::new();
        assert_eq!(assr.add_then_remove_front(4, 4), Ok(0));
        assert_eq!(blocks(&assr), vec![(4, 8)]);
    }

    #[test]
    fn test_iter_offset() {
        let mut assr = Assembler::new();
        assr.add(100, 100).unwrap();
        assr.add(400, 100).unwrap();
        assert_eq!(
            assr.iter_data(1500).collect::<StdVec<_>>(),
            vec![(1600, 1700), (1900, 2000)]
        );
    }
}
