//! Engine constant buffers: the device-wide registry and each context's CPU
//! mirror of the local buffers.

use std::ops::Range;

use crate::{resource::ConstantBufferView, Error};

/// How a registered constant buffer reaches the GPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstantBufferKind {
    /// Mirrored on the CPU and copied into a device-owned GPU buffer on
    /// commit.
    Local,
    /// Mirrored on the CPU and restaged into scratch memory on every commit.
    /// Bound through a root constant buffer slot instead of a table.
    PerDraw,
    /// A buffer owned by the caller. Contexts never write to it.
    Global,
}

#[derive(Clone, Debug)]
pub struct ConstantBufferInfo {
    pub name: String,
    pub size: u32,
    pub kind: ConstantBufferKind,
    /// Present for local and global buffers.
    pub view: Option<ConstantBufferView>,
}

#[derive(Debug, Default)]
pub struct ConstantBufferRegistry {
    entries: Vec<ConstantBufferInfo>,
}

impl ConstantBufferRegistry {
    #[must_use]
    pub fn find(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .map(|i| i as u32)
    }

    #[must_use]
    pub fn get(&self, index: u32) -> Option<&ConstantBufferInfo> {
        self.entries.get(index as usize)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn push(&mut self, info: ConstantBufferInfo) -> u32 {
        self.entries.push(info);
        (self.entries.len() - 1) as u32
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = ConstantBufferInfo> + '_ {
        self.entries.drain(..)
    }
}

/// A CPU copy of a constant buffer and the byte range changed since the
/// last commit.
#[derive(Debug)]
pub struct LocalConstantBuffer {
    data: Vec<u8>,
    dirty_lower: i64,
    dirty_upper: i64,
}

impl LocalConstantBuffer {
    #[must_use]
    pub fn new(size: u32) -> Self {
        Self {
            data: vec![0; size as usize],
            dirty_lower: -1,
            dirty_upper: -1,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The bytes changed since the last commit, if any.
    #[must_use]
    pub fn dirty_range(&self) -> Option<Range<usize>> {
        (self.dirty_upper >= 0).then(|| self.dirty_lower as usize..self.dirty_upper as usize)
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_lower = -1;
        self.dirty_upper = -1;
    }

    /// Copies `bytes` to `offset`. Returns `false` without touching the dirty
    /// range if the contents are unchanged.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<bool, Error> {
        let target = self.bounds(offset, bytes.len())?;
        if self.data[target.clone()] == *bytes {
            return Ok(false);
        }

        self.data[target.clone()].copy_from_slice(bytes);
        self.mark_dirty(target);
        Ok(true)
    }

    /// Copies `count` elements of `copy_size` bytes, packed in `bytes`, to
    /// `offset + i * stride`.
    pub fn write_strided(
        &mut self,
        offset: usize,
        stride: usize,
        copy_size: usize,
        count: usize,
        bytes: &[u8],
    ) -> Result<bool, Error> {
        if count == 0 || copy_size == 0 {
            return Ok(false);
        }

        let span = stride
            .checked_mul(count - 1)
            .and_then(|spread| spread.checked_add(copy_size))
            .ok_or(Error::OutOfBounds {
                offset,
                size: usize::MAX,
                capacity: self.data.len(),
            })?;
        let target = self.bounds(offset, span)?;

        let packed = copy_size.checked_mul(count).unwrap_or(usize::MAX);
        if bytes.len() < packed {
            return Err(Error::OutOfBounds {
                offset: 0,
                size: packed,
                capacity: bytes.len(),
            });
        }

        let elements = || {
            bytes
                .chunks_exact(copy_size)
                .take(count)
                .enumerate()
                .map(|(i, src)| (offset + i * stride, src))
        };

        if elements().all(|(at, src)| self.data[at..at + copy_size] == *src) {
            return Ok(false);
        }

        for (at, src) in elements() {
            self.data[at..at + copy_size].copy_from_slice(src);
        }
        self.mark_dirty(target);
        Ok(true)
    }

    fn bounds(&self, offset: usize, len: usize) -> Result<Range<usize>, Error> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(offset..end),
            _ => Err(Error::OutOfBounds {
                offset,
                size: len,
                capacity: self.data.len(),
            }),
        }
    }

    fn mark_dirty(&mut self, range: Range<usize>) {
        let (lower, upper) = (range.start as i64, range.end as i64);
        if self.dirty_upper < 0 {
            self.dirty_lower = lower;
            self.dirty_upper = upper;
        } else {
            self.dirty_lower = self.dirty_lower.min(lower);
            self.dirty_upper = self.dirty_upper.max(upper);
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn writes_merge_into_one_range() {
        let mut buffer = LocalConstantBuffer::new(64);

        assert!(buffer.write(0, &[1; 4]).unwrap());
        assert_eq!(buffer.dirty_range(), Some(0..4));

        assert!(buffer.write(8, &[2; 4]).unwrap());
        assert_eq!(buffer.dirty_range(), Some(0..12));

        buffer.clear_dirty();
        assert_eq!(buffer.dirty_range(), None);
    }

    #[test]
    fn unchanged_writes_stay_clean() {
        let mut buffer = LocalConstantBuffer::new(16);
        assert!(!buffer.write(4, &[0; 8]).unwrap());
        assert_eq!(buffer.dirty_range(), None);
    }

    #[test]
    fn strided_writes_skip_padding() {
        let mut buffer = LocalConstantBuffer::new(64);
        let values = [1u8, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3];

        assert!(buffer.write_strided(16, 16, 4, 3, &values).unwrap());
        assert_eq!(buffer.dirty_range(), Some(16..52));
        assert_eq!(&buffer.data()[16..20], &[1; 4]);
        assert_eq!(&buffer.data()[20..32], &[0; 12]);
        assert_eq!(&buffer.data()[48..52], &[3; 4]);

        buffer.clear_dirty();
        assert!(!buffer.write_strided(16, 16, 4, 3, &values).unwrap());
    }

    #[test]
    fn out_of_bounds_writes_fail() {
        let mut buffer = LocalConstantBuffer::new(16);
        assert!(matches!(
            buffer.write(12, &[1; 8]),
            Err(Error::OutOfBounds { offset: 12, size: 8, capacity: 16 })
        ));
        assert_eq!(buffer.dirty_range(), None);
    }

    #[test]
    fn strided_writes_reject_overflowing_ranges() {
        let mut buffer = LocalConstantBuffer::new(64);
        assert!(matches!(
            buffer.write_strided(0, usize::MAX / 2 + 1, 4, 3, &[0; 12]),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            buffer.write_strided(8, 4, 4, usize::MAX, &[0; 12]),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            buffer.write_strided(usize::MAX - 2, 4, 4, 1, &[0; 4]),
            Err(Error::OutOfBounds { .. })
        ));
        assert_eq!(buffer.dirty_range(), None);
    }

    proptest! {
        #[test]
        fn dirty_range_covers_every_changed_write(
            writes in prop::collection::vec((0usize..240, 1usize..16, any::<u8>()), 1..16)
        ) {
            let mut buffer = LocalConstantBuffer::new(256);
            let mut expected: Option<(usize, usize)> = None;

            for (offset, len, value) in writes {
                let bytes = vec![value; len];
                if buffer.write(offset, &bytes).unwrap() {
                    expected = Some(match expected {
                        None => (offset, offset + len),
                        Some((lo, hi)) => (lo.min(offset), hi.max(offset + len)),
                    });
                }
                prop_assert_eq!(buffer.dirty_range(), expected.map(|(lo, hi)| lo..hi));
            }
        }
    }
}
