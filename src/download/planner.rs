//! Partitioning of an object into fixed-size byte ranges.

use super::DownloadError;

/// Lifecycle of one segment inside a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Waiting in the queue.
    Pending,
    /// Claimed by a worker.
    InFlight,
    /// Fully written to the buffer.
    Done,
    /// Gave up after the attempt budget.
    Failed,
}

/// One contiguous byte range of the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Position in the plan, ordered by offset.
    pub index: usize,
    /// First byte of the range.
    pub offset: u64,
    /// Number of bytes in the range.
    pub length: u64,
    /// Current state.
    pub state: SegmentState,
    /// Fetch attempts made so far.
    pub attempts: u32,
}

impl Segment {
    /// One past the last byte of the range.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Splits `[0, total_size)` into `ceil(total_size / segment_size)` segments.
///
/// Every segment has `segment_size` bytes except possibly the last.
///
/// # Errors
///
/// Returns [`DownloadError::InvalidSize`] when either size is zero.
pub fn plan_segments(total_size: u64, segment_size: u64) -> Result<Vec<Segment>, DownloadError> {
    if total_size == 0 || segment_size == 0 {
        return Err(DownloadError::invalid_size(total_size, segment_size));
    }

    let count = total_size.div_ceil(segment_size);
    let segments = (0..count)
        .map(|i| {
            let offset = i * segment_size;
            Segment {
                index: usize::try_from(i).unwrap_or(usize::MAX),
                offset,
                length: segment_size.min(total_size - offset),
                state: SegmentState::Pending,
                attempts: 0,
            }
        })
        .collect();
    Ok(segments)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn assert_partition(total: u64, segment_size: u64) {
        let segments = plan_segments(total, segment_size).unwrap();
        assert_eq!(segments.len() as u64, total.div_ceil(segment_size));

        let mut expected_offset = 0;
        for (i, segment) in segments.iter().enumerate() {
            assert_eq!(segment.index, i);
            assert_eq!(segment.offset, expected_offset, "gap or overlap at {i}");
            assert!(segment.length > 0);
            assert!(segment.length <= segment_size);
            assert_eq!(segment.state, SegmentState::Pending);
            expected_offset = segment.end();
        }
        assert_eq!(expected_offset, total);
        assert_eq!(segments.iter().map(|s| s.length).sum::<u64>(), total);
    }

    #[test]
    fn test_partition_is_contiguous_for_many_shapes() {
        for total in [1, 2, 7, 100, 1023, 1024, 1025, 4096, 10_000_019] {
            for segment_size in [1, 3, 512, 1024, 4096, 1 << 20] {
                if total / segment_size > 100_000 {
                    continue;
                }
                assert_partition(total, segment_size);
            }
        }
    }

    #[test]
    fn test_last_segment_shorter() {
        let segments = plan_segments(10, 4).unwrap();
        let lengths: Vec<u64> = segments.iter().map(|s| s.length).collect();
        assert_eq!(lengths, vec![4, 4, 2]);
    }

    #[test]
    fn test_segment_larger_than_object() {
        let segments = plan_segments(5, 1 << 20).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].length, 5);
    }

    #[test]
    fn test_zero_total_is_invalid() {
        assert!(matches!(
            plan_segments(0, 1024),
            Err(DownloadError::InvalidSize { total_size: 0, .. })
        ));
    }

    #[test]
    fn test_zero_segment_size_is_invalid() {
        assert!(matches!(
            plan_segments(10, 0),
            Err(DownloadError::InvalidSize {
                segment_size: 0,
                ..
            })
        ));
    }
}
