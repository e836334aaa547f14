//! 分段计划：把 `[0, size)` 切成若干连续、不重叠的字节区间。
//!
//! 计划只由 `(size, threads, min_segment_size)` 决定，同样的输入永远得到同样的边界，
//! 断点续传依赖这一点。

use super::models::Segment;

/// 单个分段的默认最小长度（64 KiB）。
pub const DEFAULT_MIN_SEGMENT_SIZE: u64 = 64 * 1024;

pub fn plan_segments(size: u64, threads: usize) -> Vec<Segment> {
    plan_segments_with_min(size, threads, DEFAULT_MIN_SEGMENT_SIZE)
}

pub fn plan_segments_with_min(size: u64, threads: usize, min_segment_size: u64) -> Vec<Segment> {
    if size == 0 {
        return Vec::new();
    }

    let count = effective_threads(size, threads, min_segment_size) as u64;
    let chunk = size.div_ceil(count);
    // 向上取整后末段可能为空，按实际块数重新计算
    let count = size.div_ceil(chunk);

    (0..count)
        .map(|i| {
            let start = i * chunk;
            let end = ((i + 1) * chunk).min(size) - 1;
            Segment::new(i as usize, start, end)
        })
        .collect()
}

/// 实际并发数：不超过 `threads`，且每段不小于 `min_segment_size`（至少 1）。
pub fn effective_threads(size: u64, threads: usize, min_segment_size: u64) -> usize {
    let threads = threads.max(1) as u64;
    let by_size = (size / min_segment_size.max(1)).max(1);
    threads.min(by_size) as usize
}

/// 校验分段是否按编号连续覆盖 `[0, size)`。
pub fn validate_layout(segments: &[Segment], size: u64) -> bool {
    if size == 0 {
        return segments.is_empty();
    }
    let mut expected = 0u64;
    for (i, seg) in segments.iter().enumerate() {
        if seg.index != i || seg.start != expected || seg.end < seg.start || seg.end >= size {
            return false;
        }
        expected = seg.end + 1;
    }
    expected == size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(segments: &[Segment]) -> Vec<u64> {
        segments.iter().map(Segment::len).collect()
    }

    #[test]
    fn even_split_of_one_million() {
        let segs = plan_segments(1_000_000, 4);
        assert_eq!(sizes(&segs), vec![250_000; 4]);
        assert_eq!(segs[3].end, 999_999);
    }

    #[test]
    fn tiny_file_collapses_to_one_segment() {
        let segs = plan_segments(10, 8);
        assert_eq!(segs.len(), 1);
        assert_eq!((segs[0].start, segs[0].end), (0, 9));
    }

    #[test]
    fn minimum_segment_size_caps_mid_sized_files() {
        // 1_000_000 / 64 KiB = 15，16 个线程也只切 15 段
        let segs = plan_segments(1_000_000, 16);
        assert_eq!(segs.len(), 15);
        assert_eq!(sizes(&segs[..14]), vec![66_667; 14]);
        assert_eq!(segs[14].len(), 66_662);
        assert!(validate_layout(&segs, 1_000_000));

        // 去掉下限后回到 ⌈size/T⌉ 等分
        let segs = plan_segments_with_min(1_000_000, 16, 1);
        assert_eq!(sizes(&segs), vec![62_500; 16]);
    }

    #[test]
    fn last_segment_absorbs_remainder() {
        let segs = plan_segments_with_min(10, 4, 1);
        assert_eq!(sizes(&segs), vec![3, 3, 3, 1]);
    }

    #[test]
    fn empty_tail_is_dropped() {
        // ⌈9/4⌉ = 3 → 3 段即可覆盖，不产生零长度段
        let segs = plan_segments_with_min(9, 4, 1);
        assert_eq!(sizes(&segs), vec![3, 3, 3]);
    }

    #[test]
    fn size_smaller_than_threads() {
        let segs = plan_segments_with_min(3, 8, 1);
        assert_eq!(sizes(&segs), vec![1, 1, 1]);
    }

    #[test]
    fn zero_threads_means_one() {
        let segs = plan_segments_with_min(100, 0, 1);
        assert_eq!(segs.len(), 1);
    }

    #[test]
    fn zero_size_has_no_segments() {
        assert!(plan_segments(0, 8).is_empty());
        assert!(validate_layout(&[], 0));
    }

    #[test]
    fn coverage_property_over_grid() {
        for size in (1..300u64).chain([1_000, 4_096, 65_537, 1_000_003]) {
            for threads in 1..=17 {
                for min in [1, 7, 64] {
                    let segs = plan_segments_with_min(size, threads, min);
                    assert!(!segs.is_empty());
                    assert!(segs.len() <= threads);
                    assert!(segs.iter().all(|s| s.len() > 0));
                    assert!(validate_layout(&segs, size), "size={size} threads={threads}");
                    assert_eq!(segs.iter().map(Segment::len).sum::<u64>(), size);
                    assert_eq!(segs, plan_segments_with_min(size, threads, min));
                }
            }
        }
    }

    #[test]
    fn layout_validation_rejects_gaps_and_overlaps() {
        let gap = vec![Segment::new(0, 0, 4), Segment::new(1, 6, 9)];
        assert!(!validate_layout(&gap, 10));
        let overlap = vec![Segment::new(0, 0, 5), Segment::new(1, 5, 9)];
        assert!(!validate_layout(&overlap, 10));
        let short = vec![Segment::new(0, 0, 4)];
        assert!(!validate_layout(&short, 10));
        let ok = vec![Segment::new(0, 0, 4), Segment::new(1, 5, 9)];
        assert!(validate_layout(&ok, 10));
    }
}
