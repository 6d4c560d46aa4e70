//! 流式进度估计
//!
//! 这是给界面用的启发式：按已生成字符数相对预期长度的比例估算，封顶 0.99，只有终止事件才报告 1.0。
//! 它不保证与真实完成度一致（模型可能写得比预期长或短），不能作为正确性依据。

/// 流式过程中可报告的最大进度
pub const MAX_PARTIAL_PROGRESS: f32 = 0.99;

/// 已生成 `generated_chars` 个字符、预期 `expected_chars` 个字符时的进度估计
pub fn estimate_progress(generated_chars: usize, expected_chars: usize) -> f32 {
    if expected_chars == 0 {
        return MAX_PARTIAL_PROGRESS;
    }
    let ratio = generated_chars as f32 / expected_chars as f32;
    ratio.clamp(0.0, MAX_PARTIAL_PROGRESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_saturates_below_one() {
        assert_eq!(estimate_progress(0, 1000), 0.0);
        assert!((estimate_progress(500, 1000) - 0.5).abs() < f32::EPSILON);
        assert_eq!(estimate_progress(5000, 1000), MAX_PARTIAL_PROGRESS);
        assert_eq!(estimate_progress(10, 0), MAX_PARTIAL_PROGRESS);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut last = 0.0;
        for n in (0..3000).step_by(37) {
            let p = estimate_progress(n, 2000);
            assert!(p >= last);
            last = p;
        }
    }
}
