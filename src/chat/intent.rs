//! 重新生成意图识别
//!
//! 回复以 `[REGENERATE:STAGE_<1|2|3>:<修改说明>]` 开头时视为请求重新生成该阶段。
//! 标记必须位于回复的第 0 个字符；不在开头的同形文本只是普通内容。
//! 形似标记但无法解析（阶段号越界、未闭合、说明为空）时按「无标记」处理，只记 debug 日志。

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::stage::StageId;

const MARKER_PREFIX: &str = "[REGENERATE:";

static MARKER_RE: OnceLock<Regex> = OnceLock::new();

fn marker_re() -> &'static Regex {
    MARKER_RE.get_or_init(|| {
        Regex::new(r"^\[REGENERATE:STAGE_([1-3]):([^\]\n]*)\]").expect("marker pattern is valid")
    })
}

/// 识别出的重新生成意图
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegenerateIntent {
    pub stage: StageId,
    pub instructions: String,
}

/// 标记解析失败的原因（仅内部使用，不对外暴露）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarkerError {
    #[error("no marker at the start of the reply")]
    Absent,
    #[error("malformed marker: {0}")]
    Malformed(String),
}

/// 从完整回复的开头解析标记
pub fn parse_marker(reply: &str) -> Result<RegenerateIntent, MarkerError> {
    if !reply.starts_with(MARKER_PREFIX) {
        return Err(MarkerError::Absent);
    }
    let head: String = reply.lines().next().unwrap_or_default().chars().take(200).collect();
    let caps = marker_re()
        .captures(reply)
        .ok_or_else(|| MarkerError::Malformed(head.clone()))?;

    let stage = caps
        .get(1)
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .and_then(StageId::from_index)
        .ok_or_else(|| MarkerError::Malformed(head.clone()))?;
    let instructions = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
    if instructions.is_empty() {
        return Err(MarkerError::Malformed(head));
    }

    Ok(RegenerateIntent {
        stage,
        instructions: instructions.to_string(),
    })
}

#[derive(Debug)]
enum DetectorState {
    /// 目前为止的回复仍可能是标记
    Pending(String),
    /// 已拿到完整的标记头（到 `]` 或行尾为止）
    Captured(String),
    /// 已确定不是标记，不再缓存
    NotMarker,
}

/// 增量意图检测器：只在回复仍可能是标记时缓存开头部分
#[derive(Debug)]
pub struct IntentDetector {
    state: DetectorState,
}

impl Default for IntentDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentDetector {
    pub fn new() -> Self {
        Self {
            state: DetectorState::Pending(String::new()),
        }
    }

    pub fn push(&mut self, chunk: &str) {
        let DetectorState::Pending(buffer) = &mut self.state else {
            return;
        };
        buffer.push_str(chunk);

        if buffer.starts_with(MARKER_PREFIX) {
            if let Some(end) = buffer.find([']', '\n']) {
                let head = buffer[..=end].to_string();
                self.state = DetectorState::Captured(head);
            }
        } else if !MARKER_PREFIX.starts_with(buffer.as_str()) {
            self.state = DetectorState::NotMarker;
        }
    }

    /// 回复结束后给出结果
    pub fn finish(self) -> Result<RegenerateIntent, MarkerError> {
        match self.state {
            DetectorState::Captured(head) => parse_marker(&head),
            DetectorState::Pending(buffer) => parse_marker(&buffer),
            DetectorState::NotMarker => Err(MarkerError::Absent),
        }
    }

    /// 回复结束后的意图；解析失败只记日志
    pub fn into_intent(self) -> Option<RegenerateIntent> {
        accept(self.finish())
    }
}

/// 完整回复的意图（非流式路径）；解析失败只记日志
pub fn detect_intent(reply: &str) -> Option<RegenerateIntent> {
    accept(parse_marker(reply))
}

fn accept(parsed: Result<RegenerateIntent, MarkerError>) -> Option<RegenerateIntent> {
    match parsed {
        Ok(intent) => Some(intent),
        Err(MarkerError::Absent) => None,
        Err(e) => {
            tracing::debug!("ignoring reply marker: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(chunks: &[&str]) -> Result<RegenerateIntent, MarkerError> {
        let mut detector = IntentDetector::new();
        for chunk in chunks {
            detector.push(chunk);
        }
        detector.finish()
    }

    #[test]
    fn test_marker_at_start_is_detected() {
        let intent = parse_marker("[REGENERATE:STAGE_2:调整课时安排]\n后续内容").unwrap();
        assert_eq!(intent.stage, StageId::Evidence);
        assert_eq!(intent.instructions, "调整课时安排");
    }

    #[test]
    fn test_plain_reply_has_no_intent() {
        assert_eq!(parse_marker("为什么要这样设计？"), Err(MarkerError::Absent));
    }

    #[test]
    fn test_marker_not_at_start_is_ignored() {
        assert_eq!(
            parse_marker("一些前言\n[REGENERATE:STAGE_1:x]\n更多内容"),
            Err(MarkerError::Absent)
        );
        assert_eq!(
            parse_marker(" [REGENERATE:STAGE_1:x]"),
            Err(MarkerError::Absent)
        );
    }

    #[test]
    fn test_malformed_markers() {
        for reply in [
            "[REGENERATE:STAGE_7:x]",
            "[REGENERATE:STAGE_1:   ]",
            "[REGENERATE:STAGE_2:没有闭合\n下一行]",
            "[REGENERATE:STAGE_1",
            "[REGENERATE:stage_1:x]",
        ] {
            assert!(
                matches!(parse_marker(reply), Err(MarkerError::Malformed(_))),
                "{} should be malformed",
                reply
            );
        }
    }

    #[test]
    fn test_detector_across_chunk_boundaries() {
        let intent = detect(&["[REGEN", "ERATE:STA", "GE_3:增加实践", "活动]\n好的", "……"]).unwrap();
        assert_eq!(intent.stage, StageId::Blueprint);
        assert_eq!(intent.instructions, "增加实践活动");

        assert_eq!(detect(&["[REG", "ION] 说明"]), Err(MarkerError::Absent));
        assert_eq!(detect(&["为什么", "[REGENERATE:STAGE_1:x]"]), Err(MarkerError::Absent));
        assert_eq!(detect(&[]), Err(MarkerError::Absent));
        assert!(matches!(
            detect(&["[REGENERATE:STAGE_1:未闭合"]),
            Err(MarkerError::Malformed(_))
        ));
    }

    #[test]
    fn test_detector_stops_buffering_plain_replies() {
        let mut detector = IntentDetector::new();
        detector.push("这是一段很长的普通回复");
        assert!(matches!(detector.state, DetectorState::NotMarker));
        detector.push(&"x".repeat(10_000));
        assert!(detector.into_intent().is_none());
    }

    #[test]
    fn test_detect_intent_on_full_reply() {
        let intent = detect_intent("[REGENERATE:STAGE_1:聚焦数据隐私]\n好的，我会调整阶段一。").unwrap();
        assert_eq!(intent.stage, StageId::Foundation);
        assert_eq!(intent.instructions, "聚焦数据隐私");

        assert!(detect_intent("[REGENERATE:STAGE_4:越界]").is_none());
        assert!(detect_intent("好的\n[REGENERATE:STAGE_1:x]").is_none());
    }
}
