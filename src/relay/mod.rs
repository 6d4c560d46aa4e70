//! 事件中继：把事件编码为 SSE 帧
//!
//! 每个事件一帧 `data: <单行 JSON>\n\n`，不合并、不重排。JSON 紧凑输出，Markdown 中的换行被转义，
//! 不会破坏帧边界。`decode_frames` / `FrameDecoder` 供测试与客户端使用。

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

const DATA_PREFIX: &str = "data:";
const FRAME_END: &str = "\n\n";

/// 编码单个事件为一帧
pub fn encode<E: Serialize>(event: &E) -> Bytes {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("event serialization failed: {}", e);
            serde_json::json!({ "type": "error", "message": format!("serialization failed: {}", e) })
                .to_string()
        }
    };
    Bytes::from(format!("{} {}{}", DATA_PREFIX, json, FRAME_END))
}

fn parse_frame<E: DeserializeOwned>(frame: &str) -> Option<Result<E, serde_json::Error>> {
    let payload: String = frame
        .lines()
        .filter_map(|line| line.strip_prefix(DATA_PREFIX))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect::<Vec<_>>()
        .join("\n");
    if payload.is_empty() {
        return None;
    }
    Some(serde_json::from_str(&payload))
}

/// 解析完整文本中的所有帧（忽略结尾不完整的帧）
pub fn decode_frames<E: DeserializeOwned>(text: &str) -> Result<Vec<E>, serde_json::Error> {
    let mut decoder = FrameDecoder::new();
    decoder.push(text)
}

/// 增量帧解码器：网络分片可能在任意位置切开帧
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一段数据，返回其中已完整的帧
    pub fn push<E: DeserializeOwned>(&mut self, chunk: &str) -> Result<Vec<E>, serde_json::Error> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(end) = self.buffer.find(FRAME_END) {
            let frame: String = self.buffer.drain(..end + FRAME_END.len()).collect();
            if let Some(event) = parse_frame(&frame) {
                events.push(event?);
            }
        }
        Ok(events)
    }

    /// 尚未成帧的剩余数据
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineEvent;
    use crate::stage::StageId;

    #[test]
    fn test_multiline_markdown_stays_in_one_frame() {
        let event = PipelineEvent::Progress {
            stage: StageId::Evidence,
            fraction: 0.3,
            partial_document: "## 量规\n\n| 维度 | 标准 |\n|---|---|\n\ndata: 伪造帧".into(),
        };
        let frame = encode(&event);
        let text = std::str::from_utf8(&frame).unwrap();

        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("}\n\n"));
        assert_eq!(text.matches("\n\n").count(), 1);

        let decoded: Vec<PipelineEvent> = decode_frames(text).unwrap();
        assert_eq!(decoded, vec![event]);
    }

    #[test]
    fn test_decoder_handles_split_frames() {
        let events = vec![
            PipelineEvent::Start {
                stages: vec![StageId::Foundation],
            },
            PipelineEvent::Error {
                stage: Some(StageId::Foundation),
                message: "Backend error: boom".into(),
            },
        ];
        let wire: String = events
            .iter()
            .map(|e| String::from_utf8(encode(e).to_vec()).unwrap())
            .collect();

        let mut decoder = FrameDecoder::new();
        let mut decoded: Vec<PipelineEvent> = Vec::new();
        let (head, tail) = wire.split_at(7);
        decoded.extend(decoder.push::<PipelineEvent>(head).unwrap());
        assert!(decoded.is_empty());
        decoded.extend(decoder.push::<PipelineEvent>(tail).unwrap());

        assert_eq!(decoded, events);
        assert!(decoder.pending().is_empty());
    }
}
