//! MSA 二进制帧协议编解码
//!
//! 帧格式：16 字节报文头 + UTF-8 JSON 报文体。
//!
//! ```text
//! 0        4        8        12       16
//! +--------+--------+--------+--------+----------------------+
//! |  type  |  uid   | length |serialId|  body (length bytes) |
//! +--------+--------+--------+--------+----------------------+
//! ```
//!
//! 报文头四个字段均为大端 u32。报文体中的 `func` 字段决定帧类型。
//! 本模块不做任何 I/O；[`MsaCodec`] 仅用于在 `FramedRead` 上切帧。

use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio_util::codec::{Decoder, Encoder};

/// 报文头长度（字节）
pub const HEADER_LEN: usize = 16;

/// 本网关发出的所有帧的 type 值：ASCII 'N'（无符号、网络字节序、4 字节字段）
pub const FRAME_TYPE_N: u32 = b'N' as u32;

/// 单帧报文体上限
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// TemplateData 的数据级别
pub const TEMPLATE_DATA_LEVEL: u32 = 103;

/// 报文体 `func` 编码表
pub struct FuncCode;

impl FuncCode {
    pub const PING: u32 = 1;
    pub const TEMPLATE_DATA: u32 = 10;
    pub const PONG: u32 = 81;
    pub const DEVICE_NOT_REGISTERED: u32 = 101;

    // 协议表中以下三项共用编码 7，无法在解码时区分。
    // 在协议负责方给出独立编码前保持原值，解码统一落入 FrameBody::Other。
    pub const HISTORY_STATE: u32 = 7;
    pub const CHANGE_DATA: u32 = 7;
    pub const CHANGE_STATE: u32 = 7;
}

/// 报文头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: u32,
    pub uid: u32,
    pub length: u32,
    pub serial_id: u32,
}

impl FrameHeader {
    /// 从缓冲区前 16 字节解析报文头（大端）。
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::ShortHeader(buf.len()));
        }
        let mut buf = &buf[..HEADER_LEN];
        Ok(Self {
            frame_type: buf.get_u32(),
            uid: buf.get_u32(),
            length: buf.get_u32(),
            serial_id: buf.get_u32(),
        })
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u32(self.frame_type);
        dst.put_u32(self.uid);
        dst.put_u32(self.length);
        dst.put_u32(self.serial_id);
    }
}

/// 模板数据（func = 10）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateData {
    /// 网关 ID
    #[serde(default)]
    pub gid: String,
    /// 模板 ID
    #[serde(default)]
    pub ptid: String,
    /// 通道 ID
    #[serde(default)]
    pub cid: String,
    /// 本地时间字符串
    #[serde(default)]
    pub time: String,
    /// 采集耗时（毫秒）
    #[serde(default)]
    pub consume: u64,
    /// 错误码
    #[serde(default)]
    pub err: i32,
    #[serde(default = "default_level")]
    pub level: u32,
    /// 点位编码 → 值
    #[serde(default)]
    pub points: BTreeMap<String, Value>,
}

fn default_level() -> u32 {
    TEMPLATE_DATA_LEVEL
}

/// 报文体
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    Ping,
    Pong { msg: Option<String> },
    DeviceNotRegistered { msg: Option<String> },
    TemplateData(TemplateData),
    /// 未识别或有歧义的 func（包括编码 7），原样保留
    Other { func: u32, payload: Map<String, Value> },
}

impl FrameBody {
    pub fn func(&self) -> u32 {
        match self {
            FrameBody::Ping => FuncCode::PING,
            FrameBody::Pong { .. } => FuncCode::PONG,
            FrameBody::DeviceNotRegistered { .. } => FuncCode::DEVICE_NOT_REGISTERED,
            FrameBody::TemplateData(_) => FuncCode::TEMPLATE_DATA,
            FrameBody::Other { func, .. } => *func,
        }
    }

    fn to_json(&self) -> Result<Value, CodecError> {
        let mut object = match self {
            FrameBody::Ping => Map::new(),
            FrameBody::Pong { msg } | FrameBody::DeviceNotRegistered { msg } => {
                let mut object = Map::new();
                if let Some(msg) = msg {
                    object.insert("msg".to_string(), Value::String(msg.clone()));
                }
                object
            }
            FrameBody::TemplateData(data) => match serde_json::to_value(data)? {
                Value::Object(object) => object,
                other => {
                    return Err(CodecError::InvalidBody(format!(
                        "template data serialized to {}",
                        other
                    )));
                }
            },
            FrameBody::Other { payload, .. } => payload.clone(),
        };
        object.insert("func".to_string(), Value::from(self.func()));
        Ok(Value::Object(object))
    }

    fn from_json(body: &[u8]) -> Result<Self, CodecError> {
        let mut object = match serde_json::from_slice::<Value>(body)? {
            Value::Object(object) => object,
            _ => return Err(CodecError::InvalidBody("body is not a json object".to_string())),
        };
        let func = object
            .remove("func")
            .and_then(|value| value.as_u64())
            .and_then(|value| u32::try_from(value).ok())
            .ok_or_else(|| CodecError::InvalidBody("missing func".to_string()))?;

        let msg = object.get("msg").and_then(Value::as_str).map(str::to_string);
        let body = match func {
            FuncCode::PING => FrameBody::Ping,
            FuncCode::PONG => FrameBody::Pong { msg },
            FuncCode::DEVICE_NOT_REGISTERED => FrameBody::DeviceNotRegistered { msg },
            FuncCode::TEMPLATE_DATA => {
                FrameBody::TemplateData(serde_json::from_value(Value::Object(object))?)
            }
            _ => FrameBody::Other {
                func,
                payload: object,
            },
        };
        Ok(body)
    }
}

/// 完整的 MSA 帧。`length` 不单独存储，由编码时的报文体长度决定。
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_type: u32,
    pub uid: u32,
    pub serial_id: u32,
    pub body: FrameBody,
}

impl Frame {
    /// 构造本网关发出的帧（type 固定为 'N'）。
    pub fn new(uid: u32, serial_id: u32, body: FrameBody) -> Self {
        Self {
            frame_type: FRAME_TYPE_N,
            uid,
            serial_id,
            body,
        }
    }
}

/// 编码：先序列化报文体，再按报文体长度写报文头。
pub fn encode(frame: &Frame) -> Result<Bytes, CodecError> {
    let mut dst = BytesMut::new();
    encode_into(frame, &mut dst)?;
    Ok(dst.freeze())
}

fn encode_into(frame: &Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
    let body = serde_json::to_vec(&frame.body.to_json()?)?;
    let length = u32::try_from(body.len()).map_err(|_| CodecError::FrameTooLarge(body.len()))?;
    let header = FrameHeader {
        frame_type: frame.frame_type,
        uid: frame.uid,
        length,
        serial_id: frame.serial_id,
    };
    dst.reserve(HEADER_LEN + body.len());
    header.write(dst);
    dst.put_slice(&body);
    Ok(())
}

/// 解码：报文头不足 16 字节或报文体短于声明长度均视为错误帧，不做补齐。
///
/// 声明长度之后的多余字节被忽略。
pub fn decode(buf: &[u8]) -> Result<Frame, CodecError> {
    let header = FrameHeader::parse(buf)?;
    let declared = header.length as usize;
    let available = buf.len() - HEADER_LEN;
    if available < declared {
        return Err(CodecError::ShortBody {
            declared,
            actual: available,
        });
    }
    let body = &buf[HEADER_LEN..HEADER_LEN + declared];
    Frame::from_parts(header, body)
}

impl Frame {
    fn from_parts(header: FrameHeader, body: &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            frame_type: header.frame_type,
            uid: header.uid,
            serial_id: header.serial_id,
            body: FrameBody::from_json(body)?,
        })
    }
}

/// 已切分但尚未解析报文体的帧
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl RawFrame {
    /// 解析报文体。失败时调用方丢弃该帧，会话继续。
    pub fn into_frame(self) -> Result<Frame, CodecError> {
        Frame::from_parts(self.header, &self.body)
    }
}

/// 流式切帧编解码器（配合 `FramedRead` / `FramedWrite`）
#[derive(Debug, Clone)]
pub struct MsaCodec {
    max_body_len: usize,
}

impl Default for MsaCodec {
    fn default() -> Self {
        Self {
            max_body_len: MAX_BODY_LEN,
        }
    }
}

impl MsaCodec {
    pub fn with_max_body_len(max_body_len: usize) -> Self {
        Self { max_body_len }
    }
}

impl Decoder for MsaCodec {
    type Item = RawFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = FrameHeader::parse(&src[..HEADER_LEN])?;
        let body_len = header.length as usize;
        if body_len > self.max_body_len {
            return Err(CodecError::FrameTooLarge(body_len));
        }
        let total = HEADER_LEN + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(total);
        let body = frame.split_off(HEADER_LEN).freeze();
        Ok(Some(RawFrame { header, body }))
    }
}

impl Encoder<Frame> for MsaCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_into(&item, dst)
    }
}
