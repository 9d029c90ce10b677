//! 协议错误类型定义

/// MSA 帧编解码错误
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// 报文头不足 16 字节
    #[error("short header: need 16 bytes, got {0}")]
    ShortHeader(usize),

    /// 报文体短于声明长度
    #[error("short body: declared {declared} bytes, got {actual}")]
    ShortBody { declared: usize, actual: usize },

    /// 报文体超过上限
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// 报文体 JSON 解析/序列化失败
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// 报文体不是 JSON 对象或缺少 func
    #[error("invalid body: {0}")]
    InvalidBody(String),

    /// IO 错误（流式解码）
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 协议通信错误
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// 连接错误
    #[error("connection error: {0}")]
    Connection(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 编解码错误
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Modbus 错误
    #[error("modbus error: {0}")]
    Modbus(String),

    /// MQTT 错误
    #[error("mqtt error: {0}")]
    Mqtt(String),

    /// 配置解析错误
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// 链路未连接
    #[error("not connected: {0}")]
    NotConnected(String),

    /// 超时错误
    #[error("timeout: {0}")]
    Timeout(String),

    /// 通道关闭
    #[error("channel closed")]
    ChannelClosed,
}
