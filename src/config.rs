/// 端点配置
///
/// 构造后不可变。可以通过 builder 方法、serde（TOML / JSON）或者 URL 查询参数得到。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::TransportError;

/// HTTP 会话默认静默超时
pub const HTTP_SILENCE_TIMEOUT: Duration = Duration::from_secs(85);

/// 端点配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// 编解码累积缓冲区初始大小
    pub init_buffer_size: usize,
    /// 编解码累积缓冲区上限（单条消息的最大字节数）
    pub max_buffer_size: usize,
    /// 每次异步接收使用的缓冲区大小
    pub recv_buffer_size: usize,
    /// SO_SNDBUF
    pub so_sndbuf: Option<usize>,
    /// SO_RCVBUF
    pub so_rcvbuf: Option<usize>,
    /// TCP_NODELAY
    pub nodelay: bool,
    /// 静默超时：无收发活动超过该时长则停止端点
    pub silence_timeout: Option<Duration>,
    /// 连接（打开传输）超时
    pub connect_timeout: Option<Duration>,
    /// 接收缓冲区管理器最多跟踪多少个被监听器保留的缓冲区
    pub max_tracked_buffers: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            init_buffer_size: 8 * 1024,
            max_buffer_size: 8 * 1024 * 1024,
            recv_buffer_size: 4096,
            so_sndbuf: None,
            so_rcvbuf: None,
            nodelay: true,
            silence_timeout: None,
            connect_timeout: Some(Duration::from_secs(10)),
            max_tracked_buffers: 64,
        }
    }
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 验证配置
    ///
    /// 接收缓冲区大小不在这里检查：零容量缓冲区在第一次接收之前被检测，
    /// 作为致命配置错误停止端点。
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.init_buffer_size == 0 {
            return Err(TransportError::config_error("init_buffer_size", "must be > 0"));
        }
        if self.max_buffer_size < self.init_buffer_size {
            return Err(TransportError::config_error(
                "max_buffer_size",
                format!(
                    "must be >= init_buffer_size ({} < {})",
                    self.max_buffer_size, self.init_buffer_size
                ),
            ));
        }
        if self.so_sndbuf == Some(0) {
            return Err(TransportError::config_error("so_sndbuf", "must be > 0 when set"));
        }
        if self.so_rcvbuf == Some(0) {
            return Err(TransportError::config_error("so_rcvbuf", "must be > 0 when set"));
        }
        if self.silence_timeout == Some(Duration::ZERO) {
            return Err(TransportError::config_error("silence_timeout", "must be > 0 when set"));
        }
        if self.connect_timeout == Some(Duration::ZERO) {
            return Err(TransportError::config_error("connect_timeout", "must be > 0 when set"));
        }
        Ok(())
    }

    pub fn with_init_buffer_size(mut self, size: usize) -> Self {
        self.init_buffer_size = size;
        self
    }

    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    pub fn with_so_sndbuf(mut self, size: usize) -> Self {
        self.so_sndbuf = Some(size);
        self
    }

    pub fn with_so_rcvbuf(mut self, size: usize) -> Self {
        self.so_rcvbuf = Some(size);
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_silence_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.silence_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_tracked_buffers(mut self, count: usize) -> Self {
        self.max_tracked_buffers = count;
        self
    }

    /// 低延迟预设
    pub fn low_latency() -> Self {
        Self::default()
            .with_nodelay(true)
            .with_recv_buffer_size(1024)
            .with_init_buffer_size(1024)
    }

    /// 高吞吐量预设
    pub fn high_throughput() -> Self {
        Self::default()
            .with_recv_buffer_size(64 * 1024)
            .with_init_buffer_size(64 * 1024)
            .with_so_sndbuf(256 * 1024)
            .with_so_rcvbuf(256 * 1024)
    }

    /// 从 URL 解析目标地址与配置
    ///
    /// ```text
    /// tcp://127.0.0.1:8080/?recv_buffer_size=1024&so_sndbuf=65536&silence_timeout=30000
    /// ```
    ///
    /// 时长参数以毫秒为单位，`0` 表示关闭该定时器。未知参数被视为配置错误。
    pub fn from_url(input: &str) -> Result<(EndpointTarget, Self), TransportError> {
        let url = Url::parse(input)
            .map_err(|e| TransportError::config_error("url", format!("invalid url '{}': {}", input, e)))?;

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::config_error("url", format!("missing host in '{}'", input)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| TransportError::config_error("url", format!("missing port in '{}'", input)))?;

        let mut config = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "init_buffer_size" => config.init_buffer_size = parse_number(&key, &value)?,
                "max_buffer_size" => config.max_buffer_size = parse_number(&key, &value)?,
                "recv_buffer_size" => config.recv_buffer_size = parse_number(&key, &value)?,
                "so_sndbuf" => config.so_sndbuf = Some(parse_number(&key, &value)?),
                "so_rcvbuf" => config.so_rcvbuf = Some(parse_number(&key, &value)?),
                "max_tracked_buffers" => config.max_tracked_buffers = parse_number(&key, &value)?,
                "silence_timeout" => config.silence_timeout = parse_millis(&key, &value)?,
                "connect_timeout" => config.connect_timeout = parse_millis(&key, &value)?,
                "nodelay" => {
                    config.nodelay = value.parse().map_err(|_| {
                        TransportError::config_error("nodelay", format!("expected true/false, got '{}'", value))
                    })?
                }
                other => {
                    return Err(TransportError::config_error(other, "unknown url parameter"));
                }
            }
        }

        config.validate()?;

        let target = EndpointTarget {
            scheme: url.scheme().to_string(),
            host,
            port,
        };
        Ok((target, config))
    }
}

/// URL 中解析出的目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl EndpointTarget {
    /// `host:port` 形式，可以直接交给 tokio 做地址解析
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize, TransportError> {
    value
        .parse()
        .map_err(|_| TransportError::config_error(key, format!("expected a number, got '{}'", value)))
}

fn parse_millis(key: &str, value: &str) -> Result<Option<Duration>, TransportError> {
    let millis = parse_number(key, value)?;
    Ok((millis > 0).then(|| Duration::from_millis(millis as u64)))
}
