use std::sync::Arc;

use base64::{engine::general_purpose, Engine};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use webparse::{BinaryMut, Buf, HttpError, Method, WebError};

use crate::{
    error::ProxyTypeResult, outbound::OutboundResolver, Helper, Odor, Protocol, ProxyError, Relay,
};

/// 请求头的最大长度, 超过时不再继续读取
const MAX_HEADER_SIZE: usize = 0x10000;

const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const RESPONSE_AUTH_REQUIRED: &[u8] = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\nContent-Length: 0\r\n\r\n";
const RESPONSE_UNAVAILABLE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n";

/// http代理, CONNECT建立隧道, 其它请求原样转发已读取的数据
pub struct ProxyHttp {
    username: Option<String>,
    password: Option<String>,
    tag: String,
    resolver: Arc<dyn OutboundResolver>,
}

impl ProxyHttp {
    pub fn new(
        username: Option<String>,
        password: Option<String>,
        tag: String,
        resolver: Arc<dyn OutboundResolver>,
    ) -> Self {
        Self {
            username,
            password,
            tag,
            resolver,
        }
    }

    /// 校验 "Basic base64(user:pass)"
    pub fn check_basic_auth(&self, value: &str) -> bool {
        let (username, password) = match (&self.username, &self.password) {
            (Some(u), Some(p)) => (u, p),
            _ => return true,
        };
        let mut vals = value.split_whitespace();
        match vals.next() {
            Some(scheme) if scheme.eq_ignore_ascii_case("basic") => {}
            _ => return false,
        }
        let decoded = match vals.next().map(|v| general_purpose::STANDARD.decode(v)) {
            Some(Ok(decoded)) => decoded,
            _ => return false,
        };
        match String::from_utf8(decoded) {
            Ok(value) => match value.split_once(':') {
                Some((u, p)) => u == username && p == password,
                None => false,
            },
            Err(_) => false,
        }
    }

    /// 将"host:port"拆分, 支持"[::1]:443"格式, 端口缺省为80
    fn split_host(url: &str) -> Option<(String, u16)> {
        if let Some(rest) = url.strip_prefix('[') {
            let (host, left) = rest.split_once(']')?;
            let port = match left.strip_prefix(':') {
                Some(port) => port.parse().ok()?,
                None => 80,
            };
            return Some((host.to_string(), port));
        }
        match url.rsplit_once(':') {
            Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
            None => Some((url.to_string(), 80)),
        }
    }

    async fn err_server_status<T>(inbound: &mut T, data: &[u8])
    where
        T: AsyncWrite + Unpin,
    {
        let _ = inbound.write_all(data).await;
        Helper::close_on_flush(inbound).await;
    }

    pub async fn process<T>(
        &self,
        mut inbound: T,
        buffer: Option<BinaryMut>,
        id: String,
    ) -> ProxyTypeResult<(), T>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buffer = buffer.unwrap_or_else(|| BinaryMut::with_capacity(4096));
        let mut request;
        let host;
        let cost_size;
        loop {
            if !buffer.has_remaining() {
                buffer.reserve(4096);
                let size = Helper::read_once(&mut inbound, &mut buffer).await?;
                if size == 0 {
                    log::debug!("[{}] http inbound closed before request", id);
                    return Ok(());
                }
            }
            // socks的首字节为版本号, 交由socks处理
            if matches!(buffer.chunk()[0], 4 | 5) {
                return Err(ProxyError::Continue((Some(buffer), inbound)));
            }
            request = webparse::Request::new();
            // 此处clone为浅拷贝，不确定是否一定能解析成功，不能影响偏移
            match request.parse_buffer(&mut buffer.clone()) {
                Ok(s) => match request.get_connect_url() {
                    Some(url) => {
                        host = url;
                        cost_size = s;
                        break;
                    }
                    None => {
                        if !request.is_partial() {
                            Self::err_server_status(&mut inbound, RESPONSE_UNAVAILABLE).await;
                            return Err(ProxyError::ProtErr);
                        }
                    }
                },
                Err(WebError::Http(HttpError::Partial)) => {}
                Err(_) => {
                    return Err(ProxyError::Continue((Some(buffer), inbound)));
                }
            }
            if buffer.remaining() > MAX_HEADER_SIZE {
                Self::err_server_status(&mut inbound, RESPONSE_UNAVAILABLE).await;
                return Err(ProxyError::ProtErr);
            }
            buffer.reserve(4096);
            let size = Helper::read_once(&mut inbound, &mut buffer).await?;
            if size == 0 {
                return Err(ProxyError::ProtErr);
            }
        }

        if self.username.is_some() && self.password.is_some() {
            let auth = request
                .headers()
                .get_option_value(&"Proxy-Authorization")
                .and_then(|v| v.as_string())
                .map(|v| self.check_basic_auth(&v))
                .unwrap_or(false);
            if !auth {
                log::warn!("[{}] http proxy authorization failed", id);
                Self::err_server_status(&mut inbound, RESPONSE_AUTH_REQUIRED).await;
                return Err(ProxyError::VerifyFail);
            }
        }

        let (name, port) = match Self::split_host(&host) {
            Some(v) => v,
            None => {
                Self::err_server_status(&mut inbound, RESPONSE_UNAVAILABLE).await;
                return Err(ProxyError::ProtErr);
            }
        };
        let is_connect = matches!(request.method(), &Method::Connect);
        let odor = Odor::with_command(name, port, Protocol::Http, true, id.clone());
        log::info!(
            "http inbound: [{}], addr: {}, method: {:?}",
            id,
            odor.target_addr(),
            request.method()
        );

        let outbound = match self.resolver.resolve(&self.tag, &odor).await {
            Some(outbound) => outbound,
            None => {
                Self::err_server_status(&mut inbound, RESPONSE_UNAVAILABLE).await;
                return Err(ProxyError::RouteDenied);
            }
        };
        let target = match Relay::connect::<T>(&outbound, &odor).await {
            Ok(target) => target,
            Err(err) => {
                Self::err_server_status(&mut inbound, RESPONSE_UNAVAILABLE).await;
                return Err(err);
            }
        };

        if is_connect {
            inbound.write_all(RESPONSE_ESTABLISHED).await?;
            // 请求头之后客户端提前发出的数据
            let payload = buffer.chunk()[cost_size.min(buffer.remaining())..].to_vec();
            Relay::handoff(inbound, target, &odor, &payload).await
        } else {
            let payload = buffer.chunk().to_vec();
            Relay::handoff(inbound, target, &odor, &payload).await
        }
    }
}
