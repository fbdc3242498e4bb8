// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh
// -----
// Created Date: 2024/03/04 10:21:37

use std::{fmt::Debug, io};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use webparse::{BinaryMut, WebError};

pub enum ProxyError<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    IoError(io::Error),
    WebError(WebError),
    /// 该错误发生协议不可被解析, 则尝试下一个协议
    Continue((Option<BinaryMut>, T)),
    /// 协议帧无法解码, 需转入丢弃处理, 不可直接断开
    MalformedRequest(&'static str),
    /// 密码摘要未匹配到任何配置
    AuthenticationRejected,
    /// 路由规则未给出出口
    RouteDenied,
    /// 出口连接失败
    OutboundConnectFailed(io::Error),
    VerifyFail,
    Timeout,
    SizeNotMatch,
    ProtErr,
    ProtNoSupport,
    Extension(&'static str),
}

impl<T> ProxyError<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// 仅协议解码失败需要转入丢弃处理
    pub fn is_contained(&self) -> bool {
        matches!(self, ProxyError::MalformedRequest(_))
    }

    /// 可预期的结束, 连接已经在刷新后关闭, 无需按错误记录
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            ProxyError::AuthenticationRejected
                | ProxyError::RouteDenied
                | ProxyError::OutboundConnectFailed(_)
                | ProxyError::VerifyFail
                | ProxyError::Timeout
        )
    }

    /// 对端重置或提前关闭, 属于正常的连接结束
    pub fn is_peer_closed(&self) -> bool {
        match self {
            ProxyError::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    pub fn to_type<B>(self) -> ProxyError<B>
    where
        B: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            ProxyError::IoError(e) => ProxyError::IoError(e),
            ProxyError::WebError(e) => ProxyError::WebError(e),
            ProxyError::Continue(_) => ProxyError::Extension("continue can't convert"),
            ProxyError::MalformedRequest(s) => ProxyError::MalformedRequest(s),
            ProxyError::AuthenticationRejected => ProxyError::AuthenticationRejected,
            ProxyError::RouteDenied => ProxyError::RouteDenied,
            ProxyError::OutboundConnectFailed(e) => ProxyError::OutboundConnectFailed(e),
            ProxyError::VerifyFail => ProxyError::VerifyFail,
            ProxyError::Timeout => ProxyError::Timeout,
            ProxyError::SizeNotMatch => ProxyError::SizeNotMatch,
            ProxyError::ProtErr => ProxyError::ProtErr,
            ProxyError::ProtNoSupport => ProxyError::ProtNoSupport,
            ProxyError::Extension(s) => ProxyError::Extension(s),
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError<TcpStream>>;
pub type ProxyTypeResult<T, B> = Result<T, ProxyError<B>>;

impl<T> From<io::Error> for ProxyError<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn from(value: io::Error) -> Self {
        ProxyError::IoError(value)
    }
}

impl<T> From<WebError> for ProxyError<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn from(value: WebError) -> Self {
        ProxyError::WebError(value)
    }
}

impl<T> From<tokio::time::error::Elapsed> for ProxyError<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProxyError::Timeout
    }
}

impl<T> Debug for ProxyError<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(arg0) => f.debug_tuple("IoError").field(arg0).finish(),
            Self::WebError(arg0) => f.debug_tuple("WebError").field(arg0).finish(),
            Self::Continue(_arg0) => f.debug_tuple("Continue").finish(),
            Self::MalformedRequest(arg0) => f.debug_tuple("MalformedRequest").field(arg0).finish(),
            Self::AuthenticationRejected => write!(f, "AuthenticationRejected"),
            Self::RouteDenied => write!(f, "RouteDenied"),
            Self::OutboundConnectFailed(arg0) => {
                f.debug_tuple("OutboundConnectFailed").field(arg0).finish()
            }
            Self::VerifyFail => write!(f, "VerifyFail"),
            Self::Timeout => write!(f, "Timeout"),
            Self::SizeNotMatch => write!(f, "SizeNotMatch"),
            Self::ProtErr => write!(f, "ProtErr"),
            Self::ProtNoSupport => write!(f, "ProtNoSupport"),
            Self::Extension(arg0) => f.debug_tuple("Extension").field(arg0).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use tokio::net::TcpStream;

    use super::ProxyError;

    #[test]
    fn classify_errors() {
        let reset: ProxyError<TcpStream> = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(reset.is_peer_closed());
        assert!(!reset.is_graceful());

        let other: ProxyError<TcpStream> = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(!other.is_peer_closed());
        assert!(!other.is_graceful());
        assert!(!other.is_contained());

        let malformed: ProxyError<TcpStream> = ProxyError::MalformedRequest("frame too short");
        assert!(malformed.is_contained());
        assert!(!malformed.is_peer_closed());
        assert!(ProxyError::<TcpStream>::RouteDenied.is_graceful());
    }
}
