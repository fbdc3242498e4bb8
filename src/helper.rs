use std::{
    io,
    net::ToSocketAddrs,
    str::FromStr,
    sync::Mutex,
};

use lazy_static::lazy_static;
use log::{Level, LevelFilter};
use log4rs::{
    append::{console::ConsoleAppender, file::FileAppender},
    config::{Appender, Logger, Root},
    encode::pattern::PatternEncoder,
};
use socket2::{Domain, Socket, Type};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpListener,
};
use webparse::{BinaryMut, BufMut};

use crate::{ConfigOption, ProxyError, ProxyResult};

lazy_static! {
    static ref LOG4RS_HANDLE: Mutex<Option<log4rs::Handle>> = Mutex::new(None);
}

pub struct Helper;

impl Helper {
    #[cfg(not(target_os = "windows"))]
    fn set_reuse_port(socket: &Socket, reuse: bool) -> io::Result<()> {
        socket.set_reuse_port(reuse)?;
        Ok(())
    }

    #[cfg(target_os = "windows")]
    fn set_reuse_port(_socket: &Socket, _sreuse: bool) -> io::Result<()> {
        Ok(())
    }

    /// 可端口复用的绑定方式，该端口可能被多个进程同时使用
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<TcpListener> {
        let addrs = addr.to_socket_addrs()?;
        let mut last_err = None;
        for addr in addrs {
            let domain = if addr.is_ipv4() {
                Domain::IPV4
            } else {
                Domain::IPV6
            };
            let socket = Socket::new(domain, Type::STREAM, None)?;
            socket.set_nonblocking(true)?;
            let _ = socket.set_only_v6(false);
            socket.set_reuse_address(true)?;
            Self::set_reuse_port(&socket, true)?;
            socket.bind(&addr.into())?;
            match socket.listen(1024) {
                Ok(_) => {
                    let listener: std::net::TcpListener = socket.into();
                    return TcpListener::from_std(listener);
                }
                Err(e) => {
                    log::info!("绑定端口地址失败，原因： {:?}", addr);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "could not resolve to any address",
            )
        }))
    }

    /// 只读取一次, 返回读取的字节数, 为0表示对端已关闭
    pub async fn read_once<T>(stream: &mut T, buffer: &mut BinaryMut) -> io::Result<usize>
    where
        T: AsyncRead + Unpin,
    {
        let size = {
            let mut buf = ReadBuf::uninit(buffer.chunk_mut());
            stream.read_buf(&mut buf).await?;
            buf.filled().len()
        };
        unsafe {
            buffer.advance_mut(size);
        }
        Ok(size)
    }

    /// 将已排队的数据刷新后再关闭连接
    pub async fn close_on_flush<T>(stream: &mut T)
    where
        T: AsyncWrite + Unpin,
    {
        let _ = stream.flush().await;
        let _ = stream.shutdown().await;
    }

    /// 连接的短标识, 用于日志关联
    pub fn short_id() -> String {
        format!("{:08x}", rand::random::<u32>())
    }

    pub fn try_init_log(option: &ConfigOption) -> ProxyResult<()> {
        let mut log_config = log4rs::config::Config::builder();
        let mut root = Root::builder();
        for (name, path) in &option.log_names {
            let (path, level) = {
                let vals: Vec<&str> = path.split(' ').collect();
                if vals.len() == 1 {
                    (path.clone(), Level::Info)
                } else {
                    (
                        vals[0].to_string(),
                        Level::from_str(vals[1]).ok().unwrap_or(Level::Info),
                    )
                }
            };
            let appender = FileAppender::builder()
                .encoder(Box::new(PatternEncoder::new(
                    "{d(%Y-%m-%d %H:%M:%S)} {l} {m}{n}",
                )))
                .build(path)?;
            if name == "default" {
                root = root.appender(name.clone());
            }
            log_config =
                log_config.appender(Appender::builder().build(name.clone(), Box::new(appender)));
            log_config = log_config.logger(
                Logger::builder()
                    .appender(name.clone())
                    .additive(false)
                    .build(name.clone(), level.to_level_filter()),
            );
        }

        if !option.disable_stdout {
            let stdout: ConsoleAppender = ConsoleAppender::builder()
                .encoder(Box::new(PatternEncoder::new(
                    "{d(%Y-%m-%d %H:%M:%S)} {h({l})} {m}{n}",
                )))
                .build();
            log_config = log_config.appender(Appender::builder().build("stdout", Box::new(stdout)));
            root = root.appender("stdout");
        }

        let level = option.default_level.unwrap_or(LevelFilter::Info);
        let log_config = log_config
            .build(root.build(level))
            .map_err(|_| ProxyError::Extension("log config error"))?;
        let mut handle = LOG4RS_HANDLE
            .lock()
            .map_err(|_| ProxyError::Extension("log handle poisoned"))?;
        match handle.as_mut() {
            Some(handle) => handle.set_config(log_config),
            None => {
                let new_handle = log4rs::init_config(log_config)
                    .map_err(|_| ProxyError::Extension("log already init"))?;
                *handle = Some(new_handle);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use webparse::{BinaryMut, Buf};

    use super::Helper;

    #[test]
    fn short_id_len() {
        let id = Helper::short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn read_once_and_close() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"hello").await.unwrap();
        let mut buffer = BinaryMut::with_capacity(32);
        let size = Helper::read_once(&mut server, &mut buffer).await.unwrap();
        assert_eq!(size, 5);
        assert_eq!(buffer.chunk(), b"hello");

        Helper::close_on_flush(&mut server).await;
        let mut rest = vec![];
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
    }
}
