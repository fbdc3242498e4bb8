use std::{
    io,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use futures::{future::select_all, FutureExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tokio_rustls::TlsAcceptor;

use crate::{
    error::ProxyTypeResult,
    outbound::{OutboundResolver, RuleResolver},
    trojan::{CredentialSet, TrojanInbound},
    ws::accept_ws,
    ConfigOption, Flag, Helper, InboundConfig, ProxyError, ProxyHttp, ProxyResult, ProxySocks4,
    ProxySocks5,
};

/// 单个入口的处理上下文, 加载后不再变动, 各连接共享
struct InboundContext {
    config: InboundConfig,
    tls: Option<TlsAcceptor>,
    trojan: Option<TrojanInbound>,
    http: ProxyHttp,
    socks5: ProxySocks5,
    socks4: ProxySocks4,
    idle_timeout: Option<Duration>,
}

impl InboundContext {
    fn new(
        config: InboundConfig,
        resolver: Arc<dyn OutboundResolver>,
        idle_timeout: Option<Duration>,
    ) -> ProxyResult<Self> {
        let tls = config.get_tls_accept()?;
        let trojan = if config.is_trojan() {
            let credentials = Arc::new(CredentialSet::from_settings(&config.trojan_settings));
            log::info!(
                "trojan入口{}加载{}个密码",
                config.port,
                credentials.len()
            );
            Some(TrojanInbound::new(
                config.tag.clone(),
                credentials,
                resolver.clone(),
                idle_timeout,
            ))
        } else {
            None
        };
        let http = ProxyHttp::new(
            config.username.clone(),
            config.password.clone(),
            config.tag.clone(),
            resolver.clone(),
        );
        let socks5 = ProxySocks5::new(
            config.username.clone(),
            config.password.clone(),
            config.tag.clone(),
            resolver.clone(),
        );
        let socks4 = ProxySocks4::new(config.username.clone(), config.tag.clone(), resolver);
        Ok(Self {
            config,
            tls,
            trojan,
            http,
            socks5,
            socks4,
            idle_timeout,
        })
    }
}

pub struct Proxy {
    option: ConfigOption,
    resolver: Arc<dyn OutboundResolver>,
    listeners: Vec<TcpListener>,
    contexts: Vec<Arc<InboundContext>>,
}

impl Proxy {
    pub fn new(option: ConfigOption) -> ProxyResult<Proxy> {
        let resolver = Arc::new(RuleResolver::new(&option)?);
        Ok(Self::with_resolver(option, resolver))
    }

    /// 使用自定义的出口选择
    pub fn with_resolver(option: ConfigOption, resolver: Arc<dyn OutboundResolver>) -> Proxy {
        Self {
            option,
            resolver,
            listeners: vec![],
            contexts: vec![],
        }
    }

    /// 绑定所有的入口端口
    pub async fn ready_serve(&mut self) -> ProxyResult<()> {
        let idle_timeout = self.option.idle_timeout();
        for inbound in &self.option.inbounds {
            let addr = inbound.bind_addr()?;
            let listener = Helper::bind(addr).await?;
            log::info!(
                "绑定入口：{:?}，提供{}代理功能。",
                listener.local_addr()?,
                inbound.protocol
            );
            let context = InboundContext::new(inbound.clone(), self.resolver.clone(), idle_timeout)?;
            self.listeners.push(listener);
            self.contexts.push(Arc::new(context));
        }
        Ok(())
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    async fn multi_tcp_listen_work(
        listens: &mut Vec<TcpListener>,
    ) -> (io::Result<(TcpStream, SocketAddr)>, usize) {
        if !listens.is_empty() {
            let (conn, index, _) =
                select_all(listens.iter_mut().map(|listener| listener.accept().boxed())).await;
            (conn, index)
        } else {
            let pend = std::future::pending();
            let () = pend.await;
            unreachable!()
        }
    }

    /// 接收连接直到收到关闭信号, 每个连接在独立的协程中处理, 需先调用ready_serve
    pub async fn run_serve(&mut self, mut shutdown: watch::Receiver<bool>) -> ProxyResult<()> {
        loop {
            tokio::select! {
                (result, index) = Self::multi_tcp_listen_work(&mut self.listeners) => {
                    match result {
                        Ok((conn, addr)) => {
                            let context = self.contexts[index].clone();
                            tokio::spawn(async move {
                                Self::deal_stream(context, conn, addr).await;
                            });
                        }
                        Err(e) => {
                            log::warn!("接收连接失败, 原因为: {:?}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    log::info!("收到关闭信号, 停止接收新的连接");
                    break;
                }
            }
        }
        Ok(())
    }

    pub async fn start_serve(&mut self) -> ProxyResult<()> {
        log::trace!("开始启动服务器，正在加载配置中");
        self.ready_serve().await?;
        let (sender, receiver) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = sender.send(true);
            }
        });
        self.run_serve(receiver).await
    }

    async fn deal_stream(context: Arc<InboundContext>, inbound: TcpStream, addr: SocketAddr) {
        let id = Helper::short_id();
        let _ = inbound.set_nodelay(true);
        log::trace!(
            "[{}] 入口{}收到客户端连接: {}",
            id,
            context.config.port,
            addr
        );
        match &context.tls {
            Some(tls) => {
                // 获取的流跟正常内容一样读写, 在内部实现了自动加解密
                match tls.accept(inbound).await {
                    Ok(stream) => Self::deal_inbound(&context, stream, id).await,
                    Err(e) => log::warn!("[{}] tls握手失败, 原因为: {:?}", id, e),
                }
            }
            None => Self::deal_inbound(&context, inbound, id).await,
        }
    }

    async fn deal_inbound<T>(context: &InboundContext, inbound: T, id: String)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let trojan = match &context.trojan {
            Some(trojan) => trojan,
            None => {
                let result = Self::deal_proxy(context, inbound, id.clone()).await;
                Self::report(&id, result);
                return;
            }
        };

        match &context.config.ws_path {
            Some(path) => {
                let handshake = accept_ws(inbound, path);
                let ws = match context.idle_timeout {
                    Some(timeout) => match tokio::time::timeout(timeout, handshake).await {
                        Ok(ws) => ws,
                        Err(_) => {
                            log::info!("[{}] websocket握手超时", id);
                            return;
                        }
                    },
                    None => handshake.await,
                };
                match ws {
                    Ok(ws) => Self::report(&id, trojan.process(ws, id.clone()).await),
                    Err(e) => log::info!("[{}] websocket握手失败: {}", id, e),
                }
            }
            None => Self::report(&id, trojan.process(inbound, id.clone()).await),
        }
    }

    /// 同一端口按首包区分http, socks5及socks4
    async fn deal_proxy<T>(context: &InboundContext, inbound: T, id: String) -> ProxyTypeResult<(), T>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let flag = context.config.protocol;
        let (buffer, inbound) = if flag.contains(Flag::HTTP) {
            match context.http.process(inbound, None, id.clone()).await {
                Err(ProxyError::Continue(v)) => v,
                other => return other,
            }
        } else {
            (None, inbound)
        };

        let (buffer, inbound) = if flag.contains(Flag::SOCKS5) {
            match context.socks5.process(inbound, buffer, id.clone()).await {
                Err(ProxyError::Continue(v)) => v,
                other => return other,
            }
        } else {
            (buffer, inbound)
        };

        if flag.contains(Flag::SOCKS4) {
            match context.socks4.process(inbound, buffer, id).await {
                Err(ProxyError::Continue(_)) => Err(ProxyError::ProtNoSupport),
                other => other,
            }
        } else {
            Err(ProxyError::ProtNoSupport)
        }
    }

    /// 按错误的种类记录连接结束的原因
    fn report<T>(id: &str, result: ProxyTypeResult<(), T>)
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match result {
            Ok(()) => log::debug!("[{}] 连接结束", id),
            Err(e) if e.is_contained() => log::debug!("[{}] 协议帧无法解析, 已丢弃: {:?}", id, e),
            Err(e) if e.is_graceful() => log::info!("[{}] 连接已关闭: {:?}", id, e),
            Err(e) if e.is_peer_closed() => log::debug!("[{}] 对端已断开: {:?}", id, e),
            Err(e) => log::error!("[{}] 连接处理失败: {:?}", id, e),
        }
    }
}
