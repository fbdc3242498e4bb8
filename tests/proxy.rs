// #![deny(warnings)]
#![deny(rust_2018_idioms)]

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use futures::{SinkExt, StreamExt};
    use termproxy::{
        trojan::password_digest, ConfigOption, Flag, InboundConfig, Proxy, TrojanSetting,
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::watch,
        task::JoinHandle,
    };
    use tokio_tungstenite::{client_async, tungstenite::Message};

    async fn run_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    fn inbound(protocol: Flag) -> InboundConfig {
        let mut config = InboundConfig::new(0, protocol);
        config.bind = "127.0.0.1".to_string();
        config
    }

    async fn run_proxy(
        mut option: ConfigOption,
    ) -> (Vec<SocketAddr>, watch::Sender<bool>, JoinHandle<()>) {
        option.after_load_option().unwrap();
        let mut proxy = Proxy::new(option).unwrap();
        proxy.ready_serve().await.unwrap();
        let addrs = proxy.local_addrs();
        let (sender, receiver) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let _ = proxy.run_serve(receiver).await;
        });
        (addrs, sender, handle)
    }

    fn trojan_frame(password: &str, target: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let host = target.ip().to_string();
        let mut data = password_digest(password).into_bytes();
        data.extend_from_slice(b"\r\n\x01\x03");
        data.push(host.len() as u8);
        data.extend_from_slice(host.as_bytes());
        data.extend_from_slice(&target.port().to_be_bytes());
        data.extend_from_slice(b"\r\n");
        data.extend_from_slice(payload);
        data
    }

    async fn assert_echo(stream: &mut TcpStream, data: &[u8]) {
        stream.write_all(data).await.unwrap();
        let mut buf = vec![0u8; data.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, data);
    }

    async fn read_http_head(stream: &mut TcpStream) -> String {
        let mut head = vec![];
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8_lossy(&head).to_string()
    }

    #[tokio::test]
    async fn socks5_and_socks4_on_one_port() {
        let echo = run_echo().await;
        let mut option = ConfigOption::default();
        option.inbounds.push(inbound("socks5".parse().unwrap()));
        let (addrs, _sender, _handle) = run_proxy(option).await;

        let mut stream = TcpStream::connect(addrs[0]).await.unwrap();
        stream.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0]);
        let mut req = vec![5, 1, 0, 1, 127, 0, 0, 1];
        req.extend_from_slice(&echo.port().to_be_bytes());
        stream.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..2], &[5, 0]);
        assert_echo(&mut stream, b"hello socks5").await;

        let mut stream = TcpStream::connect(addrs[0]).await.unwrap();
        let mut req = vec![4, 1];
        req.extend_from_slice(&echo.port().to_be_bytes());
        req.extend_from_slice(&[127, 0, 0, 1, 0]);
        stream.write_all(&req).await.unwrap();
        let mut reply = [0u8; 8];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x5A);
        assert_echo(&mut stream, b"hello socks4").await;
    }

    #[tokio::test]
    async fn socks5_bind_not_supported() {
        let mut option = ConfigOption::default();
        option.inbounds.push(inbound(Flag::SOCKS5));
        let (addrs, _sender, _handle) = run_proxy(option).await;

        let mut stream = TcpStream::connect(addrs[0]).await.unwrap();
        stream.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        stream
            .write_all(&[5, 2, 0, 1, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x07);
    }

    #[tokio::test]
    async fn http_connect() {
        let echo = run_echo().await;
        let mut option = ConfigOption::default();
        option.inbounds.push(inbound("http,socks5".parse().unwrap()));
        let (addrs, _sender, _handle) = run_proxy(option).await;

        let mut stream = TcpStream::connect(addrs[0]).await.unwrap();
        let req = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let head = read_http_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200"));
        assert_echo(&mut stream, b"tunnel data").await;
    }

    #[tokio::test]
    async fn http_requires_auth() {
        let echo = run_echo().await;
        let mut config = inbound(Flag::HTTP);
        config.username = Some("user".to_string());
        config.password = Some("pass".to_string());
        let mut option = ConfigOption::default();
        option.inbounds.push(config);
        let (addrs, _sender, _handle) = run_proxy(option).await;

        let mut stream = TcpStream::connect(addrs[0]).await.unwrap();
        let req = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let head = read_http_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 407"));

        let mut stream = TcpStream::connect(addrs[0]).await.unwrap();
        let req = format!(
            "CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n"
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let head = read_http_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200"));
        assert_echo(&mut stream, b"authorized").await;
    }

    #[tokio::test]
    async fn trojan_tcp() {
        let echo = run_echo().await;
        let mut config = inbound(Flag::TROJAN);
        config
            .trojan_settings
            .push(TrojanSetting::new("s3cr3t", None));
        let mut option = ConfigOption::default();
        option.inbounds.push(config);
        let (addrs, _sender, _handle) = run_proxy(option).await;

        let mut stream = TcpStream::connect(addrs[0]).await.unwrap();
        stream
            .write_all(&trojan_frame("s3cr3t", echo, b"first"))
            .await
            .unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first");
        assert_echo(&mut stream, b"second").await;

        let mut stream = TcpStream::connect(addrs[0]).await.unwrap();
        stream
            .write_all(&trojan_frame("wrong", echo, b"first"))
            .await
            .unwrap();
        let mut rest = vec![];
        assert_eq!(stream.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn trojan_over_websocket() {
        let echo = run_echo().await;
        let mut config = inbound(Flag::TROJAN);
        config
            .trojan_settings
            .push(TrojanSetting::new("s3cr3t", Some("vip")));
        config.ws_path = Some("/trojan".to_string());
        let mut option = ConfigOption::default();
        option.inbounds.push(config);
        let (addrs, _sender, _handle) = run_proxy(option).await;

        let stream = TcpStream::connect(addrs[0]).await.unwrap();
        let url = format!("ws://{}/trojan", addrs[0]);
        let (mut ws, _) = client_async(url, stream).await.unwrap();
        ws.send(Message::Binary(trojan_frame("s3cr3t", echo, b"over ws")))
            .await
            .unwrap();
        let msg = ws.next().await.unwrap().unwrap();
        assert_eq!(msg, Message::Binary(b"over ws".to_vec()));
    }

    #[tokio::test]
    async fn shutdown_stops_accept() {
        let mut option = ConfigOption::default();
        option.inbounds.push(inbound(Flag::HTTP));
        let (_addrs, sender, handle) = run_proxy(option).await;
        sender.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
