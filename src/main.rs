// #![deny(warnings)]

use termproxy::{parse_env, Helper, Proxy, ProxyResult};

async fn run_main() -> ProxyResult<()> {
    let option = parse_env()?;
    Helper::try_init_log(&option)?;
    let mut proxy = Proxy::new(option)?;
    proxy.start_serve().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run_main().await {
        log::error!("启动失败: {:?}", e);
        eprintln!("启动失败: {:?}", e);
        std::process::exit(1);
    }
}
