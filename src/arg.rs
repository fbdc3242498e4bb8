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
// Created Date: 2024/03/05 17:40:12

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
    process::exit,
};

use bpaf::*;
use log::LevelFilter;

use crate::{ConfigOption, ProxyResult};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Bpaf)]
#[allow(dead_code)]
struct Shared {
    /// 禁用默认输出
    pub(crate) disable_stdout: bool,
    /// 是否显示更多日志
    #[bpaf(short, long)]
    pub(crate) verbose: bool,
    /// 设置默认等级
    pub(crate) default_level: Option<LevelFilter>,
}

#[derive(Debug, Clone, Bpaf)]
#[allow(dead_code)]
struct RunConfig {
    /// 配置文件路径
    #[bpaf(short, long)]
    pub(crate) config: String,
}

#[derive(Debug, Clone, Bpaf)]
#[allow(dead_code)]
struct CheckConfig {
    /// 配置文件路径
    #[bpaf(short, long)]
    pub(crate) config: String,
}

#[derive(Debug, Clone, Bpaf)]
#[allow(dead_code)]
struct VersionConfig {}

#[derive(Debug, Clone)]
enum Command {
    Run(RunConfig),
    Check(CheckConfig),
    Version(VersionConfig),
}

fn parse_command() -> impl Parser<(Command, Shared)> {
    let run = run_config().map(Command::Run);
    let run = construct!(run, shared())
        .to_options()
        .command("run")
        .help("启动命令");

    let check = check_config().map(Command::Check);
    let check = construct!(check, shared())
        .to_options()
        .command("check")
        .help("检查配置是否正确");

    let version_config = version_config().map(Command::Version);
    let version_config = construct!(version_config, shared())
        .to_options()
        .command("version")
        .help("打印当前版本号");
    construct!([run, check, version_config])
}

/// 按扩展名选择yaml, toml或json解析配置
pub fn read_config_from_path<P: AsRef<Path>>(path: P) -> ProxyResult<ConfigOption> {
    let path = path.as_ref();
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let option = match &*extension {
        "yaml" | "yml" => serde_yaml::from_str::<ConfigOption>(&contents).map_err(|e| {
            println!("解析文件错误: {}", e);
            io::Error::new(io::ErrorKind::Other, "parse yaml error")
        })?,
        "toml" => toml::from_str::<ConfigOption>(&contents).map_err(|e| {
            println!("解析文件错误: {}", e);
            io::Error::new(io::ErrorKind::Other, "parse toml error")
        })?,
        "json" => serde_json::from_str::<ConfigOption>(&contents).map_err(|e| {
            println!("解析文件错误: {}", e);
            io::Error::new(io::ErrorKind::Other, "parse json error")
        })?,
        _ => {
            let e = io::Error::new(io::ErrorKind::Other, "unknow format error");
            return Err(e.into());
        }
    };
    Ok(option)
}

fn apply_shared(option: &mut ConfigOption, shared: &Shared) {
    if shared.disable_stdout {
        option.disable_stdout = true;
    }
    if shared.default_level.is_some() {
        option.default_level = shared.default_level;
    }
    if shared.verbose {
        option.default_level = Some(LevelFilter::Trace);
    }
}

pub fn parse_env() -> ProxyResult<ConfigOption> {
    let (command, shared) = parse_command().run();
    match command {
        Command::Check(config) => {
            let result =
                read_config_from_path(&config.config).and_then(|mut o| o.after_load_option());
            match result {
                Ok(_) => {
                    println!("配置文件正确");
                    exit(0);
                }
                Err(e) => {
                    println!("配置文件错误:{:?}", e);
                    exit(1);
                }
            }
        }
        Command::Run(config) => {
            let mut option = read_config_from_path(&config.config)?;
            apply_shared(&mut option, &shared);
            option.after_load_option()?;
            Ok(option)
        }
        Command::Version(_) => {
            println!("当前版本号:{}", VERSION);
            exit(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::read_config_from_path;

    #[test]
    fn read_json_config() {
        let path = std::env::temp_dir().join(format!("termproxy-{}.json", std::process::id()));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(br#"{"inbounds":[{"port":1080,"protocol":"socks5"}]}"#)
                .unwrap();
        }
        let option = read_config_from_path(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(option.inbounds.len(), 1);
        assert_eq!(option.inbounds[0].port, 1080);
    }

    #[test]
    fn unknown_extension() {
        let path = std::env::temp_dir().join(format!("termproxy-{}.ini", std::process::id()));
        std::fs::write(&path, "x").unwrap();
        assert!(read_config_from_path(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
