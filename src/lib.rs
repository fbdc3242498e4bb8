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
// Created Date: 2024/03/04 10:18:52

mod arg;
mod discard;
mod error;
mod flag;
mod helper;
mod http;
mod odor;
mod option;
mod proxy;
mod relay;
mod socks4;
mod socks5;

pub mod outbound;
pub mod trojan;
pub mod ws;

pub use arg::{parse_env, read_config_from_path};
pub use discard::DiscardSink;
pub use error::{ProxyError, ProxyResult, ProxyTypeResult};
pub use flag::Flag;
pub use helper::Helper;
pub use http::ProxyHttp;
pub use odor::{Odor, Protocol};
pub use option::{
    ConfigOption, InboundConfig, OutboundConfig, OutboundKind, RuleConfig, TrojanSetting,
};
pub use proxy::Proxy;
pub use relay::Relay;
pub use socks4::ProxySocks4;
pub use socks5::ProxySocks5;
