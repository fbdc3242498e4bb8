mod credential;
mod inbound;
mod package;

pub use credential::{password_digest, password_to_uuid, Credential, CredentialSet};
pub use inbound::{Stage, TrojanInbound, TROJAN_READ_SIZE};
pub use package::*;
