//! Stable connection ids.
//!
//! Every input is lower-cased before it reaches the digest, so ids do not
//! depend on how a server reports casing of names or URLs. Each part is
//! length-prefixed so a separator inside a field cannot shift a boundary.
//! Callers reject empty identity fields before hashing.

use crate::model::ServerIdentity;
use sha2::{Digest, Sha256};

pub const CONNECTION_ID_HEX_LEN: usize = 64;

#[derive(Debug, Clone, Copy)]
pub enum IdentityFields<'a> {
    Spec {
        name: &'a str,
        executable: &'a str,
        argv: &'a [String],
    },
    Live {
        kernel_id: &'a str,
    },
}

impl IdentityFields<'_> {
    fn kind_tag(&self) -> &'static str {
        match self {
            IdentityFields::Spec { .. } => "spec",
            IdentityFields::Live { .. } => "live",
        }
    }
}

pub fn connection_id(server: &ServerIdentity, fields: IdentityFields<'_>) -> String {
    let mut parts = vec![
        fields.kind_tag().to_string(),
        server.server_id().to_string(),
        server.base_url().to_string(),
    ];
    match fields {
        IdentityFields::Spec {
            name,
            executable,
            argv,
        } => {
            parts.push(name.to_string());
            parts.push(executable.to_string());
            parts.push(argv_digest(argv));
        }
        IdentityFields::Live { kernel_id } => {
            parts.push(kernel_id.to_string());
        }
    }

    let lowered = parts.iter().map(|part| part.to_lowercase()).collect::<Vec<_>>();
    sha256_hex(length_prefixed(&lowered).as_bytes())
}

fn argv_digest(argv: &[String]) -> String {
    let lowered = argv.iter().map(|arg| arg.to_lowercase()).collect::<Vec<_>>();
    sha256_hex(length_prefixed(&lowered).as_bytes())
}

fn length_prefixed(parts: &[String]) -> String {
    let mut encoded = String::new();
    for part in parts {
        encoded.push_str(&format!("{}:{part}|", part.len()));
    }
    encoded
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
