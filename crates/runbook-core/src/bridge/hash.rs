//! Digest operations, lowercase hex output

use std::fmt::LowerHex;
use std::fs::File;
use std::io;
use std::sync::Arc;

use md5::Md5;
use rhai::{Blob, Engine};
use sha1::Sha1;
use sha2::digest::Output;
use sha2::{Digest, Sha256};

use super::HostBridge;
use crate::error::RunError;

fn digest<D: Digest>(data: &[u8]) -> String
where
    Output<D>: LowerHex,
{
    format!("{:x}", D::digest(data))
}

fn digest_file<D: Digest + io::Write>(bridge: &HostBridge, path: &str) -> Result<String, RunError>
where
    Output<D>: LowerHex,
{
    let path = bridge.resolve_path(path);
    let mut file = File::open(&path)
        .map_err(|e| RunError::NotFound(format!("{}: {e}", path.display())))?;
    let mut hasher = D::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

macro_rules! register_digest {
    ($engine:expr, $bridge:expr, $algo:ty, $text:literal, $buffer:literal, $file:literal) => {{
        let b = Arc::clone($bridge);
        $engine.register_fn($text, move |text: &str| {
            b.invoke($text, || Ok(digest::<$algo>(text.as_bytes())))
        });
        let b = Arc::clone($bridge);
        $engine.register_fn($buffer, move |data: Blob| {
            b.invoke($buffer, || Ok(digest::<$algo>(&data)))
        });
        let b = Arc::clone($bridge);
        $engine.register_fn($file, move |path: &str| {
            b.invoke($file, || digest_file::<$algo>(&b, path))
        });
    }};
}

pub(super) fn register(engine: &mut Engine, bridge: &Arc<HostBridge>) {
    register_digest!(
        engine,
        bridge,
        Md5,
        "hash_md5_text",
        "hash_md5_buffer",
        "hash_md5_file"
    );
    register_digest!(
        engine,
        bridge,
        Sha1,
        "hash_sha1_text",
        "hash_sha1_buffer",
        "hash_sha1_file"
    );
    register_digest!(
        engine,
        bridge,
        Sha256,
        "hash_sha256_text",
        "hash_sha256_buffer",
        "hash_sha256_file"
    );
}
