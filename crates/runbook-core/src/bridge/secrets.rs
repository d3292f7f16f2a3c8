//! Secret lookup operations

use std::sync::Arc;

use rhai::{Dynamic, Engine};

use super::HostBridge;
use crate::value::StructBuilder;

pub(super) fn register(engine: &mut Engine, bridge: &Arc<HostBridge>) {
    let b = Arc::clone(bridge);
    engine.register_fn("get_text_secret", move |id: &str| {
        b.invoke("get_text_secret", || Ok(b.ctx.secrets().resolve_text(id)?))
    });

    let b = Arc::clone(bridge);
    engine.register_fn("get_ssh_secret", move |id: &str| {
        b.invoke("get_ssh_secret", || {
            let creds = b.ctx.secrets().resolve_ssh(id)?;
            Ok::<Dynamic, _>(
                StructBuilder::new()
                    .field("user", creds.user)
                    .field(
                        "private_key_file",
                        creds.private_key_file.display().to_string(),
                    )
                    .field("passphrase", creds.passphrase.unwrap_or_default())
                    .build(),
            )
        })
    });

    let b = Arc::clone(bridge);
    engine.register_fn("get_userpass_secret", move |id: &str| {
        b.invoke("get_userpass_secret", || {
            let pair = b.ctx.secrets().resolve_userpass(id)?;
            Ok::<Dynamic, _>(
                StructBuilder::new()
                    .field("user", pair.user)
                    .field("password", pair.password)
                    .build(),
            )
        })
    });
}
