//! Local and remote command operations

use std::path::PathBuf;
use std::sync::Arc;

use rhai::{Dynamic, Engine, INT, Map};
use runbook_exec::{CommandOptions, CommandRunner, RemoteTarget, ShellResult};
use tracing::{debug, info};

use super::{HostBridge, options_map};
use crate::error::RunError;
use crate::value::{Fields, FromScript, StructBuilder, env_entries};

impl FromScript for CommandOptions {
    fn from_script(context: &str, map: &Map) -> Result<Self, RunError> {
        let fields = Fields::new(context, map);
        let env = match fields.raw("env") {
            Some(value) => env_entries(context, value)?,
            None => Vec::new(),
        };
        Ok(CommandOptions {
            shell: fields.string("shell")?,
            stdin_line: fields.string("in")?,
            stdin_lines: fields.strings("ins")?,
            env,
            timeout: fields.seconds("timeout")?,
            secret_id: fields.string("secret_id")?,
            cwd: fields.string("cwd")?.map(PathBuf::from),
        })
    }
}

impl FromScript for RemoteTarget {
    fn from_script(context: &str, map: &Map) -> Result<Self, RunError> {
        let fields = Fields::new(context, map);
        Ok(RemoteTarget {
            address: fields.string("address")?.unwrap_or_default(),
            user: fields.string("user")?,
            password: fields.string("password")?,
            private_key_file: fields.string("private_key_file")?.map(PathBuf::from),
            passphrase: fields.string("passphrase")?,
            secret_id: fields.string("secret_id")?,
        })
    }
}

fn shell_result(cmd: &str, result: ShellResult) -> Dynamic {
    if !result.success() {
        debug!(
            cmd = %cmd,
            code = result.code,
            output = %result.combined_output(),
            "command exited non-zero"
        );
    }
    StructBuilder::new()
        .field("code", i64::from(result.code))
        .field("out", result.out)
        .field("err", result.err)
        .build()
}

fn port(op: &str, name: &str, value: INT) -> Result<u16, RunError> {
    u16::try_from(value)
        .map_err(|_| RunError::Configuration(format!("{op}: {name} {value} is not a valid port")))
}

impl HostBridge {
    fn command_options(&self, op: &str, opts: &Dynamic) -> Result<CommandOptions, RunError> {
        let mut options = CommandOptions::from_script(op, &options_map(op, opts)?)?;
        options.cwd = Some(match options.cwd.take() {
            Some(dir) => self.resolve_path(&dir.to_string_lossy()),
            None => self.cwd(),
        });
        Ok(options)
    }

    fn sh(&self, cmd: &str, opts: &Dynamic) -> Result<Dynamic, RunError> {
        let options = self.command_options("sh", opts)?;
        let result = self.block_on(async {
            self.runner
                .run(cmd, &options)
                .await
                .map_err(RunError::from)
        })?;
        Ok(shell_result(cmd, result))
    }

    fn sh_script(&self, path: &str, opts: &Dynamic) -> Result<Dynamic, RunError> {
        let path = self.resolve_path(path);
        let script = std::fs::read_to_string(&path)
            .map_err(|e| RunError::NotFound(format!("{}: {e}", path.display())))?;
        info!(script = %path.display(), "running shell script");
        self.sh(&script, opts)
    }

    fn target(&self, op: &str, target: &Map) -> Result<runbook_exec::ResolvedTarget, RunError> {
        RemoteTarget::from_script(op, target)?
            .resolve(Some(self.ctx.secrets()))
            .map_err(RunError::from)
    }

    fn rsh(&self, target: &Map, cmd: &str) -> Result<Dynamic, RunError> {
        let target = self.target("rsh", target)?;
        let result = self.block_on(async {
            self.remote
                .exec(&target, cmd)
                .await
                .map_err(RunError::from)
        })?;
        Ok(shell_result(cmd, result))
    }

    fn sh_upload(&self, target: &Map, local: &str, remote: &str) -> Result<INT, RunError> {
        let target = self.target("sh_upload", target)?;
        let local = self.resolve_path(local);
        let written = self.block_on(async {
            self.remote
                .upload(&target, &local, remote)
                .await
                .map_err(RunError::from)
        })?;
        Ok(INT::try_from(written).unwrap_or(INT::MAX))
    }

    fn sh_download(&self, target: &Map, remote: &str, local: &str) -> Result<INT, RunError> {
        let target = self.target("sh_download", target)?;
        let local = self.resolve_path(local);
        let written = self.block_on(async {
            self.remote
                .download(&target, remote, &local)
                .await
                .map_err(RunError::from)
        })?;
        Ok(INT::try_from(written).unwrap_or(INT::MAX))
    }

    fn sh_tunnel(
        &self,
        target: &Map,
        local_port: INT,
        remote_host: &str,
        remote_port: INT,
    ) -> Result<INT, RunError> {
        let local_port = port("sh_tunnel", "local port", local_port)?;
        let remote_port = port("sh_tunnel", "remote port", remote_port)?;
        let target = self.target("sh_tunnel", target)?;
        let tunnel = self.block_on(async {
            self.remote
                .open_tunnel(&target, local_port, remote_host, remote_port)
                .await
                .map_err(RunError::from)
        })?;
        info!(
            local = %tunnel.local_addr(),
            remote = %format!("{remote_host}:{remote_port}"),
            "tunnel opened"
        );
        self.ctx.register_tunnel(tunnel)
    }

    fn sh_tunnel_close(&self, id: INT) -> Result<bool, RunError> {
        let Some(tunnel) = self.ctx.take_tunnel(id) else {
            return Ok(false);
        };
        self.block_on(async {
            tunnel.close().await;
            Ok(())
        })?;
        Ok(true)
    }
}

/// Process environment as a map
fn env_map() -> Map {
    std::env::vars()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

pub(super) fn register(engine: &mut Engine, bridge: &Arc<HostBridge>) {
    let b = Arc::clone(bridge);
    engine.register_fn("sh", move |cmd: &str| {
        b.invoke("sh", || b.sh(cmd, &Dynamic::UNIT))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("sh", move |cmd: &str, opts: Dynamic| {
        b.invoke("sh", || b.sh(cmd, &opts))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("sh_script", move |path: &str| {
        b.invoke("sh_script", || b.sh_script(path, &Dynamic::UNIT))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("sh_script", move |path: &str, opts: Dynamic| {
        b.invoke("sh_script", || b.sh_script(path, &opts))
    });

    let b = Arc::clone(bridge);
    engine.register_fn("rsh", move |target: Map, cmd: &str| {
        b.invoke("rsh", || b.rsh(&target, cmd))
    });
    let b = Arc::clone(bridge);
    engine.register_fn(
        "sh_upload",
        move |target: Map, local: &str, remote: &str| {
            b.invoke("sh_upload", || b.sh_upload(&target, local, remote))
        },
    );
    let b = Arc::clone(bridge);
    engine.register_fn(
        "sh_download",
        move |target: Map, remote: &str, local: &str| {
            b.invoke("sh_download", || b.sh_download(&target, remote, local))
        },
    );
    let b = Arc::clone(bridge);
    engine.register_fn(
        "sh_tunnel",
        move |target: Map, local_port: INT, remote_host: &str, remote_port: INT| {
            b.invoke("sh_tunnel", || {
                b.sh_tunnel(&target, local_port, remote_host, remote_port)
            })
        },
    );
    let b = Arc::clone(bridge);
    engine.register_fn("sh_tunnel_close", move |id: INT| {
        b.invoke("sh_tunnel_close", || b.sh_tunnel_close(id))
    });

    let b = Arc::clone(bridge);
    engine.register_fn("env", move || b.invoke("env", || Ok(env_map())));
    let b = Arc::clone(bridge);
    engine.register_fn("pwd", move || {
        b.invoke("pwd", || Ok(b.cwd().display().to_string()))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("cd", move |dir: &str| {
        b.invoke("cd", || Ok(b.set_cwd(dir)?.display().to_string()))
    });
}
