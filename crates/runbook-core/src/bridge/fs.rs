//! File system operations

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use rhai::{Array, Blob, Dynamic, Engine};
use tracing::{debug, info};

use super::HostBridge;
use crate::error::RunError;
use crate::value::{ScriptValue, StructBuilder};

/// Lexically resolve `.` and `..` without touching the file system
pub(super) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn io_error(path: &Path, e: &io::Error) -> RunError {
    let message = format!("{}: {e}", path.display());
    match e.kind() {
        io::ErrorKind::NotFound => RunError::NotFound(message),
        _ => RunError::Execution(message),
    }
}

/// Which entries `fs_list` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    All,
    Files,
    Dirs,
}

impl ListKind {
    fn parse(kind: &str) -> Self {
        match kind {
            "f" => ListKind::Files,
            "d" => ListKind::Dirs,
            _ => ListKind::All,
        }
    }
}

/// Depth-first walk in name order; the root itself is the first entry
fn walk(root: &Path, kind: ListKind, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let metadata = fs::symlink_metadata(root)?;
    let include = match kind {
        ListKind::All => true,
        ListKind::Files => metadata.is_file(),
        ListKind::Dirs => false,
    };
    if include {
        out.push(root.to_path_buf());
    }
    if metadata.is_dir() {
        walk_dir(root, kind, out)?;
    }
    Ok(())
}

fn walk_dir(dir: &Path, kind: ListKind, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort();

    for path in entries {
        let metadata = fs::symlink_metadata(&path)?;
        let include = match kind {
            ListKind::All => true,
            ListKind::Files => metadata.is_file(),
            ListKind::Dirs => metadata.is_dir(),
        };
        if include {
            out.push(path.clone());
        }
        if metadata.is_dir() {
            walk_dir(&path, kind, out)?;
        }
    }
    Ok(())
}

/// Regular files below `dir`, in walk order
pub(super) fn files_below(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    walk(dir, ListKind::Files, &mut out)?;
    Ok(out)
}

fn copy_recursive(source: &Path, dest: &Path) -> io::Result<()> {
    if fs::metadata(source)?.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        fs::copy(source, dest)?;
    }
    Ok(())
}

/// Destination inside `dest` when it is an existing directory
fn into_dir(source: &Path, dest: PathBuf) -> PathBuf {
    match source.file_name() {
        Some(name) if dest.is_dir() => dest.join(name),
        _ => dest,
    }
}

fn path_string(path: &Path) -> String {
    path.display().to_string()
}

impl HostBridge {
    fn fs_read(&self, path: &str) -> Result<Dynamic, RunError> {
        let path = self.resolve_path(path);
        if path.is_dir() {
            return Err(RunError::Execution(format!(
                "{} is a directory",
                path.display()
            )));
        }
        let bytes = fs::read(&path).map_err(|e| io_error(&path, &e))?;
        Ok(ScriptValue::from_bytes(bytes).into_dynamic())
    }

    fn fs_write(&self, path: &str, data: &Dynamic) -> Result<(), RunError> {
        let path = self.resolve_path(path);
        let bytes = if let Some(blob) = data.read_lock::<Blob>() {
            blob.clone()
        } else if data.is_string() {
            data.to_string().into_bytes()
        } else {
            return Err(RunError::Type(format!(
                "fs_write: expected string or blob, found {}",
                data.type_name()
            )));
        };
        fs::write(&path, &bytes).map_err(|e| io_error(&path, &e))?;
        debug!(path = %path.display(), bytes = bytes.len(), "file written");
        Ok(())
    }

    fn fs_create_dir(&self, path: &str) -> Result<(), RunError> {
        let path = self.resolve_path(path);
        match fs::metadata(&path) {
            Ok(m) if m.is_dir() => Ok(()),
            Ok(_) => Err(RunError::Execution(format!(
                "{} exists and is not a directory",
                path.display()
            ))),
            Err(_) => fs::create_dir_all(&path).map_err(|e| io_error(&path, &e)),
        }
    }

    fn fs_remove(&self, path: &str) -> Result<(), RunError> {
        let path = self.resolve_path(path);
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(io_error(&path, &e)),
            _ => Ok(()),
        }
    }

    fn fs_remove_dir(&self, path: &str) -> Result<(), RunError> {
        let path = self.resolve_path(path);
        info!(path = %path.display(), "removing directory tree");
        match fs::remove_dir_all(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(io_error(&path, &e)),
            _ => Ok(()),
        }
    }

    fn fs_copy(&self, source: &str, dest: &str) -> Result<(), RunError> {
        let source = self.resolve_path(source);
        let dest = into_dir(&source, self.resolve_path(dest));
        if normalize(&source) == normalize(&dest) {
            return Ok(());
        }
        info!(from = %source.display(), to = %dest.display(), "copying");
        copy_recursive(&source, &dest).map_err(|e| io_error(&source, &e))
    }

    fn fs_move(&self, source: &str, dest: &str) -> Result<(), RunError> {
        let source = self.resolve_path(source);
        let dest = into_dir(&source, self.resolve_path(dest));
        info!(from = %source.display(), to = %dest.display(), "moving");
        match fs::rename(&source, &dest) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                debug!(error = %e, "rename crosses file systems, copying instead");
            }
            Err(e) => return Err(io_error(&source, &e)),
        }
        copy_recursive(&source, &dest).map_err(|e| io_error(&source, &e))?;
        if source.is_dir() {
            fs::remove_dir_all(&source)
        } else {
            fs::remove_file(&source)
        }
        .map_err(|e| io_error(&source, &e))
    }

    fn fs_list(&self, root: &str, kind: &str) -> Result<Array, RunError> {
        let root = if root.trim().is_empty() {
            self.cwd()
        } else {
            self.resolve_path(root)
        };
        let mut out = Vec::new();
        walk(&root, ListKind::parse(kind), &mut out).map_err(|e| io_error(&root, &e))?;
        Ok(out.iter().map(|p| path_string(p).into()).collect())
    }

    fn fs_abs(&self, path: &str) -> String {
        let path = if path.trim().is_empty() {
            self.cwd()
        } else {
            self.resolve_path(path)
        };
        path_string(&normalize(&path))
    }
}

/// `#{folder, file, title, ext}` for a path
fn split(path: &str) -> Dynamic {
    let p = Path::new(path);
    let file = p
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let folder = match p.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => path_string(parent),
        _ => ".".to_string(),
    };
    let (title, ext) = match p.extension() {
        Some(ext) => {
            let ext = format!(".{}", ext.to_string_lossy());
            (file[..file.len() - ext.len()].to_string(), ext)
        }
        _ => (file.clone(), String::new()),
    };
    StructBuilder::new()
        .field("folder", folder)
        .field("file", file)
        .field("title", title)
        .field("ext", ext)
        .build()
}

fn join(parts: &Array) -> String {
    let mut path = PathBuf::new();
    for part in parts {
        path.push(part.to_string());
    }
    path_string(&normalize(&path))
}

pub(super) fn register(engine: &mut Engine, bridge: &Arc<HostBridge>) {
    let b = Arc::clone(bridge);
    engine.register_fn("fs_read", move |path: &str| {
        b.invoke("fs_read", || b.fs_read(path))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("fs_write", move |path: &str, data: Dynamic| {
        b.invoke("fs_write", || b.fs_write(path, &data))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("fs_create_dir", move |path: &str| {
        b.invoke("fs_create_dir", || b.fs_create_dir(path))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("fs_remove", move |path: &str| {
        b.invoke("fs_remove", || b.fs_remove(path))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("fs_remove_dir", move |path: &str| {
        b.invoke("fs_remove_dir", || b.fs_remove_dir(path))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("fs_copy", move |source: &str, dest: &str| {
        b.invoke("fs_copy", || b.fs_copy(source, dest))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("fs_move", move |source: &str, dest: &str| {
        b.invoke("fs_move", || b.fs_move(source, dest))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("fs_split", move |path: &str| {
        b.invoke("fs_split", || Ok(split(path)))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("fs_join", move |parts: Array| {
        b.invoke("fs_join", || Ok(join(&parts)))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("fs_list", move |root: &str| {
        b.invoke("fs_list", || b.fs_list(root, ""))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("fs_list", move |root: &str, kind: &str| {
        b.invoke("fs_list", || b.fs_list(root, kind))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("fs_abs", move |path: &str| {
        b.invoke("fs_abs", || Ok(b.fs_abs(path)))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("fs_pwd", move || {
        b.invoke("fs_pwd", || Ok(path_string(&b.cwd())))
    });
    let b = Arc::clone(bridge);
    engine.register_fn("fs_chdir", move |dir: &str| {
        b.invoke("fs_chdir", || Ok(path_string(&b.set_cwd(dir)?)))
    });
}
