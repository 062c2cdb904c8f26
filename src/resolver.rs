//! Maps a request path onto a file under the document root.
//!
//! Extension whitelists are ordered and the order is the priority: when a
//! directory is requested, `index<ext>` is tried for every script extension
//! (scripts enabled only) and then for every static extension, and the first
//! file that exists wins.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::config::ServerConfig;

/// Placeholder target for `/`, resolved by index probing of the root.
pub const INDEX_WILDCARD: &str = "/index.*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Static,
    Script,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Document-root-relative location, e.g. `/about/index.html`.
    pub location: String,
    /// Absolute path of the file on disk.
    pub path: PathBuf,
    pub mode: Mode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(ResolvedTarget),
    NotFound,
}

impl Resolution {
    pub fn target(&self) -> Option<&ResolvedTarget> {
        match self {
            Resolution::Found(target) => Some(target),
            Resolution::NotFound => None,
        }
    }
}

pub fn resolve(path: &str, config: &ServerConfig) -> Resolution {
    if !path.starts_with('/') || escapes_root(path) {
        debug!(path, "rejected request path");
        return Resolution::NotFound;
    }

    let resolution = if path == "/" {
        debug!(target = INDEX_WILDCARD, "probing root index");
        find_index(config, "")
    } else {
        match path.rsplit_once('.') {
            Some((_, ext)) => resolve_file(config, path, &format!(".{}", ext)),
            None => resolve_directory(config, path),
        }
    };

    debug!(path, ?resolution, "resolved");
    resolution
}

/// A path with an extension is served only when the extension is
/// whitelisted and the file exists. No index probing happens here.
fn resolve_file(config: &ServerConfig, path: &str, ext: &str) -> Resolution {
    let mode = if config.is_script_extension(ext) {
        Mode::Script
    } else if config.is_static_extension(ext) {
        Mode::Static
    } else {
        return Resolution::NotFound;
    };

    let file = docs_path(config, path);
    if !file.is_file() {
        return Resolution::NotFound;
    }
    Resolution::Found(ResolvedTarget {
        location: path.to_owned(),
        path: file,
        mode,
    })
}

fn resolve_directory(config: &ServerConfig, path: &str) -> Resolution {
    if !docs_path(config, path).is_dir() {
        return Resolution::NotFound;
    }
    find_index(config, path.trim_end_matches('/'))
}

/// Script indexes first, then static ones, each in whitelist order.
fn find_index(config: &ServerConfig, base: &str) -> Resolution {
    let dir = docs_path(config, base);

    let script_extensions: &[String] = match config.scripts_enabled() {
        true => config.script_extensions.as_slice(),
        false => &[],
    };
    let candidates = script_extensions
        .iter()
        .map(|ext| (ext, Mode::Script))
        .chain(config.static_extensions.iter().map(|ext| (ext, Mode::Static)));

    for (ext, mode) in candidates {
        let file_name = format!("index{}", ext);
        let candidate = dir.join(&file_name);
        if candidate.is_file() {
            return Resolution::Found(ResolvedTarget {
                location: format!("{}/{}", base, file_name),
                path: candidate,
                mode,
            });
        }
    }
    Resolution::NotFound
}

fn docs_path(config: &ServerConfig, path: &str) -> PathBuf {
    config.docs_dir.join(path.trim_start_matches('/'))
}

fn escapes_root(path: &str) -> bool {
    Path::new(path)
        .components()
        .any(|component| matches!(component, Component::ParentDir))
}
