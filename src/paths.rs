//! Centralized path resolution for application files.
//!
//! - Config file: `~/.config/hearthmux[-dev]/config.toml`
//! - Log directory: `~/.local/share/hearthmux[-dev]/`
//!
//! Dev builds (`0.0.0-dev`) use `hearthmux-dev` subdirectories so a local
//! build never writes into the directories of an installed release.
//!
//! Tests can redirect every path under a temporary directory with
//! [`TestPathGuard`]; the override is thread-local.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

fn app_dir_name() -> &'static str {
    if cfg!(dev_build) {
        "hearthmux-dev"
    } else {
        "hearthmux"
    }
}

/// Categories of application paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// `~/.config/hearthmux/config.toml`
    Config,
    /// `~/.local/share/hearthmux/`
    LogDir,
}

#[derive(Debug, PartialEq)]
enum PathStrategy {
    Xdg,
    Override(PathBuf),
}

thread_local! {
    static PATH_STRATEGY: RefCell<PathStrategy> = const { RefCell::new(PathStrategy::Xdg) };
}

/// Resolve a path based on the current strategy.
///
/// Returns `None` when the XDG variables and `HOME` are all unset.
pub fn resolve(kind: PathKind) -> Option<PathBuf> {
    PATH_STRATEGY.with(|strategy| match *strategy.borrow() {
        PathStrategy::Xdg => resolve_xdg(kind),
        PathStrategy::Override(ref base) => Some(resolve_override(base, kind)),
    })
}

fn resolve_xdg(kind: PathKind) -> Option<PathBuf> {
    match kind {
        PathKind::Config => {
            let mut p = xdg_base("XDG_CONFIG_HOME", &[".config"])?;
            p.push(app_dir_name());
            p.push("config.toml");
            Some(p)
        }
        PathKind::LogDir => {
            let mut p = xdg_base("XDG_DATA_HOME", &[".local", "share"])?;
            p.push(app_dir_name());
            Some(p)
        }
    }
}

/// Prefer `$<var>`, fall back to `$HOME/<fallback...>`.
fn xdg_base(var: &str, fallback: &[&str]) -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os(var) {
        return Some(PathBuf::from(xdg));
    }
    std::env::var_os("HOME").map(|h| {
        let mut p = PathBuf::from(h);
        for part in fallback {
            p.push(part);
        }
        p
    })
}

fn resolve_override(base: &Path, kind: PathKind) -> PathBuf {
    match kind {
        PathKind::Config => base.join("config.toml"),
        PathKind::LogDir => base.to_path_buf(),
    }
}

/// Resolve the config file path.
pub fn config_file() -> Option<PathBuf> {
    resolve(PathKind::Config)
}

/// Resolve the log directory path.
pub fn log_directory() -> Option<PathBuf> {
    resolve(PathKind::LogDir)
}

/// Resolve every path under `base` on the current thread.
pub fn set_test_dir(base: impl Into<PathBuf>) {
    PATH_STRATEGY.with(|strategy| {
        *strategy.borrow_mut() = PathStrategy::Override(base.into());
    });
}

/// Reset path resolution back to XDG.
pub fn reset_to_xdg() {
    PATH_STRATEGY.with(|strategy| {
        *strategy.borrow_mut() = PathStrategy::Xdg;
    });
}

/// RAII guard for test path overrides. Resets to XDG when dropped.
pub struct TestPathGuard;

impl TestPathGuard {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        set_test_dir(base_dir);
        TestPathGuard
    }
}

impl Drop for TestPathGuard {
    fn drop(&mut self) {
        reset_to_xdg();
    }
}
