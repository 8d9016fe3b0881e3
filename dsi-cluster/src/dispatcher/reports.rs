//! Local reports directory
//!
//! Files retrieved from hosts land under `reports/<prefix>/<host alias>/`.
//! `reports` is a symlink to a fresh timestamped directory.

use chrono::Local;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::info;

pub const REPORTS_DIR: &str = "reports";

/// Replace `<base>/reports` with a link to a new `reports-<timestamp>` directory
pub fn prepare_reports_dir(base: &Path) -> io::Result<PathBuf> {
    let link = base.join(REPORTS_DIR);
    if let Ok(metadata) = fs::symlink_metadata(&link) {
        if metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is a directory, not a link", link.display()),
            ));
        }
        fs::remove_file(&link)?;
    }

    let stamped = base.join(format!(
        "{}-{}",
        REPORTS_DIR,
        Local::now().format("%Y-%m-%dT%H:%M:%S%.6f%:z")
    ));
    fs::create_dir_all(&stamped)?;
    link_dir(&stamped, &link)?;

    info!("Prepared reports directory {}", stamped.display());
    Ok(stamped)
}

#[cfg(unix)]
fn link_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn link_dir(target: &Path, link: &Path) -> io::Result<()> {
    fs::create_dir_all(link)?;
    fs::write(link.join("LOCATION"), target.display().to_string())
}

/// Local destination of a retrieved file
pub fn report_path(base: &Path, prefix: &str, alias: &str, target: &str) -> PathBuf {
    let mut path = base.join(REPORTS_DIR);
    if !prefix.is_empty() {
        path.push(prefix);
    }
    path.push(alias);
    for component in Path::new(target).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::ParentDir => {
                path.push("..");
            }
            _ => {}
        }
    }
    path
}
