//! The filesystem collaborator boundary. The on-disk filesystem lives
//! outside the core; it registers itself here at attach time and the core
//! only ever talks through this interface. Paths are validated before they
//! cross the boundary.

use alloc::{string::String, sync::Arc};
use warren_abi::{stat::Stat, OpenFlags, NAME_MAX};

use crate::{
    error::{ensure, err, Result},
    fs::fd::Fd,
    spin::once::Once,
};

pub mod fd;

/// Opaque inode handle the filesystem hands out; the core only threads it
/// back (the cwd inode for relative lookups, fs_close at teardown).
pub type InodeCookie = u64;

pub trait Filesystem: Send + Sync {
    fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u64,
        cwd: InodeCookie,
        dev_maj: u64,
        dev_min: u64,
    ) -> Result<Fd>;
    fn stat(&self, path: &str, cwd: InodeCookie) -> Result<Stat>;
    fn rename(&self, old: &str, new: &str, cwd: InodeCookie) -> Result<()>;
    fn mkdir(&self, path: &str, mode: u64, cwd: InodeCookie) -> Result<()>;
    fn unlink(&self, path: &str, cwd: InodeCookie) -> Result<()>;
    fn link(&self, old: &str, new: &str, cwd: InodeCookie) -> Result<()>;
    fn mknod(&self, path: &str, mode: u64, dev: u64, cwd: InodeCookie) -> Result<()>;
    fn sync(&self) -> Result<()>;
    fn close_inode(&self, inode: InodeCookie) -> Result<()>;
    /// Full path of an inode, for getcwd.
    fn full_path(&self, inode: InodeCookie) -> Result<String>;
}

static FILESYSTEM: Once<Arc<dyn Filesystem>> = Once::new();

pub fn set_filesystem(filesystem: Arc<dyn Filesystem>) {
    FILESYSTEM.call_once(|| filesystem);
}

fn filesystem() -> Result<&'static Arc<dyn Filesystem>> {
    FILESYSTEM.get().ok_or(err!(NoDev))
}

pub fn check_path(path: &str) -> Result<()> {
    ensure!(!path.is_empty(), NoEnt);
    ensure!(path.len() <= NAME_MAX, NameTooLong);
    Ok(())
}

pub fn fs_open(
    path: &str,
    flags: OpenFlags,
    mode: u64,
    cwd: InodeCookie,
    dev_maj: u64,
    dev_min: u64,
) -> Result<Fd> {
    check_path(path)?;
    filesystem()?.open(path, flags, mode, cwd, dev_maj, dev_min)
}

pub fn fs_stat(path: &str, cwd: InodeCookie) -> Result<Stat> {
    check_path(path)?;
    filesystem()?.stat(path, cwd)
}

pub fn fs_rename(old: &str, new: &str, cwd: InodeCookie) -> Result<()> {
    check_path(old)?;
    check_path(new)?;
    filesystem()?.rename(old, new, cwd)
}

pub fn fs_mkdir(path: &str, mode: u64, cwd: InodeCookie) -> Result<()> {
    check_path(path)?;
    filesystem()?.mkdir(path, mode, cwd)
}

pub fn fs_unlink(path: &str, cwd: InodeCookie) -> Result<()> {
    check_path(path)?;
    filesystem()?.unlink(path, cwd)
}

pub fn fs_link(old: &str, new: &str, cwd: InodeCookie) -> Result<()> {
    check_path(old)?;
    check_path(new)?;
    filesystem()?.link(old, new, cwd)
}

pub fn fs_mknod(path: &str, mode: u64, dev: u64, cwd: InodeCookie) -> Result<()> {
    check_path(path)?;
    filesystem()?.mknod(path, mode, dev, cwd)
}

pub fn fs_sync() -> Result<()> {
    filesystem()?.sync()
}

pub fn fs_close(inode: InodeCookie) -> Result<()> {
    filesystem()?.close_inode(inode)
}

pub fn fs_full_path(inode: InodeCookie) -> Result<String> {
    filesystem()?.full_path(inode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized_paths() {
        assert!(check_path("").is_err());
        assert!(check_path("/bin/init").is_ok());
        let long = "a".repeat(NAME_MAX + 1);
        assert!(check_path(&long).is_err());
    }
}
