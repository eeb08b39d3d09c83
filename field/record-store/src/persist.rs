use std::{
    fs::{File, OpenOptions, TryLockError},
    io::Write,
    path::Path,
};

use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, Result};

/// Read a JSON document, `None` if the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let buf = match std::fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(Error::Io {
                path: path.into(),
                source,
            });
        }
    };
    let value = serde_json::from_slice(&buf).map_err(|source| Error::Json {
        path: path.into(),
        source,
    })?;
    Ok(Some(value))
}

/// Write `value` as JSON such that readers see either the old or the new
/// document, never a partial one.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let io_err = |source| Error::Io {
        path: path.into(),
        source,
    };
    let buf = serde_json::to_vec_pretty(value).map_err(|source| Error::Json {
        path: path.into(),
        source,
    })?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);
    {
        let mut fd = std::fs::File::create(&tmp_path).map_err(io_err)?;
        fd.write_all(&buf).map_err(io_err)?;
        fd.sync_all().map_err(io_err)?;
    }
    std::fs::rename(&tmp_path, path).map_err(io_err)?;
    Ok(())
}

/// The name of the lock file created in a locked directory.
pub const LOCK_FNAME: &str = ".lock";

/// Exclusive claim on a store directory, released when dropped.
#[derive(Debug)]
pub struct DirLock {
    _file: File,
}

/// Claim `dirname` for the lifetime of the returned guard.
///
/// Fails with [Error::InUse] while another handle holds the claim, whether
/// in this process or another one.
pub fn lock_dir(dirname: &Path) -> Result<DirLock> {
    let path = dirname.join(LOCK_FNAME);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
    match file.try_lock() {
        Ok(()) => Ok(DirLock { _file: file }),
        Err(TryLockError::WouldBlock) => Err(Error::InUse {
            path: dirname.into(),
        }),
        Err(TryLockError::Error(source)) => Err(Error::Io { path, source }),
    }
}
