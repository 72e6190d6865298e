//! Reading and writing our JSON state files.

use std::{
    ffi::OsString,
    fs::{self, File},
    io::{BufReader, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
};

use anyhow::{format_err, Context};
use serde::{de::DeserializeOwned, Serialize};

use crate::Result;

/// Read and parse a JSON file. Returns `Ok(None)` if the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let f = match File::open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format_err!("cannot open {}", path.display()))
        }
    };
    let value = serde_json::from_reader(BufReader::new(f))
        .with_context(|| format_err!("error parsing {}", path.display()))?;
    Ok(Some(value))
}

/// Write `value` to `path` as JSON.
///
/// We write to a temporary file next to `path` and rename it into place, so
/// that readers (and the next run, if we crash) see either the old file or
/// the new one, never half of one.
pub fn write_json_atomically<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
    pretty: bool,
) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format_err!("cannot create {}", parent.display()))?;
    }

    let tmp_path = temporary_path_for(path);
    let write = || -> Result<()> {
        let f = File::create(&tmp_path)?;
        let mut wtr = BufWriter::new(f);
        if pretty {
            serde_json::to_writer_pretty(&mut wtr, value)?;
        } else {
            serde_json::to_writer(&mut wtr, value)?;
        }
        wtr.write_all(b"\n")?;
        let f = wtr.into_inner().map_err(|err| err.into_error())?;
        f.sync_all()?;
        Ok(())
    };
    write().with_context(|| format_err!("cannot write {}", tmp_path.display()))?;

    fs::rename(&tmp_path, path).with_context(|| {
        format_err!(
            "cannot move {} into place at {}",
            tmp_path.display(),
            path.display()
        )
    })
}

/// Remove a file if it exists.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format_err!("cannot remove {}", path.display())),
    }
}

/// `foo.json` becomes `foo.json.tmp`.
fn temporary_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn missing_files_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let value: Option<Vec<String>> = read_json(&dir.path().join("nope.json")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn writes_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mut value = BTreeMap::new();
        value.insert("a".to_owned(), 1);
        write_json_atomically(&path, &value, true).unwrap();
        let read: BTreeMap<String, i32> = read_json(&path).unwrap().unwrap();
        assert_eq!(read, value);
        assert!(!temporary_path_for(&path).exists());
    }

    #[test]
    fn bad_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        assert!(read_json::<Vec<String>>(&path).is_err());
    }

    #[test]
    fn removing_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_if_exists(&dir.path().join("gone.json")).unwrap();
    }
}
