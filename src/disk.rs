//
// Copyright (c) 2022 chiya.dev
//
// Use of this source code is governed by the MIT License
// which can be found in the LICENSE file and at:
//
//   https://opensource.org/licenses/MIT
//
use crate::error::Error;
use std::{
    io::{self, ErrorKind},
    path::PathBuf,
};
use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};
use tokio_util::sync::CancellationToken;

pub const CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB

/// Blob store scoped to a single root directory. Object names are plain
/// file names; anything resembling a sub-path is rejected.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Opens the store, creating the root directory if it does not exist.
    /// Fails if the path is not a writable directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();

        match std::fs::metadata(&root) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(Error::Io(io::Error::new(
                        ErrorKind::InvalidInput,
                        format!("'{}' is not a directory", root.display()),
                    )));
                }

                if meta.permissions().readonly() {
                    return Err(Error::Io(io::Error::new(
                        ErrorKind::PermissionDenied,
                        format!("'{}' is not writable", root.display()),
                    )));
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                std::fs::create_dir_all(&root)?;
            }
            Err(err) => return Err(err.into()),
        }

        Ok(Self { root })
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, Error> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(Error::BadRequest(format!("invalid object name '{name}'")));
        }

        Ok(self.root.join(name))
    }

    /// Creates (truncating) the named blob and copies `src` into it until
    /// EOF or cancellation. A partially written blob is left in place; the
    /// caller decides whether to clean it up.
    pub async fn write<R>(
        &self,
        name: &str,
        src: &mut R,
        cancel: &CancellationToken,
    ) -> Result<i64, Error>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path = self.resolve(name)?;
        let mut file = fs::File::create(&path).await?;

        let written = copy_chunked(src, &mut file, cancel).await?;
        file.flush().await?;

        Ok(written)
    }

    /// Copies the named blob into `dst`. A missing blob is `NotFound`.
    pub async fn read<W>(
        &self,
        name: &str,
        dst: &mut W,
        cancel: &CancellationToken,
    ) -> Result<i64, Error>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let path = self.resolve(name)?;
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(Error::NotFound),
            Err(err) => return Err(err.into()),
        };

        copy_chunked(&mut file, dst, cancel).await
    }

    /// Deletes the named blob; deleting a missing blob is not an error.
    pub async fn remove(&self, name: &str) -> Result<(), Error> {
        let path = self.resolve(name)?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Copies `src` to `dst` in chunks of at most [`CHUNK_SIZE`], checking for
/// cancellation before every chunk.
pub(crate) async fn copy_chunked<R, W>(
    src: &mut R,
    dst: &mut W,
    cancel: &CancellationToken,
) -> Result<i64, Error>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut written: i64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let read = src.read(&mut buffer).await?;
        if read == 0 {
            break;
        }

        dst.write_all(&buffer[..read]).await?;
        written += read as i64;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, DiskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();

        let written = store
            .write("blob", &mut &b"hello world"[..], &cancel)
            .await
            .unwrap();
        assert_eq!(written, 11);

        let mut output = Vec::new();
        let read = store.read("blob", &mut output, &cancel).await.unwrap();
        assert_eq!(read, 11);
        assert_eq!(output, b"hello world");
    }

    #[tokio::test]
    async fn write_truncates_previous_content() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();

        store
            .write("blob", &mut &b"something longer"[..], &cancel)
            .await
            .unwrap();
        store.write("blob", &mut &b"short"[..], &cancel).await.unwrap();

        let mut output = Vec::new();
        store.read("blob", &mut output, &cancel).await.unwrap();
        assert_eq!(output, b"short");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();

        let mut output = Vec::new();
        let err = store.read("nope", &mut output, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();

        store.write("blob", &mut &b"data"[..], &cancel).await.unwrap();
        store.remove("blob").await.unwrap();
        store.remove("blob").await.unwrap();

        let mut output = Vec::new();
        let err = store.read("blob", &mut output, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn sub_path_names_are_rejected() {
        let (_dir, store) = store();
        let cancel = CancellationToken::new();

        for name in ["a/b", "..\\c", "..", ".", ""] {
            let err = store
                .write(name, &mut &b"data"[..], &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::BadRequest(_)), "name {name:?}");
        }
    }

    #[tokio::test]
    async fn cancelled_write_aborts_before_copying() {
        let (dir, store) = store();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = store
            .write("blob", &mut &b"data"[..], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        // the blob was created but nothing was copied into it
        assert_eq!(std::fs::read(dir.path().join("blob")).unwrap(), b"");
    }

    #[test]
    fn root_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();

        assert!(DiskStore::new(&file).is_err());
    }
}
