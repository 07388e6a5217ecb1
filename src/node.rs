//
// Copyright (c) 2022 chiya.dev
//
// Use of this source code is governed by the MIT License
// which can be found in the LICENSE file and at:
//
//   https://opensource.org/licenses/MIT
//
use crate::{disk::DiskStore, error::Error};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Storage-node policy over [`DiskStore`]: saving is all-or-nothing and
/// deleting is idempotent.
#[derive(Debug)]
pub struct NodeService {
    store: DiskStore,
}

impl NodeService {
    pub fn new(store: DiskStore) -> Self {
        Self { store }
    }

    /// Persists a blob from `src`. If the copy fails midway, the partial
    /// blob is removed (best effort) and the original error surfaces.
    pub async fn save_file<R>(
        &self,
        name: &str,
        src: &mut R,
        cancel: &CancellationToken,
    ) -> Result<i64, Error>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        match self.store.write(name, src, cancel).await {
            Ok(written) => Ok(written),
            Err(err) => {
                let _ = self.store.remove(name).await;
                Err(err)
            }
        }
    }

    /// Streams a blob into `dst`. A missing blob reports zero bytes written
    /// with no error; the wire protocol leaves size enforcement to the
    /// client, which knows the size it asked for.
    pub async fn get_file<W>(
        &self,
        name: &str,
        dst: &mut W,
        cancel: &CancellationToken,
    ) -> Result<i64, Error>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        match self.store.read(name, dst, cancel).await {
            Ok(written) => Ok(written),
            Err(Error::NotFound) => Ok(0),
            Err(err) => Err(err),
        }
    }

    pub async fn delete_file(&self, name: &str) -> Result<(), Error> {
        self.store.remove(name).await
    }
}
