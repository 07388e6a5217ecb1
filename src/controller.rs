//
// Copyright (c) 2022 chiya.dev
//
// Use of this source code is governed by the MIT License
// which can be found in the LICENSE file and at:
//
//   https://opensource.org/licenses/MIT
//
use crate::{
    catalog::{Catalog, Node, ShardPlacement, ShardStatus},
    client::Client,
    error::Error,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time,
};
use uuid::Uuid;

const PARTS_PER_FILE: usize = 6;
const COMPENSATION_DEADLINE: Duration = Duration::from_secs(10);

/// Orchestrates uploads, downloads and deletes across the catalog and the
/// storage nodes.
#[derive(Debug)]
pub struct Controller {
    parts_per_file: usize,
    catalog: Catalog,
    clients: Mutex<HashMap<Uuid, Arc<Client>>>,
}

#[derive(Debug)]
pub struct FoundFile {
    pub id: Uuid,
    pub size: i64,
    pub status: ShardStatus,
}

/// Cleanup action recorded during upload; on failure the stack is replayed
/// newest-first under a fresh deadline.
enum Compensation {
    FileRecord(Uuid),
    Blob { client: Arc<Client>, name: String },
}

/// Name of the blob holding shard `index` of a file on its node.
pub(crate) fn shard_object_name(file_id: Uuid, index: i32) -> String {
    format!("{file_id}.{index}")
}

/// Splits `size` into `count` non-negative parts summing to `size`; every
/// part is `size / count` except the last, which absorbs the remainder.
fn calculate_parts(size: i64, count: usize) -> Vec<i64> {
    let part = size / count as i64;
    let remainder = size % count as i64;

    let mut parts = vec![part; count];
    if let Some(last) = parts.last_mut() {
        *last += remainder;
    }

    parts
}

impl Controller {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            parts_per_file: PARTS_PER_FILE,
            catalog,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn node_client(&self, node: &Node) -> Arc<Client> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);

        clients
            .entry(node.id)
            .or_insert_with(|| Arc::new(Client::new(node.addr.clone())))
            .clone()
    }

    pub async fn join_node(&self, addr: &str) -> Result<Uuid, Error> {
        let node = self.catalog.create_node(addr).await?;
        Ok(node.id)
    }

    /// Stripes `content` across the pool. The placement is recorded first;
    /// shards then stream out strictly in index order, consuming exactly
    /// their part of the single reader. Any failure replays the recorded
    /// compensations and surfaces the original error.
    pub async fn upload_file<R>(
        &self,
        location: &str,
        size: i64,
        content: &mut R,
    ) -> Result<Uuid, Error>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let parts = calculate_parts(size, self.parts_per_file);

        let mut nodes = self.catalog.get_freer_nodes(self.parts_per_file as i64).await?;
        if nodes.len() != parts.len() {
            return Err(Error::Unavailable(
                "wrong number of parts or number of nodes".into(),
            ));
        }

        // freest node last, where the remainder-bearing part lands
        nodes.reverse();

        let placements: Vec<ShardPlacement> = nodes
            .iter()
            .zip(&parts)
            .enumerate()
            .map(|(index, (node, size))| ShardPlacement {
                node_id: node.id,
                index: index as i32,
                size: *size,
            })
            .collect();

        let file_id = self.catalog.create_file(location, &placements).await?;

        let mut compensations = vec![Compensation::FileRecord(file_id)];

        for (index, node) in nodes.iter().enumerate() {
            let index = index as i32;
            let client = self.node_client(node);

            if let Err(err) = self
                .catalog
                .set_shard_status(file_id, node.id, index, ShardStatus::InProgress)
                .await
            {
                self.run_compensations(&compensations).await;
                return Err(err);
            }

            let object = shard_object_name(file_id, index);
            compensations.push(Compensation::Blob {
                client: client.clone(),
                name: object.clone(),
            });

            if let Err(err) = client.save_file(&object, content, parts[index as usize]).await {
                if let Err(status_err) = self
                    .catalog
                    .set_shard_status(file_id, node.id, index, ShardStatus::Error)
                    .await
                {
                    error!("failed to record shard error status: {status_err}");
                }

                self.run_compensations(&compensations).await;
                return Err(err);
            }

            if let Err(err) = self
                .catalog
                .set_shard_status(file_id, node.id, index, ShardStatus::Ok)
                .await
            {
                self.run_compensations(&compensations).await;
                return Err(err);
            }
        }

        Ok(file_id)
    }

    /// Resolves a file by location, reporting its total size and aggregate
    /// status (the worst status over its shards).
    pub async fn search_file(&self, location: &str) -> Result<FoundFile, Error> {
        let file = self.catalog.get_file_by_location(location).await?;

        let size = file.shards.iter().map(|shard| shard.size).sum();
        let status = file
            .shards
            .iter()
            .map(|shard| shard.status)
            .max()
            .unwrap_or(ShardStatus::Ok);

        Ok(FoundFile {
            id: file.id,
            size,
            status,
        })
    }

    /// Reassembles the file into `dst`, shard by shard in index order.
    /// A failing shard aborts the transfer.
    pub async fn download_file<W>(&self, id: Uuid, dst: &mut W) -> Result<(), Error>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut file = self.catalog.get_file(id).await?;
        file.shards.sort_by_key(|shard| shard.index);

        for shard in &file.shards {
            let node = self.catalog.get_node(shard.node_id).await?;
            let client = self.node_client(&node);

            client
                .get_file(&shard_object_name(id, shard.index), dst, shard.size)
                .await?;
        }

        Ok(())
    }

    /// Deletes the blobs on every node, then the catalog record. The first
    /// node-side failure aborts and leaves the record in place.
    pub async fn delete_file(&self, id: Uuid) -> Result<(), Error> {
        let file = self.catalog.get_file(id).await?;

        for shard in &file.shards {
            let node = self.catalog.get_node(shard.node_id).await?;
            let client = self.node_client(&node);

            client
                .delete_file(&shard_object_name(id, shard.index))
                .await?;
        }

        self.catalog.delete_file(id).await
    }

    async fn run_compensations(&self, compensations: &[Compensation]) {
        let replay = async {
            for action in compensations.iter().rev() {
                match action {
                    Compensation::FileRecord(id) => {
                        if let Err(err) = self.catalog.delete_file(*id).await {
                            error!("error to clean wrong file record: {err}");
                        }
                    }
                    Compensation::Blob { client, name } => {
                        if let Err(err) = client.delete_file(name).await {
                            error!("error to clean wrong file data: {err}");
                        }
                    }
                }
            }
        };

        if time::timeout(COMPENSATION_DEADLINE, replay).await.is_err() {
            error!("compensation ran past its deadline; orphaned data may remain");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_cover_the_size_exactly() {
        for size in [0, 1, 5, 6, 100, 599, 600, 601, 10 * 1024 * 1024 * 1024] {
            let parts = calculate_parts(size, 6);
            assert_eq!(parts.len(), 6);
            assert_eq!(parts.iter().sum::<i64>(), size);

            // only the last part may differ from the floor, by the remainder
            for part in &parts[..5] {
                assert_eq!(*part, size / 6);
            }
            assert_eq!(parts[5], size / 6 + size % 6);
        }
    }

    #[test]
    fn even_size_stripes_evenly() {
        assert_eq!(calculate_parts(600, 6), vec![100; 6]);
    }

    #[test]
    fn remainder_lands_on_the_last_part() {
        assert_eq!(
            calculate_parts(601, 6),
            vec![100, 100, 100, 100, 100, 101]
        );
    }

    #[test]
    fn single_part_takes_everything() {
        assert_eq!(calculate_parts(42, 1), vec![42]);
    }

    #[test]
    fn shard_objects_are_named_by_file_and_index() {
        let id = Uuid::nil();
        assert_eq!(
            shard_object_name(id, 3),
            "00000000-0000-0000-0000-000000000000.3"
        );
    }
}
