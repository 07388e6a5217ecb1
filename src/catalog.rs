//
// Copyright (c) 2022 chiya.dev
//
// Use of this source code is governed by the MIT License
// which can be found in the LICENSE file and at:
//
//   https://opensource.org/licenses/MIT
//
use crate::error::Error;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, query, query_as, FromRow, PgPool};
use uuid::Uuid;

/// Lifecycle of a shard during upload: `New` at placement,
/// `InProgress` while bytes stream to the node, then `Ok` or `Error`.
/// The ordering makes `max` over a file's shards its aggregate status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[repr(i32)]
pub enum ShardStatus {
    Ok = 0,
    New = 1,
    InProgress = 2,
    Error = 3,
}

#[derive(Debug, FromRow, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    /// Address of the node's TCP endpoint, e.g. `10.0.0.7:8123`.
    pub addr: String,
}

#[derive(Debug, FromRow, Serialize, Deserialize)]
pub struct Shard {
    /// Node holding this shard's bytes.
    pub node_id: Uuid,
    /// Position within the file; a file's shards cover `0..N-1`.
    pub index: i32,
    pub size: i64,
    /// Time of shard placement.
    pub created_at: NaiveDateTime,
    pub status: ShardStatus,
}

#[derive(Debug)]
pub struct FileRecord {
    pub id: Uuid,
    pub location: String,
    pub shards: Vec<Shard>,
}

/// Shard descriptor for [`Catalog::create_file`]; rows are written with
/// status [`ShardStatus::New`].
#[derive(Debug)]
pub struct ShardPlacement {
    pub node_id: Uuid,
    pub index: i32,
    pub size: i64,
}

const MIGRATION_VERSION_KEY: i32 = 1;

/// Persisted state of the service: nodes, files and shard placements.
#[derive(Debug)]
pub struct Catalog {
    pool: PgPool,
}

impl Catalog {
    pub fn new(connection: impl AsRef<str>, max_connections: u32) -> Result<Self, Error> {
        Ok(Self {
            pool: PgPoolOptions::new()
                .max_connections(max_connections)
                .connect_lazy(connection.as_ref())?,
        })
    }

    pub async fn migrate(&self) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        query(
            "create table if not exists config (
                key integer primary key,
                value text not null
            )",
        )
        .execute(&mut *tx)
        .await?;

        let row: Option<(String,)> = query_as(
            "select value from config
            where key = $1",
        )
        .bind(MIGRATION_VERSION_KEY)
        .fetch_optional(&mut *tx)
        .await?;

        let mut version: u32 = match row {
            None => 0,
            Some((value,)) => value
                .parse()
                .map_err(|_| Error::Unknown(format!("invalid migration version '{value}'")))?,
        };

        loop {
            let statements = match version {
                0 => include_str!("sql/migration1.sql"),
                1 => break,
                _ => {
                    return Err(Error::Unknown(format!(
                        "migration version {version} is not forward compatible"
                    )))
                }
            };

            version += 1;
            warn!("applying migration {version}");

            // the driver takes one statement per query
            for statement in statements.split(';') {
                if statement.trim().is_empty() {
                    continue;
                }

                query(statement).execute(&mut *tx).await?;
            }
        }

        query(
            "insert into config (key, value)
            values ($1, $2)
            on conflict (key)
            do
                update set value = $2",
        )
        .bind(MIGRATION_VERSION_KEY)
        .bind(version.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn create_node(&self, addr: &str) -> Result<Node, Error> {
        Ok(query_as::<_, Node>(
            "insert into nodes (addr)
            values ($1)
            returning *",
        )
        .bind(addr)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn get_node(&self, id: Uuid) -> Result<Node, Error> {
        query_as::<_, Node>(
            "select id, addr from nodes
            where id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound)
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        Ok(query_as::<_, Node>("select id, addr from nodes")
            .fetch_all(&self.pool)
            .await?)
    }

    /// Up to `count` nodes ordered by current load ascending, where load is
    /// the total size of the node's shards that are not in error. Ties are
    /// broken by node id so the ordering is stable.
    pub async fn get_freer_nodes(&self, count: i64) -> Result<Vec<Node>, Error> {
        Ok(query_as::<_, Node>(
            "select n.id, n.addr from nodes n
            left join shards s on
                n.id = s.node_id and s.status <> $2
            group by n.id, n.addr
            order by coalesce(sum(s.size), 0), n.id
            limit $1",
        )
        .bind(count)
        .bind(ShardStatus::Error)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Inserts the file row and all of its shard rows in one transaction;
    /// a location conflict (case-folded) rolls everything back.
    pub async fn create_file(
        &self,
        location: &str,
        shards: &[ShardPlacement],
    ) -> Result<Uuid, Error> {
        let mut tx = self.pool.begin().await?;

        let (file_id,): (Uuid,) = query_as(
            "insert into files (location)
            values ($1)
            returning id",
        )
        .bind(location)
        .fetch_one(&mut *tx)
        .await?;

        for shard in shards {
            query(
                "insert into shards (file_id, node_id, index, size, status)
                values ($1, $2, $3, $4, $5)",
            )
            .bind(file_id)
            .bind(shard.node_id)
            .bind(shard.index)
            .bind(shard.size)
            .bind(ShardStatus::New)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(file_id)
    }

    /// Updates exactly one shard row; a missing row is a no-op.
    pub async fn set_shard_status(
        &self,
        file_id: Uuid,
        node_id: Uuid,
        index: i32,
        status: ShardStatus,
    ) -> Result<(), Error> {
        query(
            "update shards set status = $4
            where file_id = $1 and node_id = $2 and index = $3",
        )
        .bind(file_id)
        .bind(node_id)
        .bind(index)
        .bind(status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_file(&self, id: Uuid) -> Result<FileRecord, Error> {
        let row: Option<(String,)> = query_as(
            "select location from files
            where id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let location = row.ok_or(Error::NotFound)?.0;

        let shards: Vec<Shard> = query_as(
            "select node_id, index, size, created_at, status from shards
            where file_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        // a file row without placements is never served
        if shards.is_empty() {
            return Err(Error::NotFound);
        }

        Ok(FileRecord {
            id,
            location,
            shards,
        })
    }

    pub async fn get_file_by_location(&self, location: &str) -> Result<FileRecord, Error> {
        let row: Option<(Uuid,)> = query_as(
            "select id from files
            where lower(location) = lower($1)",
        )
        .bind(location)
        .fetch_optional(&self.pool)
        .await?;
        let id = row.ok_or(Error::NotFound)?.0;

        self.get_file(id).await
    }

    /// Removes the file row; shard rows go with it through the cascade.
    /// Deleting an absent file is not an error.
    pub async fn delete_file(&self, id: Uuid) -> Result<(), Error> {
        query(
            "delete from files
            where id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
