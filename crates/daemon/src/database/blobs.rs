use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use time::OffsetDateTime;

use common::blob::VersionedHash;

use super::{from_millis, now_millis, to_millis, Database, DatabaseError};

/// A blob row as written by the indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    pub versioned_hash: VersionedHash,
    pub size: i64,
    pub block_number: Option<u64>,
    pub inserted_at: OffsetDateTime,
}

impl BlobRecord {
    fn from_row(row: &SqliteRow) -> Result<Self, DatabaseError> {
        let hash: String = row.get("versioned_hash");
        let versioned_hash = hash.parse().map_err(|e| DatabaseError::InvalidRow {
            table: "blobs",
            reason: format!("{}: {}", hash, e),
        })?;
        let block_number: Option<i64> = row.get("block_number");
        let inserted_at: i64 = row.get("inserted_at");

        Ok(Self {
            versioned_hash,
            size: row.get("size"),
            block_number: block_number.map(|n| n as u64),
            inserted_at: from_millis(inserted_at)?,
        })
    }
}

impl Database {
    /// Record a blob, stamped with the current time. Returns `false` if the
    /// blob was already known, in which case the row is left untouched.
    pub async fn insert_blob(
        &self,
        hash: &VersionedHash,
        size: i64,
        block_number: Option<u64>,
    ) -> Result<bool, DatabaseError> {
        self.insert_blob_at(hash, size, block_number, from_millis(now_millis())?)
            .await
    }

    /// Record a blob with an explicit insertion time.
    pub async fn insert_blob_at(
        &self,
        hash: &VersionedHash,
        size: i64,
        block_number: Option<u64>,
        inserted_at: OffsetDateTime,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            INSERT INTO blobs (versioned_hash, size, block_number, inserted_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(versioned_hash) DO NOTHING
            "#,
        )
        .bind(hash.to_string())
        .bind(size)
        .bind(block_number.map(|n| n as i64))
        .bind(to_millis(inserted_at))
        .execute(&**self)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_blob(&self, hash: &VersionedHash) -> Result<Option<BlobRecord>, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT versioned_hash, size, block_number, inserted_at
            FROM blobs
            WHERE versioned_hash = ?1
            "#,
        )
        .bind(hash.to_string())
        .fetch_optional(&**self)
        .await?;

        row.as_ref().map(BlobRecord::from_row).transpose()
    }

    /// Blobs without a single storage reference, oldest first.
    pub async fn find_orphaned_blobs(&self, limit: u32) -> Result<Vec<BlobRecord>, DatabaseError> {
        self.find_orphaned_blobs_from(0, limit).await
    }

    /// Like [`find_orphaned_blobs`](Self::find_orphaned_blobs), skipping the
    /// `offset` oldest orphans.
    pub async fn find_orphaned_blobs_from(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<BlobRecord>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT b.versioned_hash, b.size, b.block_number, b.inserted_at
            FROM blobs b
            WHERE NOT EXISTS (
                SELECT 1 FROM blob_storage_references r
                WHERE r.blob_hash = b.versioned_hash
            )
            ORDER BY b.inserted_at ASC, b.rowid ASC
            LIMIT ?1 OFFSET ?2
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&**self)
        .await?;

        rows.iter().map(BlobRecord::from_row).collect()
    }

    pub async fn count_orphaned_blobs(&self) -> Result<i64, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) as count
            FROM blobs b
            WHERE NOT EXISTS (
                SELECT 1 FROM blob_storage_references r
                WHERE r.blob_hash = b.versioned_hash
            )
            "#,
        )
        .fetch_one(&**self)
        .await?;
        Ok(row.get("count"))
    }

    pub async fn blob_count(&self) -> Result<i64, DatabaseError> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM blobs")
            .fetch_one(&**self)
            .await?;
        Ok(row.get("count"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::StorageReference;
    use common::storage::StorageName;
    use time::Duration;

    fn hash(seed: &str) -> VersionedHash {
        VersionedHash::from_kzg_commitment(seed.as_bytes())
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let h = hash("a");

        assert!(db.insert_blob(&h, 131_072, Some(19_000_000)).await.unwrap());
        assert!(!db.insert_blob(&h, 1, None).await.unwrap());

        let record = db.get_blob(&h).await.unwrap().unwrap();
        assert_eq!(record.size, 131_072);
        assert_eq!(record.block_number, Some(19_000_000));
        assert_eq!(db.blob_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_orphans_oldest_first_and_limited() {
        let db = Database::in_memory().await.unwrap();
        let base = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();

        // inserted out of order on purpose
        db.insert_blob_at(&hash("t3"), 1, None, base + Duration::seconds(3))
            .await
            .unwrap();
        db.insert_blob_at(&hash("t1"), 1, None, base + Duration::seconds(1))
            .await
            .unwrap();
        db.insert_blob_at(&hash("t2"), 1, None, base + Duration::seconds(2))
            .await
            .unwrap();

        let orphans = db.find_orphaned_blobs(2).await.unwrap();
        let hashes: Vec<_> = orphans.iter().map(|b| b.versioned_hash.clone()).collect();
        assert_eq!(hashes, vec![hash("t1"), hash("t2")]);
        assert_eq!(orphans[0].inserted_at, base + Duration::seconds(1));
        assert_eq!(db.count_orphaned_blobs().await.unwrap(), 3);

        let rest = db.find_orphaned_blobs_from(2, 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].versioned_hash, hash("t3"));
        assert!(db.find_orphaned_blobs_from(3, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_reference_clears_orphan() {
        let db = Database::in_memory().await.unwrap();
        let h = hash("referenced");
        db.insert_blob(&h, 1, None).await.unwrap();

        db.upsert_storage_reference(&StorageReference {
            blob_hash: h.clone(),
            storage: StorageName::Memory,
            data_reference: "ref".to_string(),
        })
        .await
        .unwrap();

        assert!(db.find_orphaned_blobs(10).await.unwrap().is_empty());
        assert_eq!(db.count_orphaned_blobs().await.unwrap(), 0);
    }
}
