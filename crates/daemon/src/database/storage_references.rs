use sqlx::Row;

use common::blob::VersionedHash;
use common::storage::StorageName;

use super::{now_millis, Database, DatabaseError};

/// Durable record that `blob_hash` is stored in `storage` under
/// `data_reference`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageReference {
    pub blob_hash: VersionedHash,
    pub storage: StorageName,
    pub data_reference: String,
}

impl Database {
    /// Insert or replace the reference for `(blob_hash, storage)`.
    pub async fn upsert_storage_reference(
        &self,
        reference: &StorageReference,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO blob_storage_references (blob_hash, storage, data_reference, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(blob_hash, storage) DO UPDATE SET
                data_reference = excluded.data_reference,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(reference.blob_hash.to_string())
        .bind(reference.storage)
        .bind(&reference.data_reference)
        .bind(now_millis())
        .execute(&**self)
        .await?;

        Ok(())
    }

    /// Every reference recorded for a blob, ordered by storage name.
    pub async fn storage_references(
        &self,
        hash: &VersionedHash,
    ) -> Result<Vec<StorageReference>, DatabaseError> {
        let rows = sqlx::query(
            r#"
            SELECT storage, data_reference
            FROM blob_storage_references
            WHERE blob_hash = ?1
            ORDER BY storage ASC
            "#,
        )
        .bind(hash.to_string())
        .fetch_all(&**self)
        .await?;

        rows.iter()
            .map(|row| -> Result<StorageReference, DatabaseError> {
                Ok(StorageReference {
                    blob_hash: hash.clone(),
                    storage: row.try_get("storage")?,
                    data_reference: row.get("data_reference"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_replaces_reference() {
        let db = Database::in_memory().await.unwrap();
        let hash = VersionedHash::from_kzg_commitment(b"upsert");

        let mut reference = StorageReference {
            blob_hash: hash.clone(),
            storage: StorageName::Sqlite,
            data_reference: "first".to_string(),
        };
        db.upsert_storage_reference(&reference).await.unwrap();

        reference.data_reference = "second".to_string();
        db.upsert_storage_reference(&reference).await.unwrap();

        db.upsert_storage_reference(&StorageReference {
            blob_hash: hash.clone(),
            storage: StorageName::FileSystem,
            data_reference: "fs".to_string(),
        })
        .await
        .unwrap();

        let references = db.storage_references(&hash).await.unwrap();
        assert_eq!(references.len(), 2);
        assert_eq!(references[0].storage, StorageName::FileSystem);
        assert_eq!(references[1].data_reference, "second");
    }
}
