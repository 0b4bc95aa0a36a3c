use rocksdb::{Options, DB, ColumnFamilyDescriptor, WriteBatch, WriteOptions};
use serde::{Serialize, de::DeserializeOwned};
use anyhow::{Result, Context};
use std::sync::Arc;

// Using bincode for fast, compact binary serialization instead of JSON.
// Every mutation of allocation or invitation state goes through this store,
// which gives the reconciliation engine its single durable source of truth.

pub struct Store {
    pub db: DB,
}

pub const CF_WALLET: &str = "wallet";
pub const CF_ALLOCATION: &str = "allocation";
pub const CF_INVITATION: &str = "invitation";
pub const CF_TRANSACTION: &str = "transaction";
pub const CF_LEDGER: &str = "ledger";

impl Store {
    /// Perform database health check: a write/read/delete round trip on a
    /// throwaway key. Run once at open so a broken volume fails fast.
    pub fn health_check(&self) -> Result<()> {
        let test_key = b"health_check";
        self.db.put(test_key, b"ok").with_context(|| "Database write test failed")?;
        let value = self.db.get(test_key).with_context(|| "Database read test failed")?;
        if value.as_deref() != Some(b"ok") {
            anyhow::bail!("Database read/write consistency check failed");
        }
        self.db.delete(test_key).with_context(|| "Database delete test failed")?;
        Ok(())
    }

    pub fn open(base_path: &str) -> Result<Self> {
        let db_path = base_path.to_string();

        let cf_names = [
            "default",
            CF_WALLET,
            CF_ALLOCATION,
            CF_INVITATION,
            CF_TRANSACTION,
            CF_LEDGER,
        ];

        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(16 * 1024 * 1024); // 16MB; record sizes are small
        cf_opts.set_max_write_buffer_number(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = cf_names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_opts.clone()))
            .collect();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let wal_dir = format!("{db_path}/logs");
        std::fs::create_dir_all(&db_path).ok();
        std::fs::create_dir_all(&wal_dir).ok();
        db_opts.set_wal_dir(&wal_dir);

        // Durability leans on the WAL; invitation state must survive a crash
        // mid-cycle, partial cycles are re-run idempotently on restart.
        db_opts.set_use_fsync(false);
        db_opts.set_bytes_per_sync(8 * 1024 * 1024);
        db_opts.set_wal_bytes_per_sync(8 * 1024 * 1024);
        db_opts.set_max_open_files(256);
        db_opts.set_keep_log_file_num(10);

        let db = DB::open_cf_descriptors(&db_opts, &db_path, cf_descriptors)
            .with_context(|| format!("Failed to open database at '{db_path}'"))?;

        let store = Store { db };
        store.health_check().with_context(|| "Database health check failed during initialization")?;
        Ok(store)
    }

    pub fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let data = bincode::serialize(value)
            .with_context(|| format!("Failed to serialize value for key '{key:?}' in CF '{cf}'"))?;

        let handle = self.db.cf_handle(cf)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))?;

        let write_opts = WriteOptions::default();
        self.db
            .put_cf_opt(handle, key, &data, &write_opts)
            .with_context(|| format!("Failed to PUT to database for key '{key:?}' in CF '{cf}'"))
    }

    pub fn get<T: DeserializeOwned + 'static>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.db.cf_handle(cf)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))?;

        match self.db.get_cf(handle, key)? {
            Some(value) => match bincode::deserialize(&value[..]) {
                Ok(deser) => Ok(Some(deser)),
                Err(_) => Err(anyhow::anyhow!(
                    "Failed to deserialize value for key '{:?}' in CF '{}'",
                    key, cf
                )),
            },
            None => Ok(None),
        }
    }

    pub fn delete(&self, cf: &str, key: &[u8]) -> Result<()> {
        let handle = self.db.cf_handle(cf)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))?;
        self.db
            .delete_cf(handle, key)
            .with_context(|| format!("Failed to DELETE key '{key:?}' in CF '{cf}'"))
    }

    /// Stages a serialized put on `batch`; nothing is written until the
    /// batch is committed via [`write_batch`](Self::write_batch).
    pub fn batch_put<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf: &str,
        key: &[u8],
        value: &T,
    ) -> Result<()> {
        let data = bincode::serialize(value)
            .with_context(|| format!("Failed to serialize value for key '{key:?}' in CF '{cf}'"))?;
        let handle = self.db.cf_handle(cf)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))?;
        batch.put_cf(handle, key, data);
        Ok(())
    }

    /// Stages a delete on `batch`.
    pub fn batch_delete(&self, batch: &mut WriteBatch, cf: &str, key: &[u8]) -> Result<()> {
        let handle = self.db.cf_handle(cf)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))?;
        batch.delete_cf(handle, key);
        Ok(())
    }

    /// Atomically applies a set of staged writes. Used wherever a mutation
    /// touches more than one record (e.g. linking a transaction while
    /// deleting its placeholder) so no half-applied state is ever visible.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts).with_context(|| "Failed to write batch to database")
    }

    /// Collect every deserializable value in a column family.
    pub fn iterate<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let handle = self.db.cf_handle(cf)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))?;
        let iter = self.db.iterator_cf(handle, rocksdb::IteratorMode::Start);
        let mut out = Vec::new();
        for item in iter {
            let (_key, value) = item?;
            if let Ok(v) = bincode::deserialize::<T>(&value) {
                out.push(v);
            }
        }
        Ok(out)
    }

    /// Number of records in a column family.
    pub fn count(&self, cf: &str) -> Result<u64> {
        let handle = self.db.cf_handle(cf)
            .ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))?;
        let iter = self.db.iterator_cf(handle, rocksdb::IteratorMode::Start);
        Ok(iter.count() as u64)
    }

    /// Force flush all memtables to disk (useful for ensuring durability)
    pub fn flush(&self) -> Result<()> {
        self.db.flush().with_context(|| "Failed to flush database")?;
        if let Err(e) = self.db.flush_wal(true) {
            eprintln!("Warning: WAL flush failed (non-critical): {e}");
        }
        Ok(())
    }

    /// Proper cleanup when dropping the database
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.db.cancel_all_background_work(true);
        Ok(())
    }
}

pub fn open(cfg: &crate::config::Storage) -> Result<Arc<Store>> {
    let store = Store::open(&cfg.path).with_context(|| {
        format!(
            "database failed to open at '{}' (check the directory is writable and no other instance holds the lock)",
            cfg.path
        )
    })?;
    Ok(Arc::new(store))
}
