use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::clock::MAX_EXTERNAL_STAMP;
use crate::codec::{self, Object, Style};
use crate::storage::store::{
    from_epoch_millis, StationRecord, StationStore, RECEIVED_AT_FIELD, STAMP_FIELD,
};
use crate::Result;

/// Whole-store snapshot file, replaced atomically on every save.
pub struct SnapshotFile {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: PathBuf) -> Self {
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        Self { path, tmp_path: PathBuf::from(tmp) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `store` as `{id: payload}` ordered by descending logical stamp.
    /// The canonical file is only ever swapped by rename, so a crash leaves
    /// either the previous snapshot or this one.
    pub async fn save(&self, store: &StationStore) -> Result<()> {
        let mut doc = Object::new();
        for record in store.by_stamp_desc() {
            doc.insert(record.id.clone(), Value::Object(record.payload.clone()));
        }
        let text = codec::encode(&Value::Object(doc), Style::Pretty)?;

        let mut file = tokio::fs::File::create(&self.tmp_path).await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&self.tmp_path, &self.path).await?;
        tracing::debug!(path = %self.path.display(), stations = store.len(), "snapshot written");
        Ok(())
    }

    /// Read the last snapshot, in file order. A missing file is an empty store.
    pub async fn load(&self) -> Result<Vec<StationRecord>> {
        if tokio::fs::try_exists(&self.tmp_path).await.unwrap_or(false) {
            tracing::warn!(path = %self.tmp_path.display(), "removing partial snapshot");
            tokio::fs::remove_file(&self.tmp_path).await.ok();
        }

        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let doc = codec::decode_object(&data)?;

        let loaded_at = SystemTime::now();
        let mut out = Vec::with_capacity(doc.len());
        for (id, value) in doc {
            let Value::Object(payload) = value else {
                tracing::warn!(station = %id, "skipping non-object snapshot entry");
                continue;
            };
            let received_at = payload
                .get(RECEIVED_AT_FIELD)
                .and_then(Value::as_u64)
                .map(from_epoch_millis)
                .unwrap_or(loaded_at);
            let stamp = payload.get(STAMP_FIELD).and_then(Value::as_u64).unwrap_or(0);
            if stamp > MAX_EXTERNAL_STAMP {
                tracing::warn!(station = %id, stamp, "skipping snapshot entry with out-of-range stamp");
                continue;
            }
            out.push(StationRecord::new(id, payload, received_at, stamp));
        }
        Ok(out)
    }
}
