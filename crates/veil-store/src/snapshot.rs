//! Snapshot codec: one JSON document mapping conversation id to its
//! ordered message log. Written whole, replaced atomically via rename.

use std::collections::HashMap;
use std::path::Path;

use veil_types::models::Message;

use crate::StoreError;

pub(crate) fn load(path: &Path) -> Result<HashMap<String, Vec<Message>>, StoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

pub(crate) async fn write(path: &Path, encoded: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, encoded).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
