//! Party-local key-value storage backing `Load` and `Save`.

use crate::error::{Error, Result};
use crate::values::Value;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

#[async_trait]
pub trait AsyncStorage: Send + Sync {
    async fn save(&self, key: &str, value: &Value) -> Result<()>;

    async fn load(&self, key: &str) -> Result<Value>;
}

#[derive(Default)]
pub struct LocalAsyncStorage {
    store: RwLock<HashMap<String, Value>>,
}

impl LocalAsyncStorage {
    pub fn new() -> LocalAsyncStorage {
        LocalAsyncStorage::default()
    }

    pub fn from_values(values: HashMap<String, Value>) -> LocalAsyncStorage {
        LocalAsyncStorage {
            store: RwLock::new(values),
        }
    }
}

#[async_trait]
impl AsyncStorage for LocalAsyncStorage {
    async fn save(&self, key: &str, value: &Value) -> Result<()> {
        tracing::debug!("Saving value under key '{}'", key);
        self.store.write().insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Value> {
        self.store
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::StorageMiss {
                key: key.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::Constant;

    #[tokio::test]
    async fn test_save_then_load() {
        let storage = LocalAsyncStorage::new();
        let value = Constant::Float64(1.5).value();
        storage.save("weights", &value).await.unwrap();
        assert_eq!(storage.load("weights").await.unwrap(), value);
    }

    #[tokio::test]
    async fn test_load_missing_key() {
        let storage = LocalAsyncStorage::new();
        let err = storage.load("nope").await.unwrap_err();
        assert!(matches!(err, Error::StorageMiss { key } if key == "nope"));
    }
}
