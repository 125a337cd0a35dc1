use std::time::Duration;

use bytes::Bytes;
use ovs_arakoon_client::KeyValueClient;
use ovs_locks_arakoon::ArakoonLock;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};

use crate::store::{ArakoonConfiguration, ListStream};
use crate::Error;

const PATH_SEPARATOR: char = '|';

/// Encodes `value` the way configuration documents are stored: JSON with a
/// four-space indent.
///
/// # Errors
///
/// Fails if `value` cannot be represented as JSON.
pub fn to_document<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, Error> {
    let mut buffer = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut buffer, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer)?;
    Ok(Bytes::from(buffer))
}

/// Splits `"key|a.b.c"` into the store key and the JSON path inside its document.
fn split_key(key: &str) -> (&str, Option<Vec<&str>>) {
    match key.split_once(PATH_SEPARATOR) {
        Some((key, path)) => (key, Some(path.split('.').collect())),
        None => (key, None),
    }
}

/// JSON documents on top of [`ArakoonConfiguration`].
///
/// A key may address into its document: `"/ovs/framework|stores.arakoon"`
/// reads or writes the `arakoon` member of the `stores` object stored under
/// `/ovs/framework`.
#[derive(Clone, Debug)]
pub struct Configuration<C: KeyValueClient> {
    store: ArakoonConfiguration<C>,
}

impl<C: KeyValueClient> Configuration<C> {
    /// Wraps a façade.
    pub const fn new(store: ArakoonConfiguration<C>) -> Self {
        Self { store }
    }

    /// The wrapped façade.
    pub const fn store(&self) -> &ArakoonConfiguration<C> {
        &self.store
    }

    /// Reads the JSON value addressed by `key`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotFound`] when the key or any path segment is
    /// missing, and with [`Error::Json`] when the stored value is not JSON.
    pub async fn get(&self, key: &str) -> Result<Value, Error> {
        let (root, path) = split_key(key);
        let document: Value = serde_json::from_slice(&self.store.get(root).await?)?;
        let Some(path) = path else {
            return Ok(document);
        };

        let mut current = &document;
        for segment in path {
            current = current
                .get(segment)
                .ok_or_else(|| Error::NotFound(key.to_string()))?;
        }
        Ok(current.clone())
    }

    /// Like [`Configuration::get`], returning `default` when nothing is found.
    ///
    /// # Errors
    ///
    /// Fails on anything but a missing key or path.
    pub async fn get_or(&self, key: &str, default: Value) -> Result<Value, Error> {
        match self.get(key).await {
            Err(error) if error.is_not_found() => Ok(default),
            result => result,
        }
    }

    /// Reads the stored bytes of `key` without decoding them.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotFound`] when absent.
    pub async fn get_raw(&self, key: &str) -> Result<Bytes, Error> {
        self.store.get(key).await
    }

    /// Writes `value` at `key`.
    ///
    /// With a path, the stored document is read (or started empty), missing
    /// intermediate objects are created and the value is inserted before the
    /// whole document is written back.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidPath`] when the path runs through a
    /// non-object value.
    pub async fn set(&self, key: &str, value: Value) -> Result<(), Error> {
        let (root, path) = split_key(key);
        let Some(path) = path else {
            return self.store.set(root, to_document(&value)?, None).await;
        };

        let mut document = match self.get(root).await {
            Ok(document) => document,
            Err(error) if error.is_not_found() => Value::Object(Map::new()),
            Err(error) => return Err(error),
        };

        let Some((last, parents)) = path.split_last() else {
            return Err(Error::InvalidPath(key.to_string()));
        };
        let mut current = &mut document;
        for segment in parents {
            current = object_mut(current, key)?
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        object_mut(current, key)?.insert((*last).to_string(), value);

        self.store.set(root, to_document(&document)?, None).await
    }

    /// Stores `value` under `key` as is.
    ///
    /// # Errors
    ///
    /// Fails if the store rejects the write.
    pub async fn set_raw(&self, key: &str, value: Bytes) -> Result<(), Error> {
        self.store.set(key, value, None).await
    }

    /// Deletes what `key` addresses.
    ///
    /// Without a path, the key and everything below it is removed. With a
    /// nested path, the last member is removed from the document. With a
    /// single-segment path, the member is only removed when `remove_root` is
    /// set; the document is rewritten either way.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotFound`] when the document or member is missing.
    pub async fn delete(&self, key: &str, remove_root: bool) -> Result<(), Error> {
        let (root, path) = split_key(key);
        let Some(path) = path else {
            return self.store.delete(root, true, None).await;
        };

        let mut document = self.get(root).await?;
        let (last, parents) = path
            .split_last()
            .ok_or_else(|| Error::InvalidPath(key.to_string()))?;
        if !parents.is_empty() || remove_root {
            let mut current = &mut document;
            for segment in parents {
                current = current
                    .get_mut(*segment)
                    .ok_or_else(|| Error::NotFound(key.to_string()))?;
            }
            object_mut(current, key)?
                .remove(*last)
                .ok_or_else(|| Error::NotFound(key.to_string()))?;
        }

        self.store.set(root, to_document(&document)?, None).await
    }

    /// Whether `key` (including any path inside its document) exists.
    ///
    /// # Errors
    ///
    /// Fails on anything but a missing key or path.
    pub async fn exists(&self, key: &str) -> Result<bool, Error> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// See [`ArakoonConfiguration::dir_exists`].
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be read.
    pub async fn dir_exists(&self, key: &str) -> Result<bool, Error> {
        self.store.dir_exists(key).await
    }

    /// See [`ArakoonConfiguration::list`].
    pub fn list(&self, key: &str, recursive: bool) -> ListStream<'_> {
        self.store.list(key, recursive)
    }

    /// See [`ArakoonConfiguration::rename`].
    ///
    /// # Errors
    ///
    /// Returns the last assertion failure once all attempts are used up.
    pub async fn rename(&self, key: &str, new_key: &str, max_retries: usize) -> Result<(), Error> {
        self.store.rename(key, new_key, max_retries).await
    }

    /// See [`ArakoonConfiguration::lock`].
    pub fn lock(&self, name: &str, wait: Option<Duration>, expiration: Option<Duration>) -> ArakoonLock<C> {
        self.store.lock(name, wait, expiration)
    }
}

fn object_mut<'a>(value: &'a mut Value, key: &str) -> Result<&'a mut Map<String, Value>, Error> {
    value
        .as_object_mut()
        .ok_or_else(|| Error::InvalidPath(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("/foo"), ("/foo", None));
        assert_eq!(split_key("/foo|bar.baz"), ("/foo", Some(vec!["bar", "baz"])));
    }

    #[test]
    fn test_document_indent() {
        let encoded = to_document(&json!({"a": {"b": 1}})).unwrap();

        assert_eq!(
            std::str::from_utf8(&encoded).unwrap(),
            "{\n    \"a\": {\n        \"b\": 1\n    }\n}"
        );
    }
}
