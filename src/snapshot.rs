use crate::error::Error;
use crate::protocol::SerializableValue;
use crate::runtime::{ChannelStorage, Tree, TreeEntry};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::future::try_join_all;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Values whose serialized payload reaches this size are written into their own snapshot blob
/// instead of a shared header chunk.
pub const MIN_VALUE_SIZE_SEPARATE_SNAPSHOT_BLOB: usize = 8 * 1024;

/// A rolling header chunk is flushed once adding another entry would push its size estimate past
/// this bound.
pub const MAX_SNAPSHOT_BLOB_SIZE: usize = 16 * 1024;

/// Per-entry overhead used by the chunk size estimate. A tuning constant, not a format property.
const CHUNK_ENTRY_OVERHEAD: usize = 21;

/// Name of the head blob every snapshot is entered through.
pub const HEADER_BLOB_NAME: &str = "header";

type SerializedEntries = IndexMap<String, SerializableValue>;

/// Body of the head blob in the partitioned map format: the names of all auxiliary blobs, in the
/// order they were written, plus the entries that fit into the head itself.
#[derive(Serialize, Deserialize)]
struct MapHeader {
    blobs: Vec<String>,
    content: SerializedEntries,
}

/// Recursive snapshot body of a directory tree. Either field may be absent when the node holds
/// no entries of that kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryDataObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<IndexMap<String, SerializableValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdirectories: Option<IndexMap<String, DirectoryDataObject>>,
}

/// Partitions serialized map state into a blob tree.
///
/// Oversized values go into blobs of their own; everything else accumulates into rolling header
/// chunks that flush at the size bound. The final, still-open chunk becomes the `content` of the
/// head blob, which also lists every auxiliary blob name so the loader can fetch them.
pub(crate) fn serialize_map<I>(entries: I) -> Result<Tree, Error>
where
    I: IntoIterator<Item = (String, SerializableValue)>,
{
    fn flush(
        content: &SerializedEntries,
        tree_entries: &mut Vec<TreeEntry>,
        blob_names: &mut Vec<String>,
        counter: &mut usize,
    ) -> Result<(), Error> {
        let name = format!("blob{}", *counter);
        *counter += 1;
        tree_entries.push(TreeEntry::blob(name.clone(), serde_json::to_string(content)?));
        blob_names.push(name);
        Ok(())
    }

    let mut tree_entries = Vec::new();
    let mut blob_names = Vec::new();
    let mut counter = 0usize;
    let mut current = SerializedEntries::new();
    let mut current_size = 0usize;

    for (key, value) in entries {
        let payload_len = serde_json::to_string(&value.value)?.len();
        if payload_len >= MIN_VALUE_SIZE_SEPARATE_SNAPSHOT_BLOB {
            let mut single = SerializedEntries::new();
            single.insert(key, value);
            flush(&single, &mut tree_entries, &mut blob_names, &mut counter)?;
            continue;
        }
        let entry_size = value.value_type.len() + CHUNK_ENTRY_OVERHEAD + payload_len;
        if !current.is_empty() && current_size + entry_size > MAX_SNAPSHOT_BLOB_SIZE {
            flush(&current, &mut tree_entries, &mut blob_names, &mut counter)?;
            current = SerializedEntries::new();
            current_size = 0;
        }
        current.insert(key, value);
        current_size += entry_size;
    }

    let header = MapHeader {
        blobs: blob_names,
        content: current,
    };
    tree_entries.push(TreeEntry::blob(
        HEADER_BLOB_NAME,
        serde_json::to_string(&header)?,
    ));
    Ok(Tree {
        entries: tree_entries,
        id: None,
    })
}

/// Restores serialized map state from storage.
///
/// Dispatches on the shape of the head blob: a body carrying a `blobs` array is the partitioned
/// format (populate from `content`, then fetch the listed blobs in parallel), anything else is
/// the legacy single-blob format where the whole body is one entry object. Blob population order
/// does not matter: each entry targets a distinct key.
pub(crate) async fn load_map(
    storage: &dyn ChannelStorage,
) -> Result<Vec<(String, SerializableValue)>, Error> {
    let body = read_blob(storage, HEADER_BLOB_NAME).await?;
    let header: Json = serde_json::from_slice(&body)?;

    let mut entries = Vec::new();
    if header.get("blobs").map_or(false, Json::is_array) {
        let header: MapHeader = serde_json::from_value(header)?;
        entries.extend(header.content);
        let reads = header.blobs.iter().map(|name| read_blob(storage, name));
        for body in try_join_all(reads).await? {
            let chunk: SerializedEntries = serde_json::from_slice(&body)?;
            entries.extend(chunk);
        }
    } else {
        let content: SerializedEntries = serde_json::from_value(header)?;
        entries.extend(content);
    }
    Ok(entries)
}

/// Serializes a directory tree into its single-blob snapshot form.
pub(crate) fn serialize_directory(root: &DirectoryDataObject) -> Result<Tree, Error> {
    Ok(Tree {
        entries: vec![TreeEntry::blob(
            HEADER_BLOB_NAME,
            serde_json::to_string(root)?,
        )],
        id: None,
    })
}

/// Restores a directory tree snapshot.
pub(crate) async fn load_directory(
    storage: &dyn ChannelStorage,
) -> Result<DirectoryDataObject, Error> {
    let body = read_blob(storage, HEADER_BLOB_NAME).await?;
    Ok(serde_json::from_slice(&body)?)
}

async fn read_blob(storage: &dyn ChannelStorage, name: &str) -> Result<Vec<u8>, Error> {
    let encoded = storage.read(name).await?;
    Ok(BASE64.decode(encoded)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::TestStorage;
    use serde_json::json;

    fn plain_entry(key: &str, value: Json) -> (String, SerializableValue) {
        (key.to_string(), SerializableValue::plain(value))
    }

    fn blob_body(tree: &Tree, name: &str) -> SerializedEntries {
        serde_json::from_str(&tree.entry(name).unwrap().value.contents).unwrap()
    }

    #[tokio::test]
    async fn chunking_partitions_and_round_trips() {
        // ten mid-sized values plus one oversized value
        let mut entries = Vec::new();
        for i in 0..10 {
            entries.push(plain_entry(&format!("k{}", i), json!("x".repeat(2048))));
        }
        entries.push(plain_entry("big", json!("y".repeat(20 * 1024))));

        let tree = serialize_map(entries.clone()).unwrap();
        let header: MapHeader =
            serde_json::from_str(&tree.entry(HEADER_BLOB_NAME).unwrap().value.contents).unwrap();

        // one flushed chunk of seven entries, then the oversized value alone
        assert_eq!(header.blobs, ["blob0", "blob1"]);
        assert_eq!(blob_body(&tree, "blob0").len(), 7);
        let big = blob_body(&tree, "blob1");
        assert_eq!(big.len(), 1);
        assert!(big.contains_key("big"));
        assert_eq!(header.content.len(), 3);

        // no value duplicated, none dropped
        let storage = TestStorage::from_tree(&tree);
        let mut restored = load_map(&storage).await.unwrap();
        restored.sort_by(|a, b| a.0.cmp(&b.0));
        let mut expected = entries;
        expected.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(restored, expected);
    }

    #[tokio::test]
    async fn small_state_stays_in_the_header() {
        let entries = vec![plain_entry("a", json!(1)), plain_entry("b", json!(2))];
        let tree = serialize_map(entries.clone()).unwrap();

        assert_eq!(tree.entries.len(), 1);
        let storage = TestStorage::from_tree(&tree);
        assert_eq!(load_map(&storage).await.unwrap(), entries);
    }

    #[tokio::test]
    async fn legacy_single_blob_header_still_loads() {
        let storage = TestStorage::with_blob(
            HEADER_BLOB_NAME,
            json!({"title": {"type": "Plain", "value": "v1"}}).to_string(),
        );
        let restored = load_map(&storage).await.unwrap();
        assert_eq!(restored, vec![plain_entry("title", json!("v1"))]);
    }

    #[tokio::test]
    async fn missing_auxiliary_blob_fails_the_load() {
        let storage = TestStorage::with_blob(
            HEADER_BLOB_NAME,
            json!({"blobs": ["blob0"], "content": {}}).to_string(),
        );
        assert!(matches!(
            load_map(&storage).await,
            Err(Error::MissingBlob(name)) if name == "blob0"
        ));
    }

    #[tokio::test]
    async fn directory_tree_round_trips() {
        let mut storage_entries = IndexMap::new();
        storage_entries.insert("x".to_string(), SerializableValue::plain(json!(1)));
        let mut subdirectories = IndexMap::new();
        subdirectories.insert(
            "child".to_string(),
            DirectoryDataObject {
                storage: Some(storage_entries.clone()),
                subdirectories: None,
            },
        );
        let root = DirectoryDataObject {
            storage: Some(storage_entries),
            subdirectories: Some(subdirectories),
        };

        let tree = serialize_directory(&root).unwrap();
        let storage = TestStorage::from_tree(&tree);
        assert_eq!(load_directory(&storage).await.unwrap(), root);
    }
}
