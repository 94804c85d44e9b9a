//! Player persistence
//!
//! The transport calls into a [`PlayerStore`] when a session is established
//! (to stamp the last-seen time) and when it is torn down (to save where the
//! player was). The default gameplay handler also keeps the character list
//! here.

use serde::{Deserialize, Serialize};
use shared::hex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

pub type StoreResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub name: String,
    pub data: Vec<u8>,
    pub scene: String,
    pub position: [f32; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub name: String,
    /// Unix seconds of the last successful connection
    pub last_seen: u64,
    pub last_scene: Option<String>,
    pub entity_id: u16,
    pub characters: Vec<CharacterRecord>,
}

impl PlayerRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last_seen: 0,
            last_scene: None,
            entity_id: 0,
            characters: Vec::new(),
        }
    }
}

pub trait PlayerStore: Send {
    fn load(&self, name: &str) -> StoreResult<Option<PlayerRecord>>;
    fn save(&mut self, record: &PlayerRecord) -> StoreResult<()>;

    /// Loads `name`, falling back to a fresh record
    fn load_or_default(&self, name: &str) -> StoreResult<PlayerRecord> {
        Ok(self
            .load(name)?
            .unwrap_or_else(|| PlayerRecord::new(name)))
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: HashMap<String, PlayerRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl PlayerStore for MemoryStore {
    fn load(&self, name: &str) -> StoreResult<Option<PlayerRecord>> {
        Ok(self.records.get(name).cloned())
    }

    fn save(&mut self, record: &PlayerRecord) -> StoreResult<()> {
        self.records.insert(record.name.clone(), record.clone());
        Ok(())
    }
}

/// One bincode file per player under a data directory
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// File holding `name`'s record; the name is hex encoded so distinct
    /// names never share a file
    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", hex(name.as_bytes())))
    }
}

impl PlayerStore for FileStore {
    fn load(&self, name: &str) -> StoreResult<Option<PlayerRecord>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    fn save(&mut self, record: &PlayerRecord) -> StoreResult<()> {
        let bytes = bincode::serialize(record)?;
        fs::write(self.path_for(&record.name), bytes)?;
        Ok(())
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> PlayerRecord {
        PlayerRecord {
            name: "Applejack".to_string(),
            last_seen: 1_700_000_000,
            last_scene: Some("ponyville".to_string()),
            entity_id: 3,
            characters: vec![CharacterRecord {
                name: "Apple Pie".to_string(),
                data: vec![9, b'A', b'p', b'p', b'l', b'e', b' ', b'P', b'i', b'e'],
                scene: "ponyville".to_string(),
                position: [1.0, 2.0, 3.0],
            }],
        }
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryStore::new();
        assert_eq!(store.load("Applejack").unwrap(), None);

        store.save(&record()).unwrap();
        assert_eq!(store.load("Applejack").unwrap(), Some(record()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_load_or_default() {
        let store = MemoryStore::new();
        let fresh = store.load_or_default("Rarity").unwrap();
        assert_eq!(fresh.name, "Rarity");
        assert!(fresh.characters.is_empty());
    }

    #[test]
    fn test_file_store_persists_records() {
        let dir = std::env::temp_dir().join(format!("player-store-{}", std::process::id()));
        let mut store = FileStore::open(&dir).unwrap();

        store.save(&record()).unwrap();
        let reopened = FileStore::open(&dir).unwrap();
        assert_eq!(reopened.load("Applejack").unwrap(), Some(record()));
        assert_eq!(reopened.load("Nobody").unwrap(), None);

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_file_names_are_hex_encoded() {
        let dir = std::env::temp_dir();
        let store = FileStore { dir: dir.clone() };
        assert_eq!(store.path_for("../x y"), dir.join("2e2e2f782079.bin"));
        assert_ne!(
            store.path_for("127.0.0.1:5000"),
            store.path_for("127.0.0.1_5000")
        );
    }

    #[test]
    fn test_similar_names_keep_separate_records() {
        let dir = std::env::temp_dir().join(format!("player-store-names-{}", std::process::id()));
        let mut store = FileStore::open(&dir).unwrap();

        let mut first = record();
        first.name = "127.0.0.1:5000".to_string();
        let mut second = record();
        second.name = "127.0.0.1_5000".to_string();
        second.entity_id = 9;
        store.save(&first).unwrap();
        store.save(&second).unwrap();

        assert_eq!(store.load("127.0.0.1:5000").unwrap(), Some(first));
        assert_eq!(store.load("127.0.0.1_5000").unwrap(), Some(second));

        fs::remove_dir_all(dir).unwrap();
    }
}
