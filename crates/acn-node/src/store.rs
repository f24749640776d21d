//! Append-only store of relay client records.
//!
//! Each entry is a 4-byte big-endian length followed by the JSON record,
//! the same framing the wire uses. The file is reloaded at startup so relay
//! clients stay resolvable across restarts; later entries for an address
//! replace earlier ones.

use acn_types::AgentRecord;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

pub struct RecordStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl RecordStore {
    /// Open (or create) the store and return the records it holds.
    pub fn open(path: impl AsRef<Path>) -> io::Result<(Self, Vec<AgentRecord>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let records = if path.exists() {
            let mut bytes = Vec::new();
            File::open(&path)?.read_to_end(&mut bytes)?;
            parse_entries(&path, &bytes)
        } else {
            Vec::new()
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), records = records.len(), "ACN: record store opened");
        Ok((
            Self {
                path,
                file: Mutex::new(file),
            },
            records,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &AgentRecord) -> io::Result<()> {
        let json = serde_json::to_vec(record)?;
        let len = u32::try_from(json.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record too large"))?;
        let mut entry = Vec::with_capacity(4 + json.len());
        entry.extend_from_slice(&len.to_be_bytes());
        entry.extend_from_slice(&json);

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(&entry)
    }

    pub fn sync(&self) -> io::Result<()> {
        let file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.sync_all()
    }
}

fn parse_entries(path: &Path, bytes: &[u8]) -> Vec<AgentRecord> {
    let mut by_address: HashMap<String, AgentRecord> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let Some(header) = bytes.get(offset..offset + 4) else {
            warn!(path = %path.display(), offset, "ACN: truncated record store tail ignored");
            break;
        };
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let start = offset + 4;
        let Some(body) = bytes.get(start..start + len) else {
            warn!(path = %path.display(), offset, "ACN: truncated record store tail ignored");
            break;
        };
        match serde_json::from_slice::<AgentRecord>(body) {
            Ok(record) => {
                if !by_address.contains_key(&record.address) {
                    order.push(record.address.clone());
                }
                by_address.insert(record.address.clone(), record);
            }
            Err(e) => warn!(path = %path.display(), offset, error = %e, "ACN: skipping corrupt stored record"),
        }
        offset = start + len;
    }

    order
        .into_iter()
        .filter_map(|addr| by_address.remove(&addr))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use acn_types::record::generate_signing_key;
    use chrono::NaiveDate;

    fn record(peer_key: &str) -> AgentRecord {
        AgentRecord::issue(
            "acn",
            &generate_signing_key(),
            peer_key,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2099, 1, 1).unwrap(),
        )
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.bin");
        let a = record("aa");
        let b = record("bb");
        {
            let (store, loaded) = RecordStore::open(&path).unwrap();
            assert!(loaded.is_empty());
            store.append(&a).unwrap();
            store.append(&b).unwrap();
            store.sync().unwrap();
        }
        let (_, loaded) = RecordStore::open(&path).unwrap();
        assert_eq!(loaded, vec![a, b]);
    }

    #[test]
    fn test_later_entry_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.bin");
        let key = generate_signing_key();
        let day = |y| NaiveDate::from_ymd_opt(y, 1, 1).unwrap();
        let first = AgentRecord::issue("acn", &key, "aa", day(2024), day(2030));
        let second = AgentRecord::issue("acn", &key, "aa", day(2024), day(2040));
        {
            let (store, _) = RecordStore::open(&path).unwrap();
            store.append(&first).unwrap();
            store.append(&second).unwrap();
        }
        let (_, loaded) = RecordStore::open(&path).unwrap();
        assert_eq!(loaded, vec![second]);
    }

    #[test]
    fn test_truncated_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.bin");
        let a = record("aa");
        {
            let (store, _) = RecordStore::open(&path).unwrap();
            store.append(&a).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0, 0, 1, 0, b'{']).unwrap();
        drop(f);

        let (_, loaded) = RecordStore::open(&path).unwrap();
        assert_eq!(loaded, vec![a]);
    }
}
