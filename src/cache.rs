use std::collections::HashMap;
use std::fs::File;

use anyhow::{Context as _, Result};
use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::archive::{Archive, ArchiveKind, CACHE_DB_NAME};
use crate::hashes::Hashes;
use crate::models::{DetectorView, FileSize};

/// Cached knowledge about one file, keyed by its (size, mtime) pair; the
/// entry is stale the moment either changes.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CacheEntry {
    pub size: u64,
    pub mtime: i64,
    pub hashes: Hashes,
    pub detector_view: Option<DetectorView>,
}

/// Per-directory hash cache stored beside unpacked archives, so repeat
/// passes over an unchanged tree avoid rehashing.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ArchiveCache {
    entries: HashMap<String, CacheEntry>,
}

impl ArchiveCache {
    fn path_for(dir: &Utf8Path) -> camino::Utf8PathBuf {
        dir.join(CACHE_DB_NAME)
    }

    /// Load the cache sitting beside `dir`; a missing or unreadable cache
    /// is simply empty.
    pub fn load(dir: &Utf8Path) -> ArchiveCache {
        let path = Self::path_for(dir);
        let Ok(mut file) = File::open(&path) else {
            return ArchiveCache::default();
        };
        bincode::serde::decode_from_std_read(&mut file, bincode::config::standard())
            .unwrap_or_default()
    }

    pub fn save(&self, dir: &Utf8Path) -> Result<()> {
        let path = Self::path_for(dir);
        let mut file =
            File::create(&path).with_context(|| format!("cannot write cache '{}'", path))?;
        bincode::serde::encode_into_std_write(self, &mut file, bincode::config::standard())?;
        Ok(())
    }

    /// Copy cached hashes onto archive entries whose (size, mtime) still
    /// match the filesystem.
    pub fn hydrate(&self, archive: &mut Archive) {
        if archive.kind != ArchiveKind::Dir {
            return;
        }
        for file in &mut archive.files {
            let Some(entry) = self.entries.get(&file.name) else {
                continue;
            };
            if file.size != FileSize::Known(entry.size) || file.mtime != Some(entry.mtime) {
                continue;
            }
            file.hashes.merge(&entry.hashes);
            if file.detector_view.is_none() {
                file.detector_view = entry.detector_view.clone();
            }
        }
    }

    /// Record the archive's current entries; returns true when anything
    /// in the cache changed.
    pub fn absorb(&mut self, archive: &Archive) -> bool {
        let mut changed = false;
        for file in &archive.files {
            let (FileSize::Known(size), Some(mtime)) = (file.size, file.mtime) else {
                continue;
            };
            if file.hashes.is_empty() {
                continue;
            }
            let entry = CacheEntry {
                size,
                mtime,
                hashes: file.hashes.clone(),
                detector_view: file.detector_view.clone(),
            };
            let stale = match self.entries.get(&file.name) {
                Some(existing) => {
                    existing.size != entry.size
                        || existing.mtime != entry.mtime
                        || existing.hashes != entry.hashes
                        || existing.detector_view != entry.detector_view
                }
                None => true,
            };
            if stale {
                self.entries.insert(file.name.clone(), entry);
                changed = true;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::OpenFlags;
    use crate::hashes::HashTypes;
    use crate::models::{FileType, Location};
    use camino::Utf8PathBuf;

    fn dir_archive(root: &Utf8Path) -> Archive {
        Archive::open(
            root,
            ArchiveKind::Dir,
            FileType::Rom,
            Location::InGame,
            OpenFlags::writable(),
        )
        .unwrap()
    }

    #[test]
    fn cache_round_trips_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("game")).unwrap();
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("rom.bin"), b"abcd").unwrap();

        let mut archive = dir_archive(&root);
        archive
            .file_compute_hashes(0, HashTypes::ALL, None)
            .unwrap();

        let mut cache = ArchiveCache::load(&root);
        assert!(cache.absorb(&archive));
        cache.save(&root).unwrap();

        // a fresh open has no hashes beyond size; the cache fills them in
        let mut fresh = dir_archive(&root);
        assert!(fresh.files[0].hashes.is_empty());
        let cache = ArchiveCache::load(&root);
        cache.hydrate(&mut fresh);
        assert_eq!(fresh.files[0].hashes, archive.files[0].hashes);
    }

    #[test]
    fn stale_mtime_invalidates_entry() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("game")).unwrap();
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("rom.bin"), b"abcd").unwrap();

        let mut archive = dir_archive(&root);
        archive
            .file_compute_hashes(0, HashTypes::ALL, None)
            .unwrap();
        let mut cache = ArchiveCache::load(&root);
        cache.absorb(&archive);

        let mut fresh = dir_archive(&root);
        fresh.files[0].mtime = Some(fresh.files[0].mtime.unwrap_or(0) + 100);
        cache.hydrate(&mut fresh);
        assert!(fresh.files[0].hashes.is_empty());
    }

    #[test]
    fn cache_file_is_not_an_archive_entry() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().join("game")).unwrap();
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("rom.bin"), b"abcd").unwrap();

        let mut archive = dir_archive(&root);
        archive
            .file_compute_hashes(0, HashTypes::ALL, None)
            .unwrap();
        let mut cache = ArchiveCache::load(&root);
        cache.absorb(&archive);
        cache.save(&root).unwrap();

        let fresh = dir_archive(&root);
        assert_eq!(fresh.num_files(), 1);
        assert_eq!(fresh.files[0].name, "rom.bin");
    }
}
