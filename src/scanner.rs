use std::collections::HashSet;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::archive::{Archive, ArchiveKind, OpenFlags, CACHE_DB_NAME};
use crate::cache::ArchiveCache;
use crate::catalog::{Catalog, ListKind};
use crate::chd;
use crate::detector::Detector;
use crate::hashes::HashTypes;
use crate::memdb::MemDb;
use crate::models::{FileDesc, FileSize, FileType, Location};
use crate::settings::Settings;

/// Lazily-built memory index over the ROM tree, the needed quarantine and
/// the extra search directories, plus the superfluous listing.
pub struct DirMaps {
    pub memdb: MemDb,
    romset_built: bool,
    needed_built: bool,
    extra_built: bool,
    /// Archives in the ROM tree no game references, sorted.
    pub superfluous: Vec<Utf8PathBuf>,
}

fn utf8_entries(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut entries = Vec::new();
    if !dir.exists() {
        return Ok(entries);
    }
    for entry in dir.read_dir_utf8()? {
        entries.push(entry?.path().to_owned());
    }
    entries.sort();
    Ok(entries)
}

impl DirMaps {
    pub fn new() -> Result<Self> {
        Ok(DirMaps {
            memdb: MemDb::new()?,
            romset_built: false,
            needed_built: false,
            extra_built: false,
            superfluous: Vec::new(),
        })
    }

    /// Enter one archive into the index under the given partition.
    pub fn enter_archive(
        &self,
        path: &Utf8Path,
        kind: ArchiveKind,
        location: Location,
        detector: Option<&Detector>,
    ) -> Result<()> {
        let mut archive = Archive::open(
            path,
            kind,
            FileType::Rom,
            location,
            OpenFlags::readonly(),
        )?;
        archive.id = self.memdb.register_archive(path.as_str())?;
        self.memdb.delete_archive(archive.id, FileType::Rom)?;

        if kind == ArchiveKind::Dir {
            // unpacked entries carry no checksums; hash through the cache
            let mut cache = ArchiveCache::load(path);
            cache.hydrate(&mut archive);
            for index in 0..archive.num_files() {
                archive.file_compute_hashes(index, HashTypes::ALL, detector)?;
            }
            if cache.absorb(&archive) {
                let _ = cache.save(path);
            }
        }

        self.memdb.insert_archive(&archive)?;
        Ok(())
    }

    /// Enter one CHD image as a single-entry disk archive.
    pub fn enter_disk(&self, path: &Utf8Path, location: Location) -> Result<()> {
        let Ok(hashes) = chd::disk_hashes(path, false) else {
            return Ok(());
        };
        let id = self.memdb.register_archive(path.as_str())?;
        self.memdb.delete_archive(id, FileType::Disk)?;

        let name = path.file_stem().unwrap_or(path.as_str()).to_owned();
        let mut archive = Archive::for_entries(
            path,
            ArchiveKind::Dir,
            FileType::Disk,
            location,
            vec![FileDesc {
                name,
                size: FileSize::Unknown,
                hashes,
                location,
                ..FileDesc::default()
            }],
        );
        archive.id = id;
        self.memdb.insert_archive(&archive)?;
        Ok(())
    }

    /// Scan one directory level: ZIPs (or subdirectories in unpacked
    /// mode) become archives, CHDs become disks. With `known` set,
    /// anything the catalog does not account for lands in the
    /// superfluous list.
    fn scan_dir(
        &mut self,
        dir: &Utf8Path,
        location: Location,
        settings: &Settings,
        detector: Option<&Detector>,
        known: Option<&KnownNames>,
    ) -> Result<()> {
        for path in utf8_entries(dir)? {
            let Some(name) = path.file_name() else {
                continue;
            };
            if name == CACHE_DB_NAME || name.starts_with('.') {
                continue;
            }

            if path.is_dir() {
                if settings.roms_unzipped {
                    let (location, superfluous) = match known {
                        Some(known) if !known.games.contains(name) => {
                            (Location::Superfluous, true)
                        }
                        _ => (location, false),
                    };
                    if superfluous {
                        self.superfluous.push(path.clone());
                    }
                    self.enter_archive(&path, ArchiveKind::Dir, location, detector)?;
                }
                continue;
            }

            match path.extension() {
                Some("zip") if !settings.roms_unzipped => {
                    let stem = path.file_stem().unwrap_or_default();
                    let (location, superfluous) = match known {
                        Some(known) if !known.games.contains(stem) => {
                            (Location::Superfluous, true)
                        }
                        _ => (location, false),
                    };
                    if superfluous {
                        self.superfluous.push(path.clone());
                    }
                    self.enter_archive(&path, ArchiveKind::Zip, location, detector)?;
                }
                Some("chd") => {
                    let stem = path.file_stem().unwrap_or_default();
                    let (location, superfluous) = match known {
                        Some(known) if !known.disks.contains(stem) => {
                            (Location::Superfluous, true)
                        }
                        _ => (location, false),
                    };
                    if superfluous {
                        self.superfluous.push(path.clone());
                    }
                    self.enter_disk(&path, location)?;
                }
                _ => {
                    if known.is_some() {
                        self.superfluous.push(path.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Index the ROM tree, marking archives the catalog does not know as
    /// superfluous.
    pub fn ensure_romset(
        &mut self,
        settings: &Settings,
        catalog: &Catalog,
        detector: Option<&Detector>,
    ) -> Result<()> {
        if self.romset_built {
            return Ok(());
        }
        self.romset_built = true;

        let known = KnownNames::load(catalog)?;
        let rom_dir = settings.rom_dir.clone();
        self.scan_dir(&rom_dir, Location::RomSet, settings, detector, Some(&known))?;
        self.superfluous.sort();
        self.superfluous.dedup();
        Ok(())
    }

    pub fn ensure_needed(&mut self, settings: &Settings, detector: Option<&Detector>) -> Result<()> {
        if self.needed_built {
            return Ok(());
        }
        self.needed_built = true;
        let needed_dir = settings.needed_dir.clone();
        self.scan_needed_dir(&needed_dir, settings, detector)
    }

    fn scan_needed_dir(
        &mut self,
        dir: &Utf8Path,
        settings: &Settings,
        detector: Option<&Detector>,
    ) -> Result<()> {
        for path in utf8_entries(dir)? {
            if path.is_dir() {
                if settings.roms_unzipped {
                    self.enter_archive(&path, ArchiveKind::Dir, Location::Needed, detector)?;
                }
                continue;
            }
            match path.extension() {
                Some("zip") => {
                    self.enter_archive(&path, ArchiveKind::Zip, Location::Needed, detector)?
                }
                Some("chd") => self.enter_disk(&path, Location::Needed)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Index the extra search directories, recursively.
    pub fn ensure_extra(&mut self, settings: &Settings, detector: Option<&Detector>) -> Result<()> {
        if self.extra_built {
            return Ok(());
        }
        self.extra_built = true;

        for dir in settings.search_dirs.clone() {
            self.scan_extra_dir(&dir, settings, detector)?;
        }
        Ok(())
    }

    fn scan_extra_dir(
        &mut self,
        dir: &Utf8Path,
        settings: &Settings,
        detector: Option<&Detector>,
    ) -> Result<()> {
        for path in utf8_entries(dir)? {
            if path.is_dir() {
                if settings.roms_unzipped {
                    self.enter_archive(&path, ArchiveKind::Dir, Location::Extra, detector)?;
                } else {
                    self.scan_extra_dir(&path, settings, detector)?;
                }
                continue;
            }
            match path.extension() {
                Some("zip") => {
                    self.enter_archive(&path, ArchiveKind::Zip, Location::Extra, detector)?
                }
                Some("chd") => self.enter_disk(&path, Location::Extra)?,
                _ => {}
            }
        }
        Ok(())
    }
}

/// Basenames the catalog accounts for in the ROM tree.
struct KnownNames {
    games: HashSet<String>,
    disks: HashSet<String>,
}

impl KnownNames {
    fn load(catalog: &Catalog) -> Result<Self> {
        Ok(KnownNames {
            games: catalog.read_list(ListKind::Games)?.into_iter().collect(),
            disks: catalog.read_list(ListKind::Disks)?.into_iter().collect(),
        })
    }
}

/// Sorted, deduplicated list of files in the ROM tree no game references.
pub fn list_superfluous(
    settings: &Settings,
    catalog: &Catalog,
) -> Result<Vec<Utf8PathBuf>> {
    let known = KnownNames::load(catalog)?;
    let mut superfluous = Vec::new();

    for path in utf8_entries(&settings.rom_dir)? {
        let Some(name) = path.file_name() else {
            continue;
        };
        if name == CACHE_DB_NAME || name.starts_with('.') {
            continue;
        }

        let known_name = if path.is_dir() {
            settings.roms_unzipped && known.games.contains(name)
        } else {
            match path.extension() {
                Some("zip") if !settings.roms_unzipped => known
                    .games
                    .contains(path.file_stem().unwrap_or_default()),
                Some("chd") => known.disks.contains(path.file_stem().unwrap_or_default()),
                _ => false,
            }
        };

        if !known_name {
            superfluous.push(path);
        }
    }

    superfluous.sort();
    superfluous.dedup();
    Ok(superfluous)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::OpenMode;
    use crate::hashes::hash_bytes;
    use crate::models::Game;
    use std::io::Write as _;

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
    }

    fn write_zip(path: &Utf8Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, data) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    fn catalog_with_game(dir: &Utf8Path, name: &str) -> Catalog {
        let catalog = Catalog::open(&dir.join("mame.db"), OpenMode::New).unwrap();
        let mut game = Game {
            name: name.to_owned(),
            roms: vec![FileDesc {
                name: "rom.bin".to_owned(),
                size: FileSize::Known(4),
                hashes: hash_bytes(b"abcd", HashTypes::ALL),
                ..FileDesc::default()
            }],
            ..Game::default()
        };
        catalog.write_game(&mut game).unwrap();
        catalog
    }

    #[test]
    fn romset_scan_classifies_known_and_superfluous() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let rom_dir = root.join("roms");
        std::fs::create_dir(&rom_dir).unwrap();
        write_zip(&rom_dir.join("pacman.zip"), &[("rom.bin", b"abcd")]);
        write_zip(&rom_dir.join("stray.zip"), &[("junk.bin", b"junk")]);

        let catalog = catalog_with_game(&root, "pacman");
        let settings = Settings {
            rom_dir: rom_dir.clone(),
            ..Settings::default()
        };

        let mut maps = DirMaps::new().unwrap();
        maps.ensure_romset(&settings, &catalog, None).unwrap();

        assert_eq!(maps.superfluous, vec![rom_dir.join("stray.zip")]);

        // both archives are in the index, in their partitions
        let known = hash_bytes(b"abcd", HashTypes::ALL);
        let found = maps.memdb.lookup(FileType::Rom, &known).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].location, Location::RomSet);

        let junk = hash_bytes(b"junk", HashTypes::ALL);
        let found = maps.memdb.lookup(FileType::Rom, &junk).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].location, Location::Superfluous);
    }

    #[test]
    fn superfluous_listing_is_sorted_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let rom_dir = root.join("roms");
        std::fs::create_dir(&rom_dir).unwrap();
        write_zip(&rom_dir.join("zz.zip"), &[("a", b"a")]);
        write_zip(&rom_dir.join("aa.zip"), &[("a", b"a")]);
        std::fs::write(rom_dir.join("notes.txt"), b"hello").unwrap();

        let catalog = catalog_with_game(&root, "pacman");
        let settings = Settings {
            rom_dir: rom_dir.clone(),
            ..Settings::default()
        };

        let first = list_superfluous(&settings, &catalog).unwrap();
        assert_eq!(
            first,
            vec![
                rom_dir.join("aa.zip"),
                rom_dir.join("notes.txt"),
                rom_dir.join("zz.zip"),
            ]
        );
        let second = list_superfluous(&settings, &catalog).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn extra_dirs_enter_extra_partition() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let extra = root.join("extra");
        std::fs::create_dir_all(extra.join("nested")).unwrap();
        write_zip(&extra.join("nested/spare.zip"), &[("x.bin", b"wxyz")]);

        let settings = Settings {
            search_dirs: vec![extra],
            ..Settings::default()
        };

        let mut maps = DirMaps::new().unwrap();
        maps.ensure_extra(&settings, None).unwrap();

        let hashes = hash_bytes(b"wxyz", HashTypes::ALL);
        let found = maps.memdb.lookup(FileType::Rom, &hashes).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].location, Location::Extra);
    }
}
