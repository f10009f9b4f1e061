use anyhow::Result;
use camino::Utf8PathBuf;

use crate::archive::{Archive, OpenFlags};
use crate::catalog::Catalog;
use crate::chd;
use crate::detector::Detector;
use crate::hashes::HashCompare;
use crate::memdb::MemDb;
use crate::models::{FileDesc, FileSize, FileType, Location, Status};
use crate::settings::Settings;

/// How well an actual file satisfies an expected one, worst to best.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Quality {
    #[default]
    Missing,
    HashErr,
    NoHash,
    Long,
    InZip,
    Copied,
    NameErr,
    Ok,
    Old,
}

/// Where the matched content was found.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MatchSource {
    #[default]
    None,
    /// Entry of one of the game's open archives [own, parent, grandparent].
    Slot { slot: usize, index: usize },
    /// Entry of some other archive, reopened by path when needed.
    Foreign {
        path: Utf8PathBuf,
        location: Location,
        index: usize,
    },
    /// Listed by the old catalog.
    Old { game: String, file: String },
}

/// Pairing of one expected rom with whatever was found for it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Match {
    pub quality: Quality,
    pub location: Location,
    pub source: MatchSource,
    /// Offset of the correct bytes inside a long entry.
    pub offset: Option<u64>,
}

/// Which pairing test to run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatchTest {
    NameSizeChecksum,
    MergeNameSizeChecksum,
    SizeChecksum,
    Long,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TestResult {
    NotFound,
    /// Something was there but its content is wrong.
    Unusable,
    Usable,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FindResult {
    Unknown,
    /// The catalog knows the content but no usable copy exists on disk.
    Missing,
    Exists,
}

fn sizes_agree(expected: &FileDesc, actual: &FileDesc) -> bool {
    match (expected.size.known(), actual.size.known()) {
        (Some(expected_size), Some(actual_size)) => expected_size == actual_size,
        _ => true,
    }
}

fn hashes_agree(expected: &FileDesc, actual: &FileDesc) -> bool {
    if expected.status == Status::NoDump || expected.hashes.is_empty() {
        // nodumps and hashless entries match by name alone
        return true;
    }
    if expected.hashes.compare(&actual.hashes) == HashCompare::Match {
        return true;
    }
    if let Some(view) = &actual.detector_view {
        if expected.size.known() == Some(view.size)
            && expected.hashes.compare(&view.hashes) == HashCompare::Match
        {
            return true;
        }
    }
    false
}

/// Detector views change what a name match means, so give the entry its
/// view before giving up on its hashes.
fn ensure_detector_view(
    archive: &mut Archive,
    index: usize,
    detector: Option<&Detector>,
) -> Result<()> {
    if detector.is_some() && archive.files[index].detector_view.is_none() {
        archive.file_compute_hashes(index, crate::hashes::HashTypes::ALL, detector)?;
    }
    Ok(())
}

/// Try to pair `rom` against the entries of `archive` using one test.
/// `slot` records which of the game's archives this is.
pub fn match_files(
    archive: &mut Archive,
    test: MatchTest,
    rom: &FileDesc,
    detector: Option<&Detector>,
    slot: usize,
    found: &mut Match,
) -> Result<TestResult> {
    found.offset = None;
    let mut result = TestResult::NotFound;

    for index in 0..archive.files.len() {
        if result == TestResult::Usable {
            break;
        }
        if archive.files[index].status != Status::Ok {
            continue;
        }

        match test {
            MatchTest::NameSizeChecksum | MatchTest::MergeNameSizeChecksum => {
                let wanted = if test == MatchTest::NameSizeChecksum {
                    &rom.name
                } else {
                    rom.merged_name()
                };
                if archive.files[index].name != *wanted {
                    continue;
                }
                if !sizes_agree(rom, &archive.files[index]) {
                    // a dump with a variant header has a different raw
                    // size; its detector view may still line up
                    ensure_detector_view(archive, index, detector)?;
                    let view_size_fits = archive.files[index]
                        .detector_view
                        .as_ref()
                        .is_some_and(|view| rom.size.known() == Some(view.size));
                    if !view_size_fits {
                        continue;
                    }
                }

                if !hashes_agree(rom, &archive.files[index]) {
                    ensure_detector_view(archive, index, detector)?;
                }
                if hashes_agree(rom, &archive.files[index]) {
                    found.quality = Quality::Ok;
                    result = TestResult::Usable;
                } else {
                    if found.quality == Quality::HashErr {
                        continue;
                    }
                    found.quality = Quality::HashErr;
                    result = TestResult::Unusable;
                }
                found.source = MatchSource::Slot { slot, index };
            }
            MatchTest::SizeChecksum => {
                // roms without hashes are only matched by their correct name
                if rom.hashes.is_empty() || rom.status == Status::NoDump {
                    break;
                }
                if !sizes_agree(rom, &archive.files[index]) || !rom.size.is_known() {
                    continue;
                }

                match archive.file_compare_hashes(index, &rom.hashes)? {
                    HashCompare::Match => {
                        found.quality = Quality::NameErr;
                        found.source = MatchSource::Slot { slot, index };
                        result = TestResult::Usable;
                    }
                    HashCompare::Mismatch => {
                        if archive.files[index].status != Status::Ok
                            || found.quality == Quality::HashErr
                        {
                            continue;
                        }
                        found.quality = Quality::HashErr;
                        found.source = MatchSource::Slot { slot, index };
                        result = TestResult::Unusable;
                    }
                    HashCompare::NoCommon => {}
                }
            }
            MatchTest::Long => {
                if rom.hashes.is_empty() || rom.status == Status::NoDump {
                    break;
                }
                let Some(expected_size) = rom.size.known() else {
                    break;
                };
                if expected_size == 0 {
                    break;
                }
                if archive.files[index].name != rom.name {
                    continue;
                }
                let FileSize::Known(actual_size) = archive.files[index].size else {
                    continue;
                };
                if actual_size <= expected_size {
                    continue;
                }
                if let Some(offset) =
                    archive.file_find_offset(index, expected_size, &rom.hashes)?
                {
                    found.offset = Some(offset);
                    found.quality = Quality::Long;
                    found.source = MatchSource::Slot { slot, index };
                    return Ok(TestResult::Usable);
                }
            }
        }
    }

    Ok(result)
}

/// Search other games of the ROM set for this content, skipping the game
/// currently being checked.
pub fn find_in_romset(
    catalog: &Catalog,
    settings: &Settings,
    filetype: FileType,
    rom: &FileDesc,
    skip_game: &str,
    found: &mut Match,
) -> Result<FindResult> {
    let locations = catalog.read_file_by_hash(filetype, &rom.hashes)?;
    if locations.is_empty() {
        return Ok(FindResult::Unknown);
    }

    let mut status = FindResult::Unknown;
    for location in locations {
        if location.game == skip_game {
            continue;
        }
        let Some(game) = catalog.read_game(&location.game)? else {
            continue;
        };
        let Some(catalog_rom) = game.files(filetype).get(location.index) else {
            continue;
        };
        if rom.hashes.compare(&catalog_rom.hashes) != HashCompare::Match {
            continue;
        }
        status = FindResult::Missing;

        let path = settings.game_archive_path(&game.name);
        let Ok(mut archive) = Archive::open(
            &path,
            settings.archive_kind(),
            filetype,
            Location::RomSet,
            OpenFlags::readonly(),
        ) else {
            continue;
        };
        let Some(index) = archive.name_index(&catalog_rom.name) else {
            continue;
        };
        if archive.file_compare_hashes(index, &rom.hashes)? == HashCompare::Match {
            found.quality = Quality::Copied;
            found.location = Location::RomSet;
            found.source = MatchSource::Foreign {
                path,
                location: Location::RomSet,
                index,
            };
            return Ok(FindResult::Exists);
        }
    }

    Ok(status)
}

/// Search the memory index (needed, superfluous, extra partitions) for
/// this content and verify the candidate against the live archive.
pub fn find_in_archives(
    memdb: &MemDb,
    filetype: FileType,
    rom: &FileDesc,
    found: &mut Match,
) -> Result<FindResult> {
    let candidates = memdb.lookup(filetype, &rom.hashes)?;

    for candidate in candidates {
        if candidate.location == Location::RomSet {
            // the romset partition is searched through the catalog instead
            continue;
        }
        let path = Utf8PathBuf::from(&candidate.archive_name);
        let Ok(mut archive) = Archive::open(
            &path,
            Settings::kind_of(&path),
            filetype,
            candidate.location,
            OpenFlags::readonly(),
        ) else {
            continue;
        };
        if candidate.index >= archive.num_files() {
            continue;
        }
        match archive.file_compare_hashes(candidate.index, &rom.hashes)? {
            HashCompare::Match => {
                found.quality = Quality::Copied;
                found.location = candidate.location;
                found.source = MatchSource::Foreign {
                    path,
                    location: candidate.location,
                    index: candidate.index,
                };
                return Ok(FindResult::Exists);
            }
            _ => continue,
        }
    }

    Ok(FindResult::Unknown)
}

/// Check the old catalog for this content; matches rank `Old` and are
/// never copied from.
pub fn find_in_old(
    old_catalog: Option<&Catalog>,
    filetype: FileType,
    rom: &FileDesc,
    found: &mut Match,
) -> Result<FindResult> {
    let Some(old) = old_catalog else {
        return Ok(FindResult::Missing);
    };
    if rom.hashes.is_empty() {
        return Ok(FindResult::Missing);
    }

    let locations = old.read_file_by_hash(filetype, &rom.hashes)?;
    for location in locations {
        let Some(game) = old.read_game(&location.game)? else {
            continue;
        };
        let Some(old_rom) = game.files(filetype).get(location.index) else {
            continue;
        };
        if rom.hashes.compare(&old_rom.hashes) == HashCompare::Match {
            found.quality = Quality::Old;
            found.location = Location::Old;
            found.source = MatchSource::Old {
                game: game.name.clone(),
                file: old_rom.name.clone(),
            };
            return Ok(FindResult::Exists);
        }
    }

    Ok(FindResult::Missing)
}

/// Search the memory index's disk partitions for a matching disk image.
pub fn find_disk(memdb: &MemDb, disk: &FileDesc, found: &mut Match) -> Result<FindResult> {
    let candidates = memdb.lookup(FileType::Disk, &disk.hashes)?;

    for candidate in candidates {
        let path = Utf8PathBuf::from(&candidate.archive_name);
        let Ok(hashes) = chd::disk_hashes(&path, false) else {
            continue;
        };
        if disk.hashes.compare(&hashes) == HashCompare::Match {
            found.quality = Quality::Copied;
            found.location = candidate.location;
            found.source = MatchSource::Foreign {
                path,
                location: candidate.location,
                index: 0,
            };
            return Ok(FindResult::Exists);
        }
    }

    Ok(FindResult::Unknown)
}

/// Search other games' disk lists and their on-disk images.
pub fn find_disk_in_romset(
    catalog: &Catalog,
    settings: &Settings,
    disk: &FileDesc,
    skip_game: &str,
    found: &mut Match,
) -> Result<FindResult> {
    let locations = catalog.read_file_by_hash(FileType::Disk, &disk.hashes)?;

    let mut status = FindResult::Unknown;
    for location in locations {
        if location.game == skip_game {
            continue;
        }
        let Some(game) = catalog.read_game(&location.game)? else {
            continue;
        };
        let Some(catalog_disk) = game.disks.get(location.index) else {
            continue;
        };
        if disk.hashes.compare(&catalog_disk.hashes) != HashCompare::Match {
            continue;
        }
        status = FindResult::Missing;

        for path in [
            settings
                .rom_dir
                .join(&game.name)
                .join(format!("{}.chd", catalog_disk.name)),
            settings.rom_dir.join(format!("{}.chd", catalog_disk.name)),
        ] {
            let Ok(hashes) = chd::disk_hashes(&path, false) else {
                continue;
            };
            if disk.hashes.compare(&hashes) == HashCompare::Match {
                found.quality = Quality::Copied;
                found.location = Location::RomSet;
                found.source = MatchSource::Foreign {
                    path,
                    location: Location::RomSet,
                    index: 0,
                };
                return Ok(FindResult::Exists);
            }
        }
    }

    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveKind;
    use crate::hashes::{hash_bytes, HashTypes, Hashes};
    use std::io::Write as _;

    fn zip_with(dir: &std::path::Path, name: &str, entries: &[(&str, &[u8])]) -> Archive {
        let path = Utf8PathBuf::from_path_buf(dir.join(name)).unwrap();
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (entry_name, data) in entries {
            writer
                .start_file(*entry_name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
        Archive::open(
            &path,
            ArchiveKind::Zip,
            FileType::Rom,
            Location::InGame,
            OpenFlags::writable(),
        )
        .unwrap()
    }

    fn expected_rom(name: &str, data: &[u8]) -> FileDesc {
        FileDesc {
            name: name.to_owned(),
            size: FileSize::Known(data.len() as u64),
            hashes: hash_bytes(data, HashTypes::single(crate::hashes::HashType::Crc)),
            ..FileDesc::default()
        }
    }

    #[test]
    fn name_size_checksum_finds_exact_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = zip_with(dir.path(), "game.zip", &[("rom.bin", b"abcd")]);
        let rom = expected_rom("rom.bin", b"abcd");

        let mut found = Match::default();
        let result = match_files(
            &mut archive,
            MatchTest::NameSizeChecksum,
            &rom,
            None,
            0,
            &mut found,
        )
        .unwrap();
        assert_eq!(result, TestResult::Usable);
        assert_eq!(found.quality, Quality::Ok);
        assert_eq!(found.source, MatchSource::Slot { slot: 0, index: 0 });
    }

    #[test]
    fn matcher_soundness_ok_implies_hashes_agree() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = zip_with(dir.path(), "game.zip", &[("rom.bin", b"abcd")]);
        let rom = expected_rom("rom.bin", b"abcd");

        let mut found = Match::default();
        match_files(
            &mut archive,
            MatchTest::NameSizeChecksum,
            &rom,
            None,
            0,
            &mut found,
        )
        .unwrap();
        assert_eq!(found.quality, Quality::Ok);
        let MatchSource::Slot { index, .. } = found.source else {
            panic!("expected archive source");
        };
        assert_eq!(
            rom.hashes.compare(&archive.files[index].hashes),
            HashCompare::Match
        );
    }

    #[test]
    fn wrong_content_same_name_is_hasherr() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = zip_with(dir.path(), "game.zip", &[("rom.bin", b"dcba")]);
        let rom = expected_rom("rom.bin", b"abcd");

        let mut found = Match::default();
        let result = match_files(
            &mut archive,
            MatchTest::NameSizeChecksum,
            &rom,
            None,
            0,
            &mut found,
        )
        .unwrap();
        assert_eq!(result, TestResult::Unusable);
        assert_eq!(found.quality, Quality::HashErr);
    }

    #[test]
    fn size_checksum_finds_misnamed_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = zip_with(dir.path(), "game.zip", &[("wrong.bin", b"abcd")]);
        let rom = expected_rom("rom.bin", b"abcd");

        let mut found = Match::default();
        let result = match_files(
            &mut archive,
            MatchTest::SizeChecksum,
            &rom,
            None,
            0,
            &mut found,
        )
        .unwrap();
        assert_eq!(result, TestResult::Usable);
        assert_eq!(found.quality, Quality::NameErr);
    }

    #[test]
    fn long_test_records_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = zip_with(dir.path(), "game.zip", &[("rom.bin", b"XXXXabcd")]);
        let rom = expected_rom("rom.bin", b"abcd");

        let mut found = Match::default();
        let result = match_files(&mut archive, MatchTest::Long, &rom, None, 0, &mut found).unwrap();
        assert_eq!(result, TestResult::Usable);
        assert_eq!(found.quality, Quality::Long);
        assert_eq!(found.offset, Some(4));
    }

    #[test]
    fn merge_name_test_uses_parent_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = zip_with(dir.path(), "parent.zip", &[("shared.bin", b"abcd")]);
        let mut rom = expected_rom("child-shared.bin", b"abcd");
        rom.merge = Some("shared.bin".to_owned());
        rom.location = Location::InParent;

        let mut found = Match::default();
        let result = match_files(
            &mut archive,
            MatchTest::MergeNameSizeChecksum,
            &rom,
            None,
            1,
            &mut found,
        )
        .unwrap();
        assert_eq!(result, TestResult::Usable);
        assert_eq!(found.quality, Quality::Ok);
        assert_eq!(found.source, MatchSource::Slot { slot: 1, index: 0 });
    }

    #[test]
    fn nodump_matches_by_name_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = zip_with(dir.path(), "game.zip", &[("rom.bin", b"anything")]);
        let mut rom = FileDesc {
            name: "rom.bin".to_owned(),
            size: FileSize::Unknown,
            hashes: Hashes::default(),
            status: Status::NoDump,
            ..FileDesc::default()
        };

        let mut found = Match::default();
        let result = match_files(
            &mut archive,
            MatchTest::NameSizeChecksum,
            &rom,
            None,
            0,
            &mut found,
        )
        .unwrap();
        assert_eq!(result, TestResult::Usable);
        assert_eq!(found.quality, Quality::Ok);

        // but never by content
        rom.name = "other.bin".to_owned();
        let mut found = Match::default();
        let result = match_files(
            &mut archive,
            MatchTest::SizeChecksum,
            &rom,
            None,
            0,
            &mut found,
        )
        .unwrap();
        assert_eq!(result, TestResult::NotFound);
    }
}
