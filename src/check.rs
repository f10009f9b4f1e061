use anyhow::Result;
use camino::Utf8PathBuf;

use crate::archive::Archive;
use crate::catalog::Catalog;
use crate::chd;
use crate::detector::Detector;
use crate::hashes::{HashCompare, HashTypes};
use crate::matcher::{
    find_disk, find_disk_in_romset, find_in_archives, find_in_old, find_in_romset, match_files,
    FindResult, Match, MatchSource, MatchTest, Quality, TestResult,
};
use crate::models::{FileSize, FileType, Game, Location, Status};
use crate::scanner::DirMaps;
use crate::settings::Settings;

/// Overall rank of one game after checking.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum GameStatus {
    #[default]
    Missing,
    Partial,
    Fixable,
    Correct,
    Old,
}

/// Classification of one actual entry in the game's own archive.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FileStatus {
    #[default]
    Unknown,
    Used,
    PartUsed,
    Broken,
    /// Content a different game is still missing.
    Needed,
    /// Content a different game already has.
    Superfluous,
    /// Content the old catalog accounts for.
    Duplicate,
}

/// A located disk image: resolved path plus classification.
#[derive(Clone, Debug, Default)]
pub struct DiskImage {
    pub path: Utf8PathBuf,
    pub status: FileStatus,
}

/// Everything check found out about one game.
#[derive(Clone, Debug, Default)]
pub struct GameResult {
    pub game: GameStatus,
    pub roms: Vec<Match>,
    pub files: Vec<FileStatus>,
    /// Entry names parallel to `files`, kept for reporting.
    pub file_names: Vec<String>,
    pub disks: Vec<Match>,
    pub images: Vec<DiskImage>,
}

impl GameResult {
    pub fn new(game: &Game, own: Option<&Archive>) -> Self {
        GameResult {
            game: GameStatus::Missing,
            roms: vec![Match::default(); game.roms.len()],
            files: vec![FileStatus::Unknown; own.map_or(0, Archive::num_files)],
            file_names: own.map_or_else(Vec::new, |own| {
                own.files.iter().map(|file| file.name.clone()).collect()
            }),
            disks: vec![Match::default(); game.disks.len()],
            images: Vec::new(),
        }
    }
}

/// Borrowed run state handed through the check and fix engines.
pub struct CheckContext<'a> {
    pub catalog: &'a Catalog,
    pub old_catalog: Option<&'a Catalog>,
    pub settings: &'a Settings,
    pub detector: Option<&'a Detector>,
    pub maps: &'a mut DirMaps,
}

/// Seed matches from the old catalog; content it accounts for needs no
/// further searching and is never copied.
pub fn check_old(game: &Game, ctx: &mut CheckContext, result: &mut GameResult) -> Result<()> {
    if ctx.old_catalog.is_none() {
        return Ok(());
    }

    for (index, rom) in game.roms.iter().enumerate() {
        let found = &mut result.roms[index];
        if find_in_old(ctx.old_catalog, FileType::Rom, rom, found)? == FindResult::Exists {
            found.location = Location::Old;
        }
    }
    for (index, disk) in game.disks.iter().enumerate() {
        let found = &mut result.disks[index];
        if find_in_old(ctx.old_catalog, FileType::Disk, disk, found)? == FindResult::Exists {
            found.location = Location::Old;
        }
    }

    if !game.roms.is_empty() || !game.disks.is_empty() {
        let all_old = result.roms.iter().all(|found| found.quality == Quality::Old)
            && result.disks.iter().all(|found| found.quality == Quality::Old);
        if all_old {
            result.game = GameStatus::Old;
        }
    }

    Ok(())
}

/// Diagnose every expected rom of `game` against its archives and the
/// memory index, then classify the own archive's actual entries.
pub fn check_files(
    game: &Game,
    archives: &mut [Option<Archive>; 3],
    ctx: &mut CheckContext,
    result: &mut GameResult,
) -> Result<()> {
    const OWN_TESTS: [MatchTest; 3] = [
        MatchTest::NameSizeChecksum,
        MatchTest::SizeChecksum,
        MatchTest::Long,
    ];

    if result.game == GameStatus::Old {
        return Ok(());
    }

    if ctx.settings.integrity {
        // rehash everything up front so corrupt entries surface as broken
        if let Some(own) = archives[0].as_mut() {
            for index in 0..own.num_files() {
                own.file_compute_hashes(index, HashTypes::ALL, ctx.detector)?;
            }
        }
    }

    for (index, rom) in game.roms.iter().enumerate() {
        let found = &mut result.roms[index];
        if found.quality == Quality::Old {
            continue;
        }
        found.quality = Quality::Missing;

        // inherited roms are expected in an ancestor's archive
        if let Some(slot) = rom.location.ancestor_slot() {
            if slot > 0 {
                if let Some(ancestor) = archives[slot].as_mut() {
                    let test_result = match_files(
                        ancestor,
                        MatchTest::MergeNameSizeChecksum,
                        rom,
                        ctx.detector,
                        slot,
                        found,
                    )?;
                    if test_result != TestResult::NotFound {
                        found.location = rom.location;
                        if test_result == TestResult::Usable {
                            continue;
                        }
                    }
                }
            }
        }

        if let Some(own) = archives[0].as_mut() {
            for test in OWN_TESTS {
                let test_result = match_files(own, test, rom, ctx.detector, 0, found)?;
                if test_result != TestResult::NotFound {
                    found.location = Location::InGame;
                    if rom.location != Location::InGame && found.quality == Quality::Ok {
                        found.quality = Quality::InZip;
                    }
                    if test_result == TestResult::Usable {
                        break;
                    }
                }
            }
        }

        if rom.location == Location::InGame
            && matches!(found.quality, Quality::Missing | Quality::HashErr)
            && rom.size.known().unwrap_or(0) > 0
            && rom.status != Status::NoDump
        {
            if find_in_romset(
                ctx.catalog,
                ctx.settings,
                FileType::Rom,
                rom,
                &game.name,
                found,
            )? == FindResult::Exists
            {
                continue;
            }

            ctx.maps.ensure_needed(ctx.settings, ctx.detector)?;
            ctx.maps.ensure_extra(ctx.settings, ctx.detector)?;
            if find_in_archives(&ctx.maps.memdb, FileType::Rom, rom, found)? == FindResult::Exists {
                continue;
            }
        }
    }

    classify_archive_files(game, archives, ctx, result)?;
    update_game_status(game, ctx.settings, result);
    Ok(())
}

/// Mark which own-archive entries the matches consume, demote shared
/// sources, and classify what is left over.
fn classify_archive_files(
    game: &Game,
    archives: &mut [Option<Archive>; 3],
    ctx: &mut CheckContext,
    result: &mut GameResult,
) -> Result<()> {
    let Some(own) = archives[0].as_mut() else {
        return Ok(());
    };
    if own.files.is_empty() {
        return Ok(());
    }

    for (index, file) in own.files.iter().enumerate() {
        if file.status != Status::Ok {
            result.files[index] = FileStatus::Broken;
        }
    }

    // first claimant of each entry; later matches of the same entry are
    // demoted to Copied and must be sourced separately
    let mut user: Vec<Option<usize>> = vec![None; own.files.len()];

    for rom_index in 0..game.roms.len() {
        let quality = result.roms[rom_index].quality;
        let location = result.roms[rom_index].location;
        let MatchSource::Slot { slot: 0, index } = result.roms[rom_index].source else {
            continue;
        };
        if location != Location::InGame || quality == Quality::HashErr {
            continue;
        }

        if result.files[index] != FileStatus::Used {
            result.files[index] = if quality == Quality::Long {
                FileStatus::PartUsed
            } else {
                FileStatus::Used
            };
        }

        if quality != Quality::Long && quality != Quality::InZip {
            match user[index] {
                None => user[index] = Some(rom_index),
                Some(previous) => {
                    if quality == Quality::Ok {
                        result.roms[previous].quality = Quality::Copied;
                        user[index] = Some(rom_index);
                    } else {
                        result.roms[rom_index].quality = Quality::Copied;
                    }
                }
            }
        }
    }

    // what remains unknown is stray content: classify against the old
    // catalog and the current one
    for index in 0..own.files.len() {
        if result.files[index] != FileStatus::Unknown {
            continue;
        }

        own.file_compute_hashes(index, HashTypes::ALL, ctx.detector)?;
        let file = own.files[index].clone();
        if file.status != Status::Ok {
            result.files[index] = FileStatus::Broken;
            continue;
        }

        result.files[index] = classify_stray(
            ctx.catalog,
            ctx.old_catalog,
            ctx.settings,
            Some(&game.name),
            &file,
        )?;
    }

    Ok(())
}

/// Classify a stray file: does the old catalog account for it, does a
/// different game still need it, or does that game already have a copy?
pub fn classify_stray(
    catalog: &Catalog,
    old_catalog: Option<&Catalog>,
    settings: &Settings,
    skip_game: Option<&str>,
    file: &crate::models::FileDesc,
) -> Result<FileStatus> {
    if let Some(old) = old_catalog {
        if !old.read_file_by_hash(FileType::Rom, &file.hashes)?.is_empty() {
            return Ok(FileStatus::Duplicate);
        }
    }

    let locations = catalog.read_file_by_hash(FileType::Rom, &file.hashes)?;
    let mut status = FileStatus::Unknown;
    for location in &locations {
        if skip_game == Some(location.game.as_str()) {
            continue;
        }
        let Some(other) = catalog.read_game(&location.game)? else {
            continue;
        };
        let Some(wanted) = other.roms.get(location.index) else {
            continue;
        };
        if wanted.hashes.compare(&file.hashes) != HashCompare::Match {
            continue;
        }

        // needed if that game's own copy is absent, superfluous if it
        // already has one
        let path = settings.game_archive_path(&other.name);
        let present = Archive::open(
            &path,
            settings.archive_kind(),
            FileType::Rom,
            Location::RomSet,
            crate::archive::OpenFlags::readonly(),
        )
        .ok()
        .and_then(|candidate| {
            candidate
                .files
                .iter()
                .find(|entry| entry.name == wanted.name)
                .map(|entry| entry.size == wanted.size)
        })
        .unwrap_or(false);

        status = if present {
            FileStatus::Superfluous
        } else {
            FileStatus::Needed
        };
        if status == FileStatus::Needed {
            break;
        }
    }
    Ok(status)
}

/// Rank the game from its per-rom and per-disk qualities.
fn update_game_status(game: &Game, settings: &Settings, result: &mut GameResult) {
    let mut all_dead = true;
    let mut all_own_dead = true;
    let mut all_correct = true;
    let mut all_fixable = true;
    let mut has_own = false;

    let expectations = game
        .roms
        .iter()
        .zip(result.roms.iter())
        .chain(game.disks.iter().zip(result.disks.iter()));

    for (expected, found) in expectations {
        if expected.location == Location::InGame {
            has_own = true;
        }
        if found.quality == Quality::Missing {
            all_fixable = false;
        } else {
            all_dead = false;
            if expected.location == Location::InGame {
                all_own_dead = false;
            }
        }
        if found.quality != Quality::Ok
            && found.quality != Quality::Old
            && (expected.status != Status::NoDump || settings.report_no_good_dumps)
        {
            all_correct = false;
        }
    }

    result.game = if all_correct {
        GameStatus::Correct
    } else if all_dead || (has_own && all_own_dead) {
        GameStatus::Missing
    } else if all_fixable {
        GameStatus::Fixable
    } else {
        GameStatus::Partial
    };
}

/// Candidate on-disk locations of a disk image, preferred first.
pub fn disk_image_paths(settings: &Settings, game: &str, disk_name: &str) -> [Utf8PathBuf; 2] {
    [
        settings.rom_dir.join(game).join(format!("{}.chd", disk_name)),
        settings.rom_dir.join(format!("{}.chd", disk_name)),
    ]
}

/// Diagnose every expected disk; disks match by hash only and are
/// addressed by file name in the tree rather than archive slot.
pub fn check_disks(game: &Game, ctx: &mut CheckContext, result: &mut GameResult) -> Result<()> {
    if game.disks.is_empty() || result.game == GameStatus::Old {
        return Ok(());
    }

    for (index, disk) in game.disks.iter().enumerate() {
        let disks = &mut result.disks;
        let images = &mut result.images;
        let found = &mut disks[index];
        if found.quality == Quality::Old {
            continue;
        }
        found.quality = Quality::Missing;

        for path in disk_image_paths(ctx.settings, &game.name, disk.merged_name()) {
            let Ok(image_hashes) = chd::disk_hashes(&path, ctx.settings.integrity) else {
                continue;
            };

            if disk.hashes.is_empty() {
                found.quality = Quality::NoHash;
            } else {
                match disk.hashes.compare(&image_hashes) {
                    HashCompare::Match => {
                        found.quality = Quality::Ok;
                        images.push(DiskImage {
                            path: path.clone(),
                            status: FileStatus::Used,
                        });
                    }
                    HashCompare::Mismatch => {
                        found.quality = Quality::HashErr;
                        images.push(DiskImage {
                            path: path.clone(),
                            status: FileStatus::Unknown,
                        });
                    }
                    HashCompare::NoCommon => continue,
                }
            }
            found.location = disk.location;
            found.source = MatchSource::Foreign {
                path,
                location: Location::InGame,
                index: 0,
            };
            break;
        }

        if disk.location != Location::InGame || disk.hashes.is_empty() {
            continue;
        }

        if found.quality != Quality::Ok {
            if find_disk_in_romset(ctx.catalog, ctx.settings, disk, &game.name, found)?
                == FindResult::Exists
            {
                continue;
            }
            ctx.maps.ensure_needed(ctx.settings, ctx.detector)?;
            ctx.maps.ensure_extra(ctx.settings, ctx.detector)?;
            if find_disk(&ctx.maps.memdb, disk, found)? == FindResult::Exists {
                continue;
            }
        }
    }

    update_game_status(game, ctx.settings, result);
    Ok(())
}
