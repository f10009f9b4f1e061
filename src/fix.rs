use anyhow::{bail, Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::archive::{Archive, ArchiveKind, OpenFlags};
use crate::check::{classify_stray, CheckContext, FileStatus, GameResult, GameStatus};
use crate::hashes::{HashType, HashTypes, Hashes};
use crate::matcher::{MatchSource, Quality};
use crate::models::{FileType, Game, Location};
use crate::settings::Settings;

/// What a fix pass did, for the end-of-run summary.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixCounts {
    pub renamed: u64,
    pub copied: u64,
    pub sliced: u64,
    pub moved: u64,
    pub deleted: u64,
}

impl std::ops::AddAssign for FixCounts {
    fn add_assign(&mut self, other: FixCounts) {
        self.renamed += other.renamed;
        self.copied += other.copied;
        self.sliced += other.sliced;
        self.moved += other.moved;
        self.deleted += other.deleted;
    }
}

/// First free `<hash>-NNN.<ext>` slot in the quarantine directory,
/// starting at 000. Slots claimed by the current plan count as taken.
fn make_needed_name(
    dir: &Utf8Path,
    hashes: &Hashes,
    extension: &str,
    plan: Option<&Plan>,
) -> Result<Utf8PathBuf> {
    let stem = hashes
        .to_string(HashType::Crc)
        .or_else(|| hashes.to_string(HashType::Md5))
        .unwrap_or_else(|| "unknown".to_owned());

    for slot in 0..1000 {
        let candidate = dir.join(format!("{}-{:03}.{}", stem, slot, extension));
        let claimed = plan.is_some_and(|plan| {
            plan.destinations
                .iter()
                .any(|archive| archive.path == candidate)
        });
        if !claimed && !candidate.exists() {
            return Ok(candidate);
        }
    }
    bail!("no free quarantine slot for '{}' in '{}'", stem, dir)
}

fn open_quarantine(path: &Utf8Path, kind: ArchiveKind) -> Result<Archive> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create directory '{}'", parent))?;
    }
    Archive::open(
        path,
        kind,
        FileType::Rom,
        Location::Needed,
        OpenFlags::create(),
    )
}

/// Archives opened while building a plan, committed sources-first.
struct Plan {
    /// Foreign archives content is copied out of (and maybe deleted from).
    sources: Vec<Archive>,
    /// Quarantine archives content is moved into.
    destinations: Vec<Archive>,
}

impl Plan {
    fn new() -> Self {
        Plan {
            sources: Vec::new(),
            destinations: Vec::new(),
        }
    }

    fn source(&mut self, path: &Utf8Path, settings: &Settings) -> Result<&mut Archive> {
        if let Some(position) = self.sources.iter().position(|a| a.path == *path) {
            return Ok(&mut self.sources[position]);
        }
        let archive = Archive::open(
            path,
            Settings::kind_of(path),
            FileType::Rom,
            Location::RomSet,
            if settings.dryrun {
                OpenFlags::readonly()
            } else {
                OpenFlags::writable()
            },
        )?;
        self.sources.push(archive);
        Ok(self.sources.last_mut().expect("just pushed"))
    }

    /// Quarantine destination, opened once per path; a second open of the
    /// same path would lose the first's staged entries.
    fn destination(&mut self, path: &Utf8Path, kind: ArchiveKind) -> Result<&mut Archive> {
        if let Some(position) = self.destinations.iter().position(|a| a.path == *path) {
            return Ok(&mut self.destinations[position]);
        }
        let archive = open_quarantine(path, kind)?;
        self.destinations.push(archive);
        Ok(self.destinations.last_mut().expect("just pushed"))
    }

    fn commit(self, own: Option<&mut Archive>) -> Result<()> {
        self.commit_with(Vec::new(), own)
    }

    /// Commit order per the contract: sources carry the original data, so
    /// they go first (ancestor archives ahead of the other sources);
    /// failures roll back everything not yet committed.
    fn commit_with(mut self, ancestors: Vec<&mut Archive>, own: Option<&mut Archive>) -> Result<()> {
        let mut archives: Vec<&mut Archive> = ancestors;
        archives.extend(self.sources.iter_mut());
        archives.extend(self.destinations.iter_mut());
        if let Some(own) = own {
            archives.push(own);
        }

        let mut failed = None;
        for (position, archive) in archives.iter_mut().enumerate() {
            if let Err(err) = archive.commit() {
                failed = Some((position, err));
                break;
            }
        }

        if let Some((position, err)) = failed {
            for archive in archives.iter_mut().skip(position + 1) {
                let _ = archive.rollback();
            }
            return Err(err);
        }
        Ok(())
    }
}

/// Turn one game's check result into staged mutations and commit them.
pub fn fix_game(
    game: &Game,
    archives: &mut [Option<Archive>; 3],
    ctx: &mut CheckContext,
    result: &GameResult,
) -> Result<FixCounts> {
    let mut counts = FixCounts::default();
    if result.game == GameStatus::Old || result.game == GameStatus::Correct {
        if !needs_stray_handling(result) && !has_ancestor_matches(result) {
            return Ok(counts);
        }
    }

    let settings = ctx.settings;
    let mut plan = Plan::new();

    // own archive may not exist yet when everything comes from elsewhere
    if archives[0].is_none() {
        let any_incoming = result.roms.iter().any(|found| {
            found.quality == Quality::Copied
                || (found.quality == Quality::Ok
                    && matches!(found.source, MatchSource::Slot { slot, .. } if slot != 0))
        });
        if any_incoming && !settings.dryrun {
            archives[0] = Some(Archive::open(
                &settings.game_archive_path(&game.name),
                settings.archive_kind(),
                FileType::Rom,
                Location::InGame,
                OpenFlags::create(),
            )?);
        }
    }

    for (index, rom) in game.roms.iter().enumerate() {
        let found = &result.roms[index];
        match found.quality {
            Quality::Ok => {
                // correct content inherited from an ancestor archive is
                // copied into the game's own archive under the expected
                // name; the now-duplicate ancestor entry goes with the
                // delete policy
                let MatchSource::Slot { slot, index: entry } = found.source else {
                    continue;
                };
                if slot == 0 {
                    continue;
                }
                let Some(ancestor_path) =
                    archives[slot].as_ref().map(|ancestor| ancestor.path.clone())
                else {
                    continue;
                };
                if settings.dryrun || settings.verbose {
                    println!(
                        "{}: copy '{}' from ancestor '{}'",
                        game.name, rom.name, ancestor_path
                    );
                }
                if settings.dryrun {
                    continue;
                }

                let (own_part, ancestor_part) = archives.split_at_mut(1);
                let Some(own) = own_part[0].as_mut() else {
                    continue;
                };
                let Some(ancestor) = ancestor_part[slot - 1].as_mut() else {
                    continue;
                };
                if own.name_index(&rom.name).is_none() {
                    own.file_copy(ancestor, entry, &rom.name)?;
                    counts.copied += 1;
                }
                if settings.delete_found {
                    ancestor.file_delete(entry)?;
                }
            }
            Quality::NameErr => {
                let MatchSource::Slot { slot: 0, index: entry } = found.source else {
                    continue;
                };
                if settings.dryrun || settings.verbose {
                    println!(
                        "{}: rename '{}' to '{}'",
                        game.name,
                        archives[0].as_ref().map_or("", |own| &own.files[entry].name),
                        rom.name
                    );
                }
                if !settings.dryrun {
                    if let Some(own) = archives[0].as_mut() {
                        own.file_rename(entry, &rom.name)?;
                        counts.renamed += 1;
                    }
                }
            }
            Quality::Long => {
                let MatchSource::Slot { slot: 0, index: entry } = found.source else {
                    continue;
                };
                let Some(offset) = found.offset else {
                    continue;
                };
                let Some(length) = rom.size.known() else {
                    continue;
                };
                if settings.dryrun || settings.verbose {
                    println!(
                        "{}: extract {} bytes at offset {} of '{}' as '{}'",
                        game.name, length, offset, rom.name, rom.name
                    );
                }
                if settings.dryrun {
                    continue;
                }
                let Some(own) = archives[0].as_mut() else {
                    continue;
                };

                if !settings.delete_long {
                    // keep the long original in the unknown quarantine
                    let quarantine_path = unknown_archive_path(settings, &game.name);
                    let quarantine =
                        plan.destination(&quarantine_path, settings.archive_kind())?;
                    let kept_name = free_name(quarantine, &own.files[entry].name);
                    quarantine.file_copy(own, entry, &kept_name)?;
                }
                own.extract_slice(entry, &rom.name, offset, length)?;
                counts.sliced += 1;
            }
            Quality::Copied => {
                let MatchSource::Foreign {
                    path,
                    location,
                    index: entry,
                } = &found.source
                else {
                    continue;
                };
                if settings.dryrun || settings.verbose {
                    println!("{}: copy '{}' from '{}'", game.name, rom.name, path);
                }
                if settings.dryrun {
                    continue;
                }
                let Some(own) = archives[0].as_mut() else {
                    continue;
                };

                let source = plan.source(path, settings)?;
                if own.name_index(&rom.name).is_none() {
                    own.file_copy(source, *entry, &rom.name)?;
                    counts.copied += 1;
                }

                let consume = match location {
                    Location::Needed => true,
                    Location::Extra => settings.delete_found,
                    _ => false,
                };
                if consume {
                    source.file_delete(*entry)?;
                }
            }
            _ => {}
        }
    }

    fix_stray_files(game, archives, ctx, result, &mut plan, &mut counts)?;

    if ctx.settings.dryrun {
        return Ok(counts);
    }

    if let Some(own) = archives[0].as_mut() {
        own.sort_on_commit = ctx.settings.torrentzip;
    }
    let (own_part, ancestor_part) = archives.split_at_mut(1);
    let ancestors: Vec<&mut Archive> = ancestor_part
        .iter_mut()
        .filter_map(Option::as_mut)
        .filter(|ancestor| ancestor.is_modified())
        .collect();
    plan.commit_with(ancestors, own_part[0].as_mut())?;

    refresh_index(ctx, archives)?;
    Ok(counts)
}

fn needs_stray_handling(result: &GameResult) -> bool {
    result.files.iter().any(|status| {
        matches!(
            status,
            FileStatus::Unknown
                | FileStatus::Needed
                | FileStatus::Superfluous
                | FileStatus::Duplicate
        )
    })
}

/// True when a rom was satisfied out of an ancestor archive; fixing
/// copies that content into the game's own archive.
fn has_ancestor_matches(result: &GameResult) -> bool {
    result.roms.iter().any(|found| {
        found.quality == Quality::Ok
            && matches!(found.source, MatchSource::Slot { slot, .. } if slot != 0)
    })
}

fn unknown_archive_path(settings: &Settings, game: &str) -> Utf8PathBuf {
    if settings.roms_unzipped {
        settings.unknown_dir.join(game)
    } else {
        settings.unknown_dir.join(format!("{}.zip", game))
    }
}

/// First entry name not taken in `archive`, appending `-N` as needed.
fn free_name(archive: &Archive, wanted: &str) -> String {
    if archive.name_index(wanted).is_none() {
        return wanted.to_owned();
    }
    for suffix in 1.. {
        let candidate = format!("{}-{}", wanted, suffix);
        if archive.name_index(&candidate).is_none() {
            return candidate;
        }
    }
    unreachable!()
}

/// Handle entries in the own archive no expected rom uses.
fn fix_stray_files(
    game: &Game,
    archives: &mut [Option<Archive>; 3],
    ctx: &mut CheckContext,
    result: &GameResult,
    plan: &mut Plan,
    counts: &mut FixCounts,
) -> Result<()> {
    let settings = ctx.settings;
    let Some(own) = archives[0].as_mut() else {
        return Ok(());
    };

    for (index, status) in result.files.iter().enumerate() {
        match status {
            FileStatus::Unknown => {
                if settings.ignore_extra {
                    continue;
                }
                if settings.move_unknown {
                    if settings.dryrun || settings.verbose {
                        println!(
                            "{}: move unknown file '{}'",
                            game.name, own.files[index].name
                        );
                    }
                    if settings.dryrun {
                        continue;
                    }
                    let quarantine_path = unknown_archive_path(settings, &game.name);
                    let quarantine =
                        plan.destination(&quarantine_path, settings.archive_kind())?;
                    let name = free_name(quarantine, &own.files[index].name);
                    quarantine.file_copy(own, index, &name)?;
                    own.file_delete(index)?;
                    counts.moved += 1;
                } else {
                    if settings.dryrun || settings.verbose {
                        println!(
                            "{}: delete unknown file '{}'",
                            game.name, own.files[index].name
                        );
                    }
                    if settings.dryrun {
                        continue;
                    }
                    own.file_delete(index)?;
                    counts.deleted += 1;
                }
            }
            FileStatus::Needed | FileStatus::Superfluous => {
                if settings.dryrun || settings.verbose {
                    println!(
                        "{}: move '{}' to needed",
                        game.name, own.files[index].name
                    );
                }
                if settings.dryrun {
                    continue;
                }
                own.file_compute_hashes(index, HashTypes::ALL, ctx.detector)?;
                let needed_path =
                    make_needed_name(&settings.needed_dir, &own.files[index].hashes, "zip", Some(&*plan))?;
                let quarantine = plan.destination(&needed_path, ArchiveKind::Zip)?;
                let name = own.files[index].name.clone();
                quarantine.file_copy(own, index, &name)?;
                own.file_delete(index)?;
                counts.moved += 1;
            }
            FileStatus::Duplicate => {
                if !settings.delete_duplicate {
                    continue;
                }
                if settings.dryrun || settings.verbose {
                    println!(
                        "{}: delete duplicate '{}'",
                        game.name, own.files[index].name
                    );
                }
                if settings.dryrun {
                    continue;
                }
                own.file_delete(index)?;
                counts.deleted += 1;
            }
            _ => {}
        }
    }

    Ok(())
}

/// After a successful commit, bring the memory index back in line with
/// the archives the plan touched, ancestors included.
fn refresh_index(ctx: &mut CheckContext, archives: &mut [Option<Archive>; 3]) -> Result<()> {
    for archive in archives.iter_mut().flatten() {
        if archive.id == 0 {
            archive.id = ctx.maps.memdb.register_archive(archive.path.as_str())?;
        }
        ctx.maps.memdb.delete_archive(archive.id, archive.filetype)?;
        ctx.maps.memdb.insert_archive(archive)?;
    }
    Ok(())
}

/// Copy a matched disk image into place; the fix-side counterpart of
/// `check_disks`.
pub fn fix_disks(
    game: &Game,
    ctx: &mut CheckContext,
    result: &GameResult,
) -> Result<FixCounts> {
    let mut counts = FixCounts::default();
    let settings = ctx.settings;

    for (index, disk) in game.disks.iter().enumerate() {
        let found = &result.disks[index];
        if found.quality != Quality::Copied {
            continue;
        }
        let MatchSource::Foreign { path, location, .. } = &found.source else {
            continue;
        };

        let destination = settings
            .rom_dir
            .join(&game.name)
            .join(format!("{}.chd", disk.merged_name()));
        if settings.dryrun || settings.verbose {
            println!("{}: copy disk '{}' to '{}'", game.name, path, destination);
        }
        if settings.dryrun {
            continue;
        }

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create directory '{}'", parent))?;
        }
        let consume = match location {
            Location::Needed => true,
            Location::Extra => settings.delete_found,
            _ => false,
        };
        if consume {
            std::fs::rename(path, &destination)
                .with_context(|| format!("cannot move disk '{}' to '{}'", path, destination))?;
        } else {
            std::fs::copy(path, &destination)
                .with_context(|| format!("cannot copy disk '{}' to '{}'", path, destination))?;
        }
        counts.copied += 1;
    }

    Ok(counts)
}

/// Walk the superfluous archives collected by the scan and empty them:
/// needed content goes to the quarantine, known and duplicate content is
/// deleted per policy, unknown content follows the unknown policy.
pub fn cleanup_superfluous(ctx: &mut CheckContext) -> Result<FixCounts> {
    let mut counts = FixCounts::default();
    let settings = ctx.settings.clone();
    let superfluous = ctx.maps.superfluous.clone();

    for path in superfluous {
        if !path.exists() {
            continue;
        }
        if path.extension() == Some("chd") {
            cleanup_superfluous_disk(ctx, &path, &mut counts)?;
            continue;
        }
        if !path.is_dir() && path.extension() != Some("zip") {
            // plain stray file in the ROM tree
            if settings.dryrun || settings.verbose {
                println!("delete superfluous file '{}'", path);
            }
            if !settings.dryrun {
                std::fs::remove_file(&path)
                    .with_context(|| format!("cannot delete '{}'", path))?;
                counts.deleted += 1;
            }
            continue;
        }

        let mut archive = Archive::open(
            &path,
            Settings::kind_of(&path),
            FileType::Rom,
            Location::Superfluous,
            if settings.dryrun {
                OpenFlags::readonly()
            } else {
                OpenFlags::writable()
            },
        )?;

        let mut plan = Plan::new();
        for index in 0..archive.num_files() {
            archive.file_compute_hashes(index, HashTypes::ALL, ctx.detector)?;
            let file = archive.files[index].clone();
            let status =
                classify_stray(ctx.catalog, ctx.old_catalog, &settings, None, &file)?;

            match status {
                FileStatus::Needed => {
                    if settings.dryrun || settings.verbose {
                        println!("move '{}' from '{}' to needed", file.name, path);
                    }
                    if settings.dryrun {
                        continue;
                    }
                    let needed_path =
                        make_needed_name(&settings.needed_dir, &file.hashes, "zip", Some(&plan))?;
                    let quarantine = plan.destination(&needed_path, ArchiveKind::Zip)?;
                    quarantine.file_copy(&mut archive, index, &file.name)?;
                    archive.file_delete(index)?;
                    counts.moved += 1;
                }
                FileStatus::Superfluous | FileStatus::Duplicate => {
                    if status == FileStatus::Duplicate && !settings.delete_duplicate {
                        continue;
                    }
                    if settings.dryrun || settings.verbose {
                        println!("delete superfluous '{}' from '{}'", file.name, path);
                    }
                    if !settings.dryrun {
                        archive.file_delete(index)?;
                        counts.deleted += 1;
                    }
                }
                FileStatus::Unknown => {
                    if !settings.cleanup_extra {
                        continue;
                    }
                    if settings.dryrun || settings.verbose {
                        println!("delete unknown '{}' from '{}'", file.name, path);
                    }
                    if !settings.dryrun {
                        archive.file_delete(index)?;
                        counts.deleted += 1;
                    }
                }
                _ => {}
            }
        }

        if !settings.dryrun {
            plan.commit(Some(&mut archive))?;
        }
    }

    Ok(counts)
}

fn cleanup_superfluous_disk(
    ctx: &mut CheckContext,
    path: &Utf8Path,
    counts: &mut FixCounts,
) -> Result<()> {
    let settings = ctx.settings;
    let Ok(hashes) = crate::chd::disk_hashes(path, false) else {
        return Ok(());
    };

    let locations = ctx.catalog.read_file_by_hash(FileType::Disk, &hashes)?;
    if locations.is_empty() {
        return Ok(());
    }

    // some game wants this image; park it in the quarantine
    if settings.dryrun || settings.verbose {
        println!("move disk '{}' to needed", path);
    }
    if !settings.dryrun {
        let needed_path = make_needed_name(&settings.needed_dir, &hashes, "chd", None)?;
        if let Some(parent) = needed_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(path, &needed_path)
            .with_context(|| format!("cannot move disk '{}' to '{}'", path, needed_path))?;
        counts.moved += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, OpenMode};
    use crate::check::{check_files, GameResult};
    use crate::hashes::hash_bytes;
    use crate::models::{FileDesc, FileSize};
    use crate::scanner::DirMaps;
    use std::io::{Read as _, Write as _};

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
    }

    fn write_zip(path: &Utf8Path, entries: &[(&str, &[u8])]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
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

    fn read_zip(path: &Utf8Path) -> Vec<(String, Vec<u8>)> {
        let mut zip = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
        let mut entries = Vec::new();
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            entries.push((entry.name().to_owned(), data));
        }
        entries
    }

    fn rom(name: &str, data: &[u8]) -> FileDesc {
        FileDesc {
            name: name.to_owned(),
            size: FileSize::Known(data.len() as u64),
            hashes: hash_bytes(data, HashTypes::ALL),
            ..FileDesc::default()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        settings: Settings,
        catalog: Catalog,
        maps: DirMaps,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let settings = Settings {
            rom_dir: root.join("roms"),
            needed_dir: root.join("needed"),
            unknown_dir: root.join("unknown"),
            fix: true,
            ..Settings::default()
        };
        std::fs::create_dir_all(&settings.rom_dir).unwrap();
        let catalog = Catalog::open(&root.join("mame.db"), OpenMode::New).unwrap();
        Fixture {
            _dir: dir,
            settings,
            catalog,
            maps: DirMaps::new().unwrap(),
        }
    }

    fn check_and_fix(fx: &mut Fixture, game: &Game) -> (GameResult, FixCounts) {
        let mut archives = [
            Archive::open(
                &fx.settings.game_archive_path(&game.name),
                fx.settings.archive_kind(),
                FileType::Rom,
                Location::InGame,
                OpenFlags::writable(),
            )
            .ok(),
            None,
            None,
        ];
        let mut result = GameResult::new(game, archives[0].as_ref());
        let mut ctx = CheckContext {
            catalog: &fx.catalog,
            old_catalog: None,
            settings: &fx.settings,
            detector: None,
            maps: &mut fx.maps,
        };
        check_files(game, &mut archives, &mut ctx, &mut result).unwrap();
        let counts = fix_game(game, &mut archives, &mut ctx, &result).unwrap();
        (result, counts)
    }

    #[test]
    fn misnamed_rom_is_renamed_in_place() {
        let mut fx = fixture();
        let mut game = Game {
            name: "pacman".to_owned(),
            roms: vec![rom("rom.bin", b"abcd")],
            ..Game::default()
        };
        fx.catalog.write_game(&mut game).unwrap();
        let archive_path = fx.settings.game_archive_path("pacman");
        write_zip(&archive_path, &[("wrong.bin", b"abcd")]);

        let (_, counts) = check_and_fix(&mut fx, &game);
        assert_eq!(counts.renamed, 1);
        assert_eq!(
            read_zip(&archive_path),
            vec![("rom.bin".to_owned(), b"abcd".to_vec())]
        );
    }

    #[test]
    fn long_rom_is_sliced_to_expected_bytes() {
        let mut fx = fixture();
        fx.settings.delete_long = true;
        let mut game = Game {
            name: "pacman".to_owned(),
            roms: vec![rom("rom.bin", b"abcd")],
            ..Game::default()
        };
        fx.catalog.write_game(&mut game).unwrap();
        let archive_path = fx.settings.game_archive_path("pacman");
        write_zip(&archive_path, &[("rom.bin", b"XXXXabcd")]);

        let (result, counts) = check_and_fix(&mut fx, &game);
        assert_eq!(result.roms[0].quality, Quality::Long);
        assert_eq!(counts.sliced, 1);
        assert_eq!(
            read_zip(&archive_path),
            vec![("rom.bin".to_owned(), b"abcd".to_vec())]
        );
    }

    #[test]
    fn rom_copied_from_donor_game() {
        let mut fx = fixture();
        let mut wanting = Game {
            name: "wanting".to_owned(),
            roms: vec![rom("rom.bin", b"abcd")],
            ..Game::default()
        };
        fx.catalog.write_game(&mut wanting).unwrap();
        let mut donor = Game {
            name: "donor".to_owned(),
            roms: vec![rom("donor.bin", b"abcd")],
            ..Game::default()
        };
        fx.catalog.write_game(&mut donor).unwrap();
        write_zip(
            &fx.settings.game_archive_path("donor"),
            &[("donor.bin", b"abcd")],
        );

        let (_, counts) = check_and_fix(&mut fx, &wanting);
        assert_eq!(counts.copied, 1);
        assert_eq!(
            read_zip(&fx.settings.game_archive_path("wanting")),
            vec![("rom.bin".to_owned(), b"abcd".to_vec())]
        );
        // the donor still has its copy
        assert_eq!(
            read_zip(&fx.settings.game_archive_path("donor")),
            vec![("donor.bin".to_owned(), b"abcd".to_vec())]
        );
    }

    fn parent_and_child(fx: &mut Fixture) -> Game {
        let mut parent = Game {
            name: "parent".to_owned(),
            roms: vec![rom("shared.bin", b"abcd")],
            ..Game::default()
        };
        fx.catalog.write_game(&mut parent).unwrap();

        let mut shared = rom("shared.bin", b"abcd");
        shared.merge = Some("shared.bin".to_owned());
        shared.location = Location::InParent;
        let mut child = Game {
            name: "child".to_owned(),
            cloneof: [Some("parent".to_owned()), None],
            roms: vec![shared],
            ..Game::default()
        };
        fx.catalog.write_game(&mut child).unwrap();

        write_zip(
            &fx.settings.game_archive_path("parent"),
            &[("shared.bin", b"abcd")],
        );
        child
    }

    fn check_and_fix_with_parent(fx: &mut Fixture, child: &Game) -> FixCounts {
        let mut archives = [
            Archive::open(
                &fx.settings.game_archive_path("child"),
                ArchiveKind::Zip,
                FileType::Rom,
                Location::InGame,
                OpenFlags::writable(),
            )
            .ok(),
            Archive::open(
                &fx.settings.game_archive_path("parent"),
                ArchiveKind::Zip,
                FileType::Rom,
                Location::InGame,
                OpenFlags::writable(),
            )
            .ok(),
            None,
        ];
        let mut result = GameResult::new(child, archives[0].as_ref());
        let mut ctx = CheckContext {
            catalog: &fx.catalog,
            old_catalog: None,
            settings: &fx.settings,
            detector: None,
            maps: &mut fx.maps,
        };
        check_files(child, &mut archives, &mut ctx, &mut result).unwrap();
        assert_eq!(result.roms[0].quality, Quality::Ok);
        assert_eq!(result.roms[0].location, Location::InParent);
        fix_game(child, &mut archives, &mut ctx, &result).unwrap()
    }

    #[test]
    fn inherited_rom_copied_from_ancestor_archive() {
        let mut fx = fixture();
        let child = parent_and_child(&mut fx);

        let counts = check_and_fix_with_parent(&mut fx, &child);
        assert_eq!(counts.copied, 1);
        assert_eq!(
            read_zip(&fx.settings.game_archive_path("child")),
            vec![("shared.bin".to_owned(), b"abcd".to_vec())]
        );
        // default policy keeps the ancestor's entry in place
        assert_eq!(
            read_zip(&fx.settings.game_archive_path("parent")),
            vec![("shared.bin".to_owned(), b"abcd".to_vec())]
        );
    }

    #[test]
    fn ancestor_duplicate_deleted_under_delete_policy() {
        let mut fx = fixture();
        fx.settings.delete_found = true;
        let child = parent_and_child(&mut fx);

        let counts = check_and_fix_with_parent(&mut fx, &child);
        assert_eq!(counts.copied, 1);
        assert_eq!(
            read_zip(&fx.settings.game_archive_path("child")),
            vec![("shared.bin".to_owned(), b"abcd".to_vec())]
        );
        // deleting its only entry removes the parent archive entirely
        assert!(!fx.settings.game_archive_path("parent").exists());
    }

    #[test]
    fn needed_entry_moves_to_quarantine_slot_zero() {
        let mut fx = fixture();
        let mut holder = Game {
            name: "holder".to_owned(),
            roms: vec![rom("own.bin", b"own data")],
            ..Game::default()
        };
        fx.catalog.write_game(&mut holder).unwrap();
        let mut needs = Game {
            name: "needs".to_owned(),
            roms: vec![rom("wanted.bin", b"wanted data")],
            ..Game::default()
        };
        fx.catalog.write_game(&mut needs).unwrap();

        let archive_path = fx.settings.game_archive_path("holder");
        write_zip(
            &archive_path,
            &[("own.bin", b"own data"), ("stray.bin", b"wanted data")],
        );

        let (result, counts) = check_and_fix(&mut fx, &holder);
        assert_eq!(result.files[1], FileStatus::Needed);
        assert_eq!(counts.moved, 1);

        let crc = hash_bytes(b"wanted data", HashTypes::ALL)
            .to_string(HashType::Crc)
            .unwrap();
        let needed = fx.settings.needed_dir.join(format!("{}-000.zip", crc));
        assert!(needed.exists());
        assert_eq!(
            read_zip(&needed),
            vec![("stray.bin".to_owned(), b"wanted data".to_vec())]
        );
        assert_eq!(
            read_zip(&archive_path),
            vec![("own.bin".to_owned(), b"own data".to_vec())]
        );
    }

    #[test]
    fn duplicate_against_old_db_is_deleted() {
        let mut fx = fixture();
        let dir = tempfile::tempdir().unwrap();
        let old = Catalog::open(&utf8(dir.path()).join("old.db"), OpenMode::New).unwrap();
        let mut retired = Game {
            name: "retired".to_owned(),
            roms: vec![rom("retired.bin", b"\xde\xad\xbe\xef")],
            ..Game::default()
        };
        old.write_game(&mut retired).unwrap();

        let mut game = Game {
            name: "stray".to_owned(),
            roms: Vec::new(),
            ..Game::default()
        };
        fx.catalog.write_game(&mut game).unwrap();
        let archive_path = fx.settings.game_archive_path("stray");
        write_zip(&archive_path, &[("dup.bin", b"\xde\xad\xbe\xef")]);

        let mut archives = [
            Archive::open(
                &archive_path,
                ArchiveKind::Zip,
                FileType::Rom,
                Location::InGame,
                OpenFlags::writable(),
            )
            .ok(),
            None,
            None,
        ];
        let mut result = GameResult::new(&game, archives[0].as_ref());
        let mut ctx = CheckContext {
            catalog: &fx.catalog,
            old_catalog: Some(&old),
            settings: &fx.settings,
            detector: None,
            maps: &mut fx.maps,
        };
        check_files(&game, &mut archives, &mut ctx, &mut result).unwrap();
        assert_eq!(result.files[0], FileStatus::Duplicate);

        let counts = fix_game(&game, &mut archives, &mut ctx, &result).unwrap();
        assert_eq!(counts.deleted, 1);
        // deleting the only entry removes the archive
        assert!(!archive_path.exists());
        // nothing went to the needed quarantine
        assert!(!fx.settings.needed_dir.exists());
    }

    #[test]
    fn superfluous_cleanup_is_idempotent() {
        let mut fx = fixture();
        let mut game = Game {
            name: "pacman".to_owned(),
            roms: vec![rom("rom.bin", b"abcd")],
            ..Game::default()
        };
        fx.catalog.write_game(&mut game).unwrap();
        write_zip(
            &fx.settings.game_archive_path("pacman"),
            &[("rom.bin", b"abcd")],
        );
        // a stray archive holding a copy of content pacman already has
        write_zip(
            &fx.settings.rom_dir.join("leftover.zip"),
            &[("spare.bin", b"abcd")],
        );

        fx.maps
            .ensure_romset(&fx.settings, &fx.catalog, None)
            .unwrap();
        assert_eq!(
            fx.maps.superfluous,
            vec![fx.settings.rom_dir.join("leftover.zip")]
        );

        let mut ctx = CheckContext {
            catalog: &fx.catalog,
            old_catalog: None,
            settings: &fx.settings,
            detector: None,
            maps: &mut fx.maps,
        };
        let first = cleanup_superfluous(&mut ctx).unwrap();
        assert_eq!(first.deleted, 1);
        assert!(!fx.settings.rom_dir.join("leftover.zip").exists());

        let mut ctx = CheckContext {
            catalog: &fx.catalog,
            old_catalog: None,
            settings: &fx.settings,
            detector: None,
            maps: &mut fx.maps,
        };
        let second = cleanup_superfluous(&mut ctx).unwrap();
        assert_eq!(second.deleted + second.moved, 0);
    }

    #[test]
    fn fix_is_idempotent_on_clean_tree() {
        let mut fx = fixture();
        let mut game = Game {
            name: "pacman".to_owned(),
            roms: vec![rom("rom.bin", b"abcd")],
            ..Game::default()
        };
        fx.catalog.write_game(&mut game).unwrap();
        let archive_path = fx.settings.game_archive_path("pacman");
        write_zip(&archive_path, &[("wrong.bin", b"abcd")]);

        let (_, first) = check_and_fix(&mut fx, &game);
        assert_eq!(first.renamed, 1);

        // plan feasibility: the next pass reports correct, changes nothing
        let (result, second) = check_and_fix(&mut fx, &game);
        assert_eq!(result.game, GameStatus::Correct);
        assert_eq!(second.renamed + second.copied + second.moved + second.deleted, 0);
    }
}
