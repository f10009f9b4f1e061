use std::collections::HashSet;

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Subcommand};

use crate::catalog::{Catalog, ListKind, OpenMode};
use crate::detector_xml;
use crate::hashes::{HashCompare, HashType, Hashes};
use crate::models::{FileType, Game, Location, Status};

macro_rules! debug_log {
    ($debug:expr, $($arg:tt)*) => {
        if $debug {
            eprintln!("{}", format!("Debug: {}", format!($($arg)*)));
        }
    };
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Create a new database and import a dat file into it
    Init {
        /// Path to the dat XML file to import
        input: Utf8PathBuf,

        /// Header-skip detector XML to store in the database
        #[arg(long)]
        detector: Option<Utf8PathBuf>,
    },
    /// Import a dat file into an existing database
    Import {
        /// Path to the dat XML file to import
        input: Utf8PathBuf,

        /// Header-skip detector XML to store in the database
        #[arg(long)]
        detector: Option<Utf8PathBuf>,
    },
}

pub fn handle_command(db_path: &Utf8Path, debug: bool, command: &DbCommands) -> Result<()> {
    match command {
        DbCommands::Init { input, detector } => {
            let catalog =
                Catalog::open(db_path, OpenMode::New).context("failed to create database")?;
            import_dat(&catalog, input, detector.as_deref(), debug)?;
            println!("created {} from {}", db_path, input);
        }
        DbCommands::Import { input, detector } => {
            let catalog =
                Catalog::open(db_path, OpenMode::Write).context("failed to open database")?;
            import_dat(&catalog, input, detector.as_deref(), debug)?;
            println!("imported {} into {}", input, db_path);
        }
    }
    Ok(())
}

/// Import one dat transactionally: all games land, then a finalization
/// pass wires children to the ancestors that own their content.
fn import_dat(
    catalog: &Catalog,
    input: &Utf8Path,
    detector_path: Option<&Utf8Path>,
    debug: bool,
) -> Result<()> {
    let data = crate::dat_parser::parse_file(input)?;
    let dat_idx = catalog.read_dats()?.len() as i64;

    let tx = catalog.transaction()?;

    catalog.write_dat(dat_idx, &data.dat_entry())?;
    debug_log!(debug, "importing {} games from {}", data.games.len(), input);

    for dat_game in data.games {
        let mut game = dat_game.into_game(dat_idx)?;
        catalog.write_game(&mut game)?;
    }

    finalize_parents(catalog, debug)?;

    if let Some(detector_path) = detector_path {
        let detector = detector_xml::parse_file(detector_path)?;
        catalog.write_detector(&detector)?;
        debug_log!(debug, "stored detector: {}", detector.name);
    }

    tx.commit()?;
    Ok(())
}

/// Wire each child's files to the first ancestor owning the content.
/// Children imported before their parent are naturally resolved here,
/// since every game is in the database by now; a declared parent that
/// never appeared clears the child's cloneof, and cloneof cycles are
/// broken with a warning.
fn finalize_parents(catalog: &Catalog, debug: bool) -> Result<()> {
    let names = catalog.read_list(ListKind::Games)?;
    let limit = names.len();

    for name in &names {
        let Some(mut game) = catalog.read_game(name)? else {
            continue;
        };
        let Some(parent_name) = game.cloneof[0].clone() else {
            continue;
        };

        if catalog.read_game(&parent_name)?.is_none() {
            eprintln!(
                "romck: {}: parent '{}' not in database, clearing",
                name, parent_name
            );
            game.cloneof = [None, None];
            catalog.update_game_parent(&game)?;
            continue;
        }

        if let Some(cycle_member) = find_cycle(catalog, name, limit)? {
            eprintln!(
                "romck: {}: cloneof cycle through '{}', clearing",
                name, cycle_member
            );
            game.cloneof = [None, None];
            catalog.update_game_parent(&game)?;
            continue;
        }

        let parent = catalog.read_game(&parent_name)?;
        let grandparent = match parent
            .as_ref()
            .and_then(|parent| parent.cloneof[0].as_deref())
        {
            Some(grandparent_name) => catalog.read_game(grandparent_name)?,
            None => None,
        };

        let mut changed = false;
        for filetype in [FileType::Rom, FileType::Disk] {
            for file in game.files_mut(filetype).iter_mut() {
                let location = ancestor_location(
                    file.merged_name(),
                    &file.hashes,
                    file.status,
                    filetype,
                    parent.as_ref(),
                    grandparent.as_ref(),
                );
                if location != file.location {
                    file.location = location;
                    changed = true;
                }
            }
        }
        if changed {
            catalog.update_file_locations(&game)?;
            debug_log!(debug, "wired parent files for {}", name);
        }
    }

    Ok(())
}

fn ancestor_owns(
    merged_name: &str,
    hashes: &Hashes,
    status: Status,
    filetype: FileType,
    ancestor: &Game,
) -> bool {
    ancestor.files(filetype).iter().any(|candidate| {
        candidate.name == merged_name
            && (status == Status::NoDump
                || hashes.compare(&candidate.hashes) == HashCompare::Match)
    })
}

fn ancestor_location(
    merged_name: &str,
    hashes: &Hashes,
    status: Status,
    filetype: FileType,
    parent: Option<&Game>,
    grandparent: Option<&Game>,
) -> Location {
    if let Some(parent) = parent {
        if ancestor_owns(merged_name, hashes, status, filetype, parent) {
            return Location::InParent;
        }
    }
    if let Some(grandparent) = grandparent {
        if ancestor_owns(merged_name, hashes, status, filetype, grandparent) {
            return Location::InGrandparent;
        }
    }
    Location::InGame
}

/// Walk the cloneof chain; a revisited name within `limit` hops is a
/// cycle and the offending member is returned.
fn find_cycle(catalog: &Catalog, start: &str, limit: usize) -> Result<Option<String>> {
    let mut seen = HashSet::new();
    seen.insert(start.to_owned());
    let mut current = start.to_owned();

    for _ in 0..=limit {
        let Some(game) = catalog.read_game(&current)? else {
            return Ok(None);
        };
        let Some(parent) = game.cloneof[0].clone() else {
            return Ok(None);
        };
        if !seen.insert(parent.clone()) {
            return Ok(Some(parent));
        }
        current = parent;
    }
    Ok(Some(current))
}

#[derive(Args)]
pub struct DumpArgs {
    /// Path to the mame database
    #[arg(short = 'D', long = "db")]
    db: Option<Utf8PathBuf>,

    /// Game names, hashes, or special keys (/list, /dat, /detector,
    /// /hashtypes, /stats)
    keys: Vec<String>,
}

pub fn handle_dump(args: &DumpArgs, _debug: bool) -> Result<()> {
    let db_path = crate::settings::resolve_db_path(args.db.clone());
    let catalog =
        Catalog::open(&db_path, OpenMode::Read).context("failed to open rom database")?;

    for key in &args.keys {
        match key.as_str() {
            "/list" => {
                for name in catalog.read_list(ListKind::Games)? {
                    println!("{}", name);
                }
            }
            "/dat" => {
                for (index, dat) in catalog.read_dats()?.iter().enumerate() {
                    println!("{}: {} ({})", index, dat.name, dat.version);
                }
            }
            "/detector" => match catalog.read_detector()? {
                Some(detector) => {
                    println!("{} ({})", detector.name, detector.version);
                    print!("{}", detector_xml::emit(&detector)?);
                }
                None => println!("no detector in database"),
            },
            "/hashtypes" => {
                for (label, filetype) in [("roms", FileType::Rom), ("disks", FileType::Disk)] {
                    let types = catalog.hash_types(filetype)?;
                    let mut names = Vec::new();
                    for hash_type in [HashType::Crc, HashType::Md5, HashType::Sha1] {
                        if types.contains(hash_type) {
                            names.push(hash_type.to_string());
                        }
                    }
                    println!("{}: {}", label, names.join(", "));
                }
            }
            "/stats" => {
                let (games, roms, bytes, disks) = catalog.read_stats()?;
                println!("games: {}", games);
                println!("roms: {} ({} bytes)", roms, bytes);
                println!("disks: {}", disks);
            }
            key => {
                if let Ok(hashes) = Hashes::from_str(key) {
                    dump_by_hash(&catalog, &hashes)?;
                } else {
                    dump_game(&catalog, key)?;
                }
            }
        }
    }
    Ok(())
}

fn dump_game(catalog: &Catalog, name: &str) -> Result<()> {
    let Some(game) = catalog.read_game(name)? else {
        println!("{}: not found", name);
        return Ok(());
    };

    println!("Name:        {}", game.name);
    println!("Description: {}", game.description);
    if let Some(parent) = &game.cloneof[0] {
        println!("Cloneof:     {}", parent);
    }

    if !game.roms.is_empty() {
        println!("Roms:");
        for rom in &game.roms {
            let mut line = format!("\t{} size {}", rom.name, rom.size);
            for hash_type in [HashType::Crc, HashType::Md5, HashType::Sha1] {
                if let Some(hex) = rom.hashes.to_string(hash_type) {
                    line.push_str(&format!(" {} {}", hash_type, hex));
                }
            }
            if rom.status != Status::Ok {
                line.push_str(&format!(" status {}", rom.status));
            }
            if let Some(merge) = &rom.merge {
                line.push_str(&format!(" (in {} {})", rom.location, merge));
            }
            println!("{}", line);
        }
    }
    if !game.disks.is_empty() {
        println!("Disks:");
        for disk in &game.disks {
            let mut line = format!("\t{}", disk.name);
            for hash_type in [HashType::Md5, HashType::Sha1] {
                if let Some(hex) = disk.hashes.to_string(hash_type) {
                    line.push_str(&format!(" {} {}", hash_type, hex));
                }
            }
            println!("{}", line);
        }
    }
    Ok(())
}

fn dump_by_hash(catalog: &Catalog, hashes: &Hashes) -> Result<()> {
    let mut found = false;
    for filetype in [FileType::Rom, FileType::Disk] {
        for location in catalog.read_file_by_hash(filetype, hashes)? {
            let Some(game) = catalog.read_game(&location.game)? else {
                continue;
            };
            if let Some(file) = game.files(filetype).get(location.index) {
                println!("{} {} ({})", game.name, file.name, filetype);
                found = true;
            }
        }
    }
    if !found {
        println!("hash not found in database");
    }
    Ok(())
}
