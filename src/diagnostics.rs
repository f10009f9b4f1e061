use anyhow::{Context as _, Result};
use camino::Utf8Path;

use crate::check::{FileStatus, GameResult, GameStatus};
use crate::dat_parser::{DatFile, DatGame, DatHeader, DatRom};
use crate::fix::FixCounts;
use crate::hashes::HashType;
use crate::matcher::{MatchSource, Quality};
use crate::models::{Game, Status};
use crate::settings::Settings;

/// Per-run tallies printed at the end of a pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub games: u64,
    pub correct: u64,
    pub fixable: u64,
    pub partial: u64,
    pub missing: u64,
    pub old: u64,
}

impl Stats {
    pub fn add_game(&mut self, status: GameStatus) {
        self.games += 1;
        match status {
            GameStatus::Correct => self.correct += 1,
            GameStatus::Fixable => self.fixable += 1,
            GameStatus::Partial => self.partial += 1,
            GameStatus::Missing => self.missing += 1,
            GameStatus::Old => self.old += 1,
        }
    }
}

fn game_tag(status: GameStatus) -> &'static str {
    match status {
        GameStatus::Correct => "[FULL]",
        GameStatus::Fixable => "[FIX ]",
        GameStatus::Partial => "[PART]",
        GameStatus::Missing => "[MISS]",
        GameStatus::Old => "[OLD ]",
    }
}

fn should_report(settings: &Settings, result: &GameResult) -> bool {
    if !settings.report_warnings {
        // only unfixable problems
        return matches!(result.game, GameStatus::Missing | GameStatus::Partial);
    }
    match result.game {
        GameStatus::Correct | GameStatus::Old => settings.report_correct,
        GameStatus::Fixable => settings.report_fixable,
        GameStatus::Missing | GameStatus::Partial => settings.report_broken,
    }
}

/// One line per problem, prefixed by a short tag; quiet when the game is
/// filtered out by the warning flags.
pub fn print_game_result(settings: &Settings, game: &Game, result: &GameResult) {
    if !should_report(settings, result) {
        return;
    }

    println!("{} {}", game_tag(result.game), game.name);

    let expectations = game
        .roms
        .iter()
        .zip(result.roms.iter())
        .chain(game.disks.iter().zip(result.disks.iter()));

    for (expected, found) in expectations {
        match found.quality {
            Quality::Missing => {
                if expected.status == Status::NoDump && !settings.report_no_good_dumps {
                    continue;
                }
                println!("[MISS]   {}", expected.name);
            }
            Quality::HashErr => println!("[HASH]   {}", expected.name),
            Quality::NoHash => println!("[NOSM]   {} (no checksum to compare)", expected.name),
            Quality::Long => {
                let offset = found.offset.unwrap_or(0);
                println!("[LONG]   {} (correct data at offset {})", expected.name, offset);
            }
            Quality::NameErr => println!("[NAME]   {} (wrong name)", expected.name),
            Quality::Copied => match &found.source {
                MatchSource::Foreign { path, .. } => {
                    println!("[COPY]   {} (available in {})", expected.name, path);
                }
                _ => println!("[COPY]   {}", expected.name),
            },
            Quality::InZip => {
                println!("[INZP]   {} (should be in ancestor)", expected.name);
            }
            Quality::Old => {
                if settings.verbose {
                    println!("[OLD ]   {}", expected.name);
                }
            }
            Quality::Ok => {
                if settings.verbose {
                    println!("[OK  ]   {}", expected.name);
                }
            }
        }
    }

    for (index, status) in result.files.iter().enumerate() {
        let name = result
            .file_names
            .get(index)
            .map(String::as_str)
            .unwrap_or("?");
        match status {
            FileStatus::Unknown => println!("[UNKN]   {}", name),
            FileStatus::Broken => {
                if settings.report_broken {
                    println!("[BROK]   {}", name);
                }
            }
            FileStatus::Needed => println!("[NEED]   {} (needed elsewhere)", name),
            FileStatus::Superfluous => {
                if settings.report_superfluous {
                    println!("[SUPF]   {}", name);
                }
            }
            FileStatus::Duplicate => println!("[DUPL]   {}", name),
            FileStatus::Used | FileStatus::PartUsed => {}
        }
    }
}

pub fn print_superfluous(settings: &Settings, superfluous: &[camino::Utf8PathBuf]) {
    if !settings.report_superfluous {
        return;
    }
    for path in superfluous {
        println!("[SUPF] {}", path);
    }
}

pub fn print_summary(stats: &Stats, counts: &FixCounts, fixed: bool) {
    println!(
        "\nGames: {} total, {} correct, {} fixable, {} partial, {} missing{}",
        stats.games,
        stats.correct,
        stats.fixable,
        stats.partial,
        stats.missing,
        if stats.old > 0 {
            format!(", {} old", stats.old)
        } else {
            String::new()
        }
    );
    if fixed {
        println!(
            "Fixed: renamed {}, copied {}, sliced {}, moved {}, deleted {}",
            counts.renamed, counts.copied, counts.sliced, counts.moved, counts.deleted
        );
    }
}

/// Collects every missing rom and disk into a dat describing what a
/// complete set still needs.
#[derive(Clone, Debug, Default)]
pub struct Fixdat {
    games: Vec<DatGame>,
}

impl Fixdat {
    pub fn record(&mut self, game: &Game, result: &GameResult) {
        let mut entry = DatGame {
            name: game.name.clone(),
            description: Some(game.description.clone()),
            ..DatGame::default()
        };

        let expectations = game
            .roms
            .iter()
            .zip(result.roms.iter())
            .chain(game.disks.iter().zip(result.disks.iter()));
        for (expected, found) in expectations {
            if !matches!(found.quality, Quality::Missing | Quality::HashErr) {
                continue;
            }
            if expected.status == Status::NoDump {
                continue;
            }
            entry.roms.push(DatRom {
                name: expected.name.clone(),
                size: expected.size.known(),
                crc: expected.hashes.to_string(HashType::Crc),
                md5: expected.hashes.to_string(HashType::Md5),
                sha1: expected.hashes.to_string(HashType::Sha1),
                merge: None,
                status: None,
            });
        }

        if !entry.roms.is_empty() {
            self.games.push(entry);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    pub fn write(&self, path: &Utf8Path) -> Result<()> {
        let dat = DatFile {
            header: Some(DatHeader {
                name: Some("fixdat".to_owned()),
                description: Some("files missing from the checked set".to_owned()),
                version: None,
            }),
            games: self.games.clone(),
        };
        let xml = quick_xml::se::to_string_with_root("datafile", &dat)
            .context("cannot serialize fixdat")?;
        std::fs::write(path, format!("<?xml version=\"1.0\"?>\n{}\n", xml))
            .with_context(|| format!("cannot write fixdat '{}'", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashes::{hash_bytes, HashTypes};
    use crate::matcher::Match;
    use crate::models::{FileDesc, FileSize};

    #[test]
    fn fixdat_records_only_missing_files() {
        let game = Game {
            name: "pacman".to_owned(),
            roms: vec![
                FileDesc {
                    name: "have.bin".to_owned(),
                    size: FileSize::Known(4),
                    hashes: hash_bytes(b"have", HashTypes::ALL),
                    ..FileDesc::default()
                },
                FileDesc {
                    name: "lost.bin".to_owned(),
                    size: FileSize::Known(4),
                    hashes: hash_bytes(b"lost", HashTypes::ALL),
                    ..FileDesc::default()
                },
                FileDesc {
                    name: "undumped.bin".to_owned(),
                    status: Status::NoDump,
                    ..FileDesc::default()
                },
            ],
            ..Game::default()
        };
        let mut result = GameResult::new(&game, None);
        result.roms[0].quality = Quality::Ok;
        result.roms[1].quality = Quality::Missing;
        result.roms[2].quality = Quality::Missing;

        let mut fixdat = Fixdat::default();
        fixdat.record(&game, &result);
        assert_eq!(fixdat.games.len(), 1);
        assert_eq!(fixdat.games[0].roms.len(), 1);
        assert_eq!(fixdat.games[0].roms[0].name, "lost.bin");

        let clean = Match {
            quality: Quality::Ok,
            ..Match::default()
        };
        let mut all_ok = GameResult::new(&game, None);
        all_ok.roms = vec![clean.clone(), clean.clone(), clean];
        let mut empty = Fixdat::default();
        empty.record(&game, &all_ok);
        assert!(empty.is_empty());
    }

    #[test]
    fn stats_tally_by_status() {
        let mut stats = Stats::default();
        stats.add_game(GameStatus::Correct);
        stats.add_game(GameStatus::Correct);
        stats.add_game(GameStatus::Fixable);
        stats.add_game(GameStatus::Missing);
        assert_eq!(stats.games, 4);
        assert_eq!(stats.correct, 2);
        assert_eq!(stats.fixable, 1);
        assert_eq!(stats.missing, 1);
    }
}
