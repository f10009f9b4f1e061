use std::{fs::File, io::BufReader};

use anyhow::{Context as _, Result};
use camino::Utf8Path;
use quick_xml::de::from_reader;
use serde::{Deserialize, Serialize};

use crate::models::{DatEntry, FileDesc, FileSize, Game, Status};

/// A dat file in the logical-xml format: a header plus one entry per game.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DatFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<DatHeader>,
    #[serde(rename = "game", default)]
    pub games: Vec<DatGame>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DatHeader {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DatGame {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@cloneof", skip_serializing_if = "Option::is_none")]
    pub cloneof: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "rom", default, skip_serializing_if = "Vec::is_empty")]
    pub roms: Vec<DatRom>,
    #[serde(rename = "disk", default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DatDisk>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DatRom {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@size", skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(rename = "@crc", skip_serializing_if = "Option::is_none")]
    pub crc: Option<String>,
    #[serde(rename = "@md5", skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(rename = "@sha1", skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(rename = "@merge", skip_serializing_if = "Option::is_none")]
    pub merge: Option<String>,
    #[serde(rename = "@status", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DatDisk {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@md5", skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(rename = "@sha1", skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(rename = "@merge", skip_serializing_if = "Option::is_none")]
    pub merge: Option<String>,
    #[serde(rename = "@status", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

pub fn parse_file(path: &Utf8Path) -> Result<DatFile> {
    let file = File::open(path).with_context(|| format!("cannot open dat file '{}'", path))?;
    let data: DatFile = from_reader(BufReader::new(file))
        .with_context(|| format!("cannot parse dat file '{}'", path))?;
    Ok(data)
}

impl DatFile {
    pub fn dat_entry(&self) -> DatEntry {
        let header = self.header.clone().unwrap_or_default();
        DatEntry {
            name: header.name.unwrap_or_default(),
            description: header.description.unwrap_or_default(),
            version: header.version.unwrap_or_default(),
        }
    }
}

fn parse_status(status: Option<&str>) -> Status {
    status
        .and_then(|status| status.parse().ok())
        .unwrap_or_default()
}

fn parse_hashes(
    crc: Option<&str>,
    md5: Option<&str>,
    sha1: Option<&str>,
) -> Result<crate::hashes::Hashes> {
    let mut hashes = crate::hashes::Hashes::default();
    for value in [crc, md5, sha1].into_iter().flatten() {
        if value.is_empty() || value == "-" {
            continue;
        }
        hashes.set_from_str(value)?;
    }
    Ok(hashes)
}

impl DatGame {
    /// Convert to a catalog game; parent wiring happens in a later pass.
    pub fn into_game(self, dat_idx: i64) -> Result<Game> {
        let mut game = Game {
            id: 0,
            name: self.name,
            description: self.description.unwrap_or_default(),
            dat_idx,
            cloneof: [self.cloneof, None],
            roms: Vec::with_capacity(self.roms.len()),
            disks: Vec::with_capacity(self.disks.len()),
        };

        for rom in self.roms {
            let status = parse_status(rom.status.as_deref());
            let hashes = if status == Status::NoDump {
                crate::hashes::Hashes::default()
            } else {
                parse_hashes(rom.crc.as_deref(), rom.md5.as_deref(), rom.sha1.as_deref())
                    .with_context(|| format!("bad hash on rom '{}'", rom.name))?
            };
            game.roms.push(FileDesc {
                name: rom.name,
                merge: rom.merge,
                size: match rom.size {
                    Some(size) => FileSize::Known(size),
                    None => FileSize::Unknown,
                },
                hashes,
                status,
                ..FileDesc::default()
            });
        }

        for disk in self.disks {
            let status = parse_status(disk.status.as_deref());
            let hashes = if status == Status::NoDump {
                crate::hashes::Hashes::default()
            } else {
                parse_hashes(None, disk.md5.as_deref(), disk.sha1.as_deref())
                    .with_context(|| format!("bad hash on disk '{}'", disk.name))?
            };
            game.disks.push(FileDesc {
                name: disk.name,
                merge: disk.merge,
                size: FileSize::Unknown,
                hashes,
                status,
                ..FileDesc::default()
            });
        }

        Ok(game)
    }
}
