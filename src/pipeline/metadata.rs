//! Sidecar metadata written next to a packaged archive
//!
//! `template.properties` and `<name>.ova.meta` are flat `key=value` files
//! read back by later import and restore steps.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Contents of `template.properties`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateProperties {
    /// Archive file name, `<uniquename>.ova`
    pub filename: String,
    /// Physical size of the disk data in bytes
    pub size: u64,
    pub id: u64,
    pub unique_name: String,
    pub virtual_size: u64,
    /// Size of the archive file in bytes
    pub ova_size: u64,
}

impl TemplateProperties {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "filename={}", self.filename);
        let _ = writeln!(out, "size={}", self.size);
        let _ = writeln!(out, "id={}", self.id);
        let _ = writeln!(out, "ova=true");
        let _ = writeln!(out, "uniquename={}", self.unique_name);
        let _ = writeln!(out, "virtualsize={}", self.virtual_size);
        let _ = writeln!(out, "ova.size={}", self.ova_size);
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let map = parse_key_values(text);
        Ok(Self {
            filename: string(&map, "filename")?,
            size: number(&map, "size")?,
            id: number(&map, "id")?,
            unique_name: string(&map, "uniquename")?,
            virtual_size: number(&map, "virtualsize")?,
            ova_size: map
                .get("ova.size")
                .map(|v| parse_u64("ova.size", v))
                .transpose()?
                .unwrap_or(0),
        })
    }
}

/// One disk listed in the `.ova.meta` manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaDisk {
    pub name: String,
    pub size: u64,
}

/// Contents of `<name>.ova.meta`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvaMeta {
    pub ova_filename: String,
    pub version: String,
    pub ovf: String,
    pub disks: Vec<MetaDisk>,
}

impl OvaMeta {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "ova.filename={}", self.ova_filename);
        let _ = writeln!(out, "version={}", self.version);
        let _ = writeln!(out, "ovf={}", self.ovf);
        let _ = writeln!(out, "numDisks={}", self.disks.len());
        for (i, disk) in self.disks.iter().enumerate() {
            let _ = writeln!(out, "disk{}.name={}", i + 1, disk.name);
            let _ = writeln!(out, "disk{}.size={}", i + 1, disk.size);
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let map = parse_key_values(text);
        let count: usize = number(&map, "numDisks")? as usize;
        let disks = (1..=count)
            .map(|i| {
                Ok(MetaDisk {
                    name: string(&map, &format!("disk{}.name", i))?,
                    size: number(&map, &format!("disk{}.size", i))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            ova_filename: string(&map, "ova.filename")?,
            version: string(&map, "version")?,
            ovf: string(&map, "ovf")?,
            disks,
        })
    }
}

/// `key=value` lines; blank lines and `#` comments are skipped
pub fn parse_key_values(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn string(map: &BTreeMap<String, String>, key: &str) -> Result<String> {
    map.get(key)
        .cloned()
        .ok_or_else(|| Error::DescriptorParse(format!("missing key '{}'", key)))
}

fn number(map: &BTreeMap<String, String>, key: &str) -> Result<u64> {
    parse_u64(key, &string(map, key)?)
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::DescriptorParse(format!("'{}' is not a number: {}", key, value)))
}
