//! OVA packaging
//!
//! An OVA is a plain tar with the OVF descriptor as its first member.
//! Headers carry no timestamps or ownership so repacking the same files
//! yields the same bytes.

use crate::domain::model::ArchiveFormat;
use crate::error::{Error, Result};
use crate::pipeline::ovf::{OvfEnvelope, OVF_EXTENSION};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// What a secondary-storage directory currently holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    pub descriptor: Option<PathBuf>,
    pub archive: Option<PathBuf>,
}

/// Look for an OVF descriptor and an OVA archive directly inside `dir`
pub fn scan(dir: &Path) -> Result<ArchiveLayout> {
    Ok(ArchiveLayout {
        descriptor: first_match(dir, OVF_EXTENSION)?,
        archive: first_match(dir, ArchiveFormat::Ova.extension())?,
    })
}

fn first_match(dir: &Path, extension: &str) -> Result<Option<PathBuf>> {
    let dir = dir
        .to_str()
        .ok_or_else(|| Error::Validation(format!("non UTF-8 path {}", dir.display())))?;
    let pattern = format!("{}/*.{}", glob::Pattern::escape(dir), extension);
    let mut found: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| Error::Internal(format!("bad glob pattern {}: {}", pattern, e)))?
        .filter_map(|entry| entry.ok())
        .filter(|p| p.is_file())
        .collect();
    found.sort();
    Ok(found.into_iter().next())
}

fn base_name(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Validation(format!("no file name in {}", path.display())))
}

/// Archive members for a descriptor: the descriptor itself first, then the
/// files it references and its manifest, sorted by name
pub fn members_of(descriptor: &Path) -> Result<Vec<PathBuf>> {
    let dir = descriptor.parent().unwrap_or_else(|| Path::new("."));
    let envelope = OvfEnvelope::parse(&std::fs::read_to_string(descriptor)?)?;

    let mut rest: Vec<PathBuf> = envelope.files.iter().map(|f| dir.join(&f.href)).collect();
    let manifest = descriptor.with_extension("mf");
    if manifest.is_file() {
        rest.push(manifest);
    }
    for path in &rest {
        if !path.is_file() {
            return Err(Error::not_found("Archive member", path.display().to_string()));
        }
    }
    rest.sort();
    rest.dedup();

    let mut members = vec![descriptor.to_path_buf()];
    members.extend(rest);
    Ok(members)
}

/// Write `<base>.ova` next to the descriptor
pub fn pack(descriptor: &Path) -> Result<PathBuf> {
    let base = base_name(descriptor)?;
    let dir = descriptor.parent().unwrap_or_else(|| Path::new("."));
    let archive_path = dir.join(format!("{}.{}", base, ArchiveFormat::Ova.extension()));
    let members = members_of(descriptor)?;

    let mut builder = tar::Builder::new(File::create(&archive_path)?);
    for member in &members {
        let name = member
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Validation(format!("bad member name {}", member.display())))?;
        let file = File::open(member)?;
        let mut header = tar::Header::new_ustar();
        header.set_size(file.metadata()?.len());
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, name, file)?;
    }
    builder.into_inner()?.sync_all()?;

    info!("Packed {} member(s) into {}", members.len(), archive_path.display());
    Ok(archive_path)
}

/// Extract an archive into its directory and return the descriptor path
pub fn unpack(archive_path: &Path) -> Result<PathBuf> {
    let dir = archive_path.parent().unwrap_or_else(|| Path::new("."));
    let mut archive = tar::Archive::new(File::open(archive_path)?);

    let mut descriptor = None;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.into_owned();
        let file_name = name
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| Error::Validation(format!("bad member {}", name.display())))?;
        let target = dir.join(&file_name);
        entry.unpack(&target)?;
        debug!("Unpacked {}", target.display());

        if descriptor.is_none() && target.extension().and_then(|e| e.to_str()) == Some(OVF_EXTENSION) {
            descriptor = Some(target);
        }
    }

    descriptor.ok_or_else(|| Error::not_found("OVF descriptor in", archive_path.display().to_string()))
}

/// Member names in archive order
pub fn list_members(archive_path: &Path) -> Result<Vec<String>> {
    let mut archive = tar::Archive::new(File::open(archive_path)?);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        names.push(entry?.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Remove the unpacked descriptor and its members, keeping the archive
pub fn prune_unpacked(descriptor: &Path) -> Result<usize> {
    let members = members_of(descriptor)?;
    for member in &members {
        std::fs::remove_file(member)?;
    }
    Ok(members.len())
}
