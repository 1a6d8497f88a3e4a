//! OVF descriptor codec
//!
//! Only the parts the pipeline needs: the file references and the disk
//! section with its capacities.

use crate::error::{Error, Result};
use std::fmt::Write as _;

pub const OVF_EXTENSION: &str = "ovf";

const STREAM_OPTIMIZED: &str = "http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvfFile {
    pub id: String,
    pub href: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvfDisk {
    pub disk_id: String,
    pub file_ref: String,
    pub capacity: u64,
    /// e.g. `byte`, `byte * 2^20`
    pub allocation_units: String,
}

impl OvfDisk {
    /// Build a disk entry in the coarsest unit that represents `bytes` exactly
    pub fn with_capacity(disk_id: &str, file_ref: &str, bytes: u64) -> Self {
        let shift = [30u32, 20, 10]
            .into_iter()
            .find(|s| bytes != 0 && bytes % (1u64 << s) == 0);
        let (capacity, allocation_units) = match shift {
            Some(s) => (bytes >> s, format!("byte * 2^{}", s)),
            None => (bytes, "byte".to_string()),
        };
        Self {
            disk_id: disk_id.to_string(),
            file_ref: file_ref.to_string(),
            capacity,
            allocation_units,
        }
    }

    pub fn capacity_bytes(&self) -> Result<u64> {
        let multiplier = allocation_multiplier(&self.allocation_units)?;
        self.capacity
            .checked_mul(multiplier)
            .ok_or_else(|| Error::DescriptorParse(format!("capacity of {} overflows", self.disk_id)))
    }
}

/// Multiplier for an `ovf:capacityAllocationUnits` value
pub fn allocation_multiplier(units: &str) -> Result<u64> {
    let units = units.trim();
    if units.is_empty() || units == "byte" {
        return Ok(1);
    }
    units
        .strip_prefix("byte")
        .map(str::trim)
        .and_then(|s| s.strip_prefix('*'))
        .map(str::trim)
        .and_then(|s| s.strip_prefix("2^"))
        .and_then(|exp| exp.trim().parse::<u32>().ok())
        .and_then(|exp| 1u64.checked_shl(exp))
        .ok_or_else(|| Error::DescriptorParse(format!("unsupported allocation units '{}'", units)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OvfEnvelope {
    pub name: String,
    pub files: Vec<OvfFile>,
    pub disks: Vec<OvfDisk>,
}

impl OvfEnvelope {
    pub fn parse(xml: &str) -> Result<Self> {
        let mut envelope = OvfEnvelope::default();

        for element in xml.split('<').skip(1) {
            if let Some(attrs) = element.strip_prefix("File ") {
                envelope.files.push(OvfFile {
                    id: required(attrs, "ovf:id")?,
                    href: required(attrs, "ovf:href")?,
                    size: attribute(attrs, "ovf:size")
                        .map(|s| parse_number(s, "ovf:size"))
                        .transpose()?
                        .unwrap_or(0),
                });
            } else if let Some(attrs) = element.strip_prefix("Disk ") {
                envelope.disks.push(OvfDisk {
                    disk_id: required(attrs, "ovf:diskId")?,
                    file_ref: attribute(attrs, "ovf:fileRef").unwrap_or_default().to_string(),
                    capacity: parse_number(&required(attrs, "ovf:capacity")?, "ovf:capacity")?,
                    allocation_units: attribute(attrs, "ovf:capacityAllocationUnits")
                        .unwrap_or("byte")
                        .to_string(),
                });
            } else if let Some(text) = element.strip_prefix("Name>") {
                if envelope.name.is_empty() {
                    envelope.name = text.trim().to_string();
                }
            }
        }

        if envelope.disks.is_empty() {
            return Err(Error::DescriptorParse("descriptor declares no disks".into()));
        }
        Ok(envelope)
    }

    pub fn render(&self) -> String {
        let mut xml = String::new();
        let _ = writeln!(xml, r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        let _ = writeln!(
            xml,
            r#"<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1" xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1">"#
        );
        let _ = writeln!(xml, "  <References>");
        for file in &self.files {
            let _ = writeln!(
                xml,
                r#"    <File ovf:href="{}" ovf:id="{}" ovf:size="{}"/>"#,
                file.href, file.id, file.size
            );
        }
        let _ = writeln!(xml, "  </References>");
        let _ = writeln!(xml, "  <DiskSection>");
        let _ = writeln!(xml, "    <Info>Virtual disk information</Info>");
        for disk in &self.disks {
            let _ = writeln!(
                xml,
                r#"    <Disk ovf:capacity="{}" ovf:capacityAllocationUnits="{}" ovf:diskId="{}" ovf:fileRef="{}" ovf:format="{}"/>"#,
                disk.capacity, disk.allocation_units, disk.disk_id, disk.file_ref, STREAM_OPTIMIZED
            );
        }
        let _ = writeln!(xml, "  </DiskSection>");
        let _ = writeln!(xml, r#"  <VirtualSystem ovf:id="{}">"#, self.name);
        let _ = writeln!(xml, "    <Name>{}</Name>", self.name);
        let _ = writeln!(xml, "  </VirtualSystem>");
        let _ = writeln!(xml, "</Envelope>");
        xml
    }

    pub fn file(&self, id: &str) -> Option<&OvfFile> {
        self.files.iter().find(|f| f.id == id)
    }

    /// Sum of every disk's declared capacity
    pub fn virtual_size(&self) -> Result<u64> {
        self.disks
            .iter()
            .try_fold(0u64, |acc, d| Ok(acc.saturating_add(d.capacity_bytes()?)))
    }
}

fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{}=\"", name);
    let start = attrs.find(&needle)? + needle.len();
    let len = attrs[start..].find('"')?;
    Some(&attrs[start..start + len])
}

fn required(attrs: &str, name: &str) -> Result<String> {
    attribute(attrs, name)
        .map(str::to_string)
        .ok_or_else(|| Error::DescriptorParse(format!("missing {}", name)))
}

fn parse_number(value: &str, name: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::DescriptorParse(format!("{} is not a number: {}", name, value)))
}
