//! Datastore file paths
//!
//! Paths follow the hypervisor's `[datastoreName] relative/path` grammar.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Extension of every virtual disk descriptor
pub const DISK_EXTENSION: &str = "vmdk";

/// A file or folder location on a datastore
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatastorePath {
    datastore: String,
    relative: String,
}

impl DatastorePath {
    pub fn new(datastore: impl Into<String>, relative: impl Into<String>) -> Self {
        let relative: String = relative.into();
        Self {
            datastore: datastore.into(),
            relative: relative.trim_matches('/').to_string(),
        }
    }

    /// Root of a datastore
    pub fn root(datastore: impl Into<String>) -> Self {
        Self::new(datastore, "")
    }

    pub fn datastore(&self) -> &str {
        &self.datastore
    }

    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// Final path component
    pub fn file_name(&self) -> &str {
        self.relative.rsplit('/').next().unwrap_or("")
    }

    /// Folder holding this path, `None` at datastore root
    pub fn parent(&self) -> Option<DatastorePath> {
        if self.relative.is_empty() {
            return None;
        }
        let parent = match self.relative.rfind('/') {
            Some(idx) => &self.relative[..idx],
            None => "",
        };
        Some(DatastorePath::new(self.datastore.clone(), parent))
    }

    /// Folder component directly under the root, if the file is nested
    pub fn top_folder(&self) -> Option<&str> {
        self.relative.split_once('/').map(|(folder, _)| folder)
    }

    pub fn is_root(&self) -> bool {
        self.relative.is_empty()
    }

    pub fn join(&self, child: &str) -> DatastorePath {
        if self.relative.is_empty() {
            DatastorePath::new(self.datastore.clone(), child)
        } else {
            DatastorePath::new(self.datastore.clone(), format!("{}/{}", self.relative, child))
        }
    }

    /// Disk base name for a `.vmdk` descriptor path (`vm/disk.vmdk` -> `disk`)
    pub fn disk_base_name(&self) -> Option<&str> {
        self.file_name()
            .strip_suffix(DISK_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
    }
}

impl fmt::Display for DatastorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.relative.is_empty() {
            write!(f, "[{}]", self.datastore)
        } else {
            write!(f, "[{}] {}", self.datastore, self.relative)
        }
    }
}

impl FromStr for DatastorePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let rest = s
            .strip_prefix('[')
            .ok_or_else(|| Error::PathParse(format!("missing '[': {}", s)))?;
        let (datastore, relative) = rest
            .split_once(']')
            .ok_or_else(|| Error::PathParse(format!("missing ']': {}", s)))?;
        if datastore.is_empty() {
            return Err(Error::PathParse(format!("empty datastore name: {}", s)));
        }
        Ok(DatastorePath::new(datastore, relative.trim()))
    }
}

impl TryFrom<String> for DatastorePath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DatastorePath> for String {
    fn from(path: DatastorePath) -> Self {
        path.to_string()
    }
}
