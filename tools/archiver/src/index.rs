//! The package index: a flat JSON manifest of every file an archive
//! contains, written as `index.json` inside the tarball alongside the
//! payload files themselves.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub path: String,
    pub size: u64,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Index {
    pub entries: Vec<IndexEntry>,
}
