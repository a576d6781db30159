//! Contributor categories

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Neighbourhood subdivision a contributor belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Kategori1,
    Kategori2,
    Kategori3,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Kategori1, Category::Kategori2, Category::Kategori3];

    /// Stored form of the category
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Kategori1 => "kategori1",
            Category::Kategori2 => "kategori2",
            Category::Kategori3 => "kategori3",
        }
    }

    /// Display label shown to users
    pub fn label(&self) -> &'static str {
        match self {
            Category::Kategori1 => "RT Tengah",
            Category::Kategori2 => "RT Kulon",
            Category::Kategori3 => "RT Kidul",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown category: {0}")]
pub struct ParseCategoryError(pub String);

impl FromStr for Category {
    type Err = ParseCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kategori1" => Ok(Category::Kategori1),
            "kategori2" => Ok(Category::Kategori2),
            "kategori3" => Ok(Category::Kategori3),
            other => Err(ParseCategoryError(other.to_string())),
        }
    }
}
