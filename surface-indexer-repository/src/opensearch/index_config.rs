//! Index generation naming.
//!
//! Every rebuild loads a fresh physical index named `<alias>_v<N>`; readers
//! always go through the alias, which is moved to the new generation once it is
//! complete.

/// Configuration for the search index generations behind one alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    /// The alias name readers query.
    pub alias: String,
}

impl IndexConfig {
    /// Create a new index configuration.
    ///
    /// # Arguments
    ///
    /// * `alias` - The index alias name
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
        }
    }

    /// Get the versioned index name.
    ///
    /// # Returns
    ///
    /// The versioned index name (e.g., "transactions_v3")
    pub fn generation_name(&self, version: u32) -> String {
        format!("{}_v{}", self.alias, version)
    }

    /// Wildcard pattern matching every generation of the alias.
    pub fn generation_pattern(&self) -> String {
        format!("{}_v*", self.alias)
    }

    /// The version of a generation name, or `None` for unrelated indices.
    pub fn parse_version(&self, index: &str) -> Option<u32> {
        index
            .strip_prefix(self.alias.as_str())?
            .strip_prefix("_v")?
            .parse()
            .ok()
    }

    /// The version the next generation should use: one above the highest existing.
    pub fn next_version<'a>(&self, existing: impl IntoIterator<Item = &'a String>) -> u32 {
        existing
            .into_iter()
            .filter_map(|index| self.parse_version(index))
            .max()
            .map_or(1, |max| max + 1)
    }

    /// Name of a filtered alias (`<alias>-<suffix>`).
    pub fn filtered_alias(&self, suffix: &str) -> String {
        format!("{}-{}", self.alias, suffix)
    }
}
