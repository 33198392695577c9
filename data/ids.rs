use ahash::{AHashMap, AHashSet};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// How a (FID, IID) pair is turned into the single key used to join inputs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdForm {
    /// `{FID}_{IID}`, joined with an underscore.
    #[default]
    Combined,
    /// The IID alone.
    IidOnly,
}

impl IdForm {
    pub fn key(self, fid: &str, iid: &str) -> String {
        match self {
            Self::Combined => format!("{fid}_{iid}"),
            Self::IidOnly => iid.to_string(),
        }
    }
}

/// The frozen canonical order of retained samples: sorted ids and their positions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SampleIndex {
    ids: Vec<String>,
    positions: AHashMap<String, usize>,
}

impl SampleIndex {
    /// Builds an index from any id list; duplicates collapse and the order is lexicographic.
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids
            .into_iter()
            .map(Into::into)
            .sorted()
            .dedup()
            .collect();
        let positions = ids
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.clone(), idx))
            .collect();
        Self { ids, positions }
    }

    /// The ids present in every one of `sets`, sorted.
    pub fn intersect<'a, I>(sets: I) -> Self
    where
        I: IntoIterator<Item = &'a [String]>,
    {
        let mut sets = sets.into_iter();
        let Some(first) = sets.next() else {
            return Self::default();
        };
        let mut common: AHashSet<&str> = first.iter().map(String::as_str).collect();
        for set in sets {
            let present: AHashSet<&str> = set.iter().map(String::as_str).collect();
            common.retain(|id| present.contains(id));
        }
        Self::from_ids(common)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        self.ids.iter().map(String::as_str).enumerate()
    }

    /// For every canonical sample, the row of `source_ids` holding it.
    /// Returns `None` if any canonical id is absent from `source_ids`.
    pub fn gather_rows(&self, source_ids: &[String]) -> Option<Vec<usize>> {
        let lookup: AHashMap<&str, usize> = source_ids
            .iter()
            .enumerate()
            .map(|(row, id)| (id.as_str(), row))
            .collect();
        self.ids
            .iter()
            .map(|id| lookup.get(id.as_str()).copied())
            .collect()
    }
}
