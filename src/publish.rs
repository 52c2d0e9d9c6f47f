//! Version-tagged handoff of a flow between tasks.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::key::Key;
use crate::usage::UseId;

/// Options for [`Context::publish`](crate::Context::publish).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    pub version: Key,
    /// Number of fetches after which the publication is released.
    pub readers: usize,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            version: Key::empty(),
            readers: 1,
        }
    }
}

impl PublishOptions {
    pub fn version(mut self, version: impl Into<Key>) -> Self {
        self.version = version.into();
        self
    }

    pub fn readers(mut self, readers: usize) -> Self {
        self.readers = readers;
        self
    }
}

/// What the backend learns about a publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicationDetails {
    pub version: Key,
    pub readers: usize,
}

#[derive(Debug)]
enum Entry {
    /// Fetches arrived before the publication.
    Awaited { fetches: usize },
    Live {
        publication: UseId,
        readers: usize,
        fetches: usize,
    },
    Exhausted { readers: usize, fetches: usize },
}

/// What a fetch means for the publication it targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Nothing is published yet, the fetch waits.
    Pending,
    /// The publication still expects more readers.
    Counted,
    /// This was the last expected reader, the publication can be released.
    Last(UseId),
}

/// Reader-count bookkeeping for every `(key, version)` pair of a run.
#[derive(Debug, Default)]
pub struct PublicationTable {
    entries: HashMap<(Key, Key), Entry>,
}

impl PublicationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a publication. Returns the use to release right away when the
    /// awaited fetches already used up every reader.
    pub fn publish(
        &mut self,
        key: &Key,
        version: &Key,
        publication: UseId,
        readers: usize,
    ) -> Result<Option<UseId>> {
        if readers == 0 {
            return Err(FlowError::InvalidReaderCount { key: key.clone() });
        }

        let slot = (key.clone(), version.clone());
        let fetches = match self.entries.get(&slot) {
            None => 0,
            Some(Entry::Awaited { fetches }) => *fetches,
            Some(Entry::Live { .. } | Entry::Exhausted { .. }) => {
                return Err(FlowError::DuplicatePublication {
                    key: key.clone(),
                    version: version.clone(),
                });
            }
        };

        if fetches > readers {
            return Err(FlowError::ReaderCountExceeded {
                key: key.clone(),
                version: version.clone(),
                readers,
                fetches,
            });
        }

        if fetches == readers {
            self.entries.insert(slot, Entry::Exhausted { readers, fetches });
            Ok(Some(publication))
        } else {
            self.entries.insert(
                slot,
                Entry::Live {
                    publication,
                    readers,
                    fetches,
                },
            );
            Ok(None)
        }
    }

    pub fn fetch(&mut self, key: &Key, version: &Key) -> Result<FetchOutcome> {
        let slot = (key.clone(), version.clone());
        let entry = self
            .entries
            .entry(slot)
            .or_insert(Entry::Awaited { fetches: 0 });

        let (next, outcome) = match &*entry {
            Entry::Awaited { fetches } => (
                Entry::Awaited {
                    fetches: fetches + 1,
                },
                FetchOutcome::Pending,
            ),
            Entry::Live {
                publication,
                readers,
                fetches,
            } => {
                let fetches = fetches + 1;
                if fetches < *readers {
                    let live = Entry::Live {
                        publication: *publication,
                        readers: *readers,
                        fetches,
                    };
                    (live, FetchOutcome::Counted)
                } else {
                    let exhausted = Entry::Exhausted {
                        readers: *readers,
                        fetches,
                    };
                    (exhausted, FetchOutcome::Last(*publication))
                }
            }
            Entry::Exhausted { readers, fetches } => {
                return Err(FlowError::ReaderCountExceeded {
                    key: key.clone(),
                    version: version.clone(),
                    readers: *readers,
                    fetches: fetches + 1,
                });
            }
        };

        *entry = next;
        Ok(outcome)
    }

    /// The first fetch still waiting for a publication.
    pub fn first_unresolved(&self) -> Option<(&Key, &Key)> {
        let mut unresolved: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Awaited { .. }))
            .map(|((key, version), _)| (key, version))
            .collect();
        unresolved.sort();
        unresolved.into_iter().next()
    }

    /// The first publication that was fetched fewer times than announced,
    /// as `(key, version, readers, fetches)`.
    pub fn first_underfetched(&self) -> Option<(&Key, &Key, usize, usize)> {
        let mut live: Vec<_> = self
            .entries
            .iter()
            .filter_map(|((key, version), entry)| match entry {
                Entry::Live {
                    readers, fetches, ..
                } => Some((key, version, *readers, *fetches)),
                _ => None,
            })
            .collect();
        live.sort();
        live.into_iter().next()
    }

    /// Publications still waiting for readers.
    pub fn live(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry, Entry::Live { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key;
    use crate::usage::{UseArena, UseKind, UseRecord};

    fn some_use() -> UseId {
        use crate::flow::FlowId;
        use crate::handle::VarId;
        use crate::permissions::PermissionPair;

        let mut arena = UseArena::new();
        arena.insert(UseRecord::new(
            key!("h"),
            VarId(0),
            (FlowId(0), FlowId(0)),
            PermissionPair::default(),
            UseKind::Handle,
            "i32",
        ))
    }

    #[test]
    fn test_exact_reader_count() {
        let mut table = PublicationTable::new();
        let (h, v) = (key!("h"), key!("v", 0));
        let publication = some_use();

        assert_eq!(table.publish(&h, &v, publication, 2).unwrap(), None);
        assert_eq!(table.fetch(&h, &v).unwrap(), FetchOutcome::Counted);
        assert_eq!(table.first_underfetched(), Some((&h, &v, 2, 1)));
        assert_eq!(
            table.fetch(&h, &v).unwrap(),
            FetchOutcome::Last(publication)
        );
        assert!(matches!(
            table.fetch(&h, &v),
            Err(FlowError::ReaderCountExceeded { fetches: 3, .. })
        ));
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn test_fetch_before_publish() {
        let mut table = PublicationTable::new();
        let (h, v) = (key!("h"), key!("v", 1));

        assert_eq!(table.fetch(&h, &v).unwrap(), FetchOutcome::Pending);
        assert_eq!(table.first_unresolved(), Some((&h, &v)));

        let publication = some_use();
        assert_eq!(
            table.publish(&h, &v, publication, 1).unwrap(),
            Some(publication)
        );
        assert_eq!(table.first_unresolved(), None);
    }

    #[test]
    fn test_too_many_early_fetches() {
        let mut table = PublicationTable::new();
        let (h, v) = (key!("h"), Key::empty());
        table.fetch(&h, &v).unwrap();
        table.fetch(&h, &v).unwrap();

        assert!(matches!(
            table.publish(&h, &v, some_use(), 1),
            Err(FlowError::ReaderCountExceeded { .. })
        ));
    }

    #[test]
    fn test_rejects_duplicates_and_zero_readers() {
        let mut table = PublicationTable::new();
        let h = key!("h");
        assert!(matches!(
            table.publish(&h, &Key::empty(), some_use(), 0),
            Err(FlowError::InvalidReaderCount { .. })
        ));
        table.publish(&h, &Key::empty(), some_use(), 1).unwrap();
        assert!(matches!(
            table.publish(&h, &Key::empty(), some_use(), 1),
            Err(FlowError::DuplicatePublication { .. })
        ));
    }

    #[test]
    fn test_options_defaults() {
        let options = PublishOptions::default();
        assert!(options.version.is_empty());
        assert_eq!(options.readers, 1);

        let options: PublishOptions = serde_json::from_str(r#"{"readers": 3}"#).unwrap();
        assert_eq!(options.readers, 3);
    }
}
