//! Decode step at the control-plane boundary: runtime watcher notifications
//! become one typed change record with an explicit phase.

use std::collections::HashMap;

use kube::runtime::watcher::Event;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangePhase {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ResourceChange<K> {
    pub phase: ChangePhase,
    pub object: K,
}

impl<K> ResourceChange<K> {
    pub fn new(phase: ChangePhase, object: K) -> Self {
        Self { phase, object }
    }
}

/// Tracks objects seen on one stream so applied notifications can be split
/// into Added/Modified and a re-list can surface missed deletions.
pub struct ChangeDecoder<K> {
    seen: HashMap<String, K>,
}

impl<K> Default for ChangeDecoder<K> {
    fn default() -> Self {
        Self { seen: HashMap::new() }
    }
}

fn key<K: Resource>(obj: &K) -> String {
    obj.uid().unwrap_or_else(|| obj.name_any())
}

impl<K: Resource + Clone> ChangeDecoder<K> {
    pub fn decode(&mut self, event: Event<K>) -> Vec<ResourceChange<K>> {
        match event {
            Event::Applied(obj) => vec![self.applied(obj)],
            Event::Deleted(obj) => {
                self.seen.remove(&key(&obj));
                vec![ResourceChange::new(ChangePhase::Deleted, obj)]
            }
            Event::Restarted(list) => {
                let live: Vec<String> = list.iter().map(key).collect();
                let mut vanished: Vec<String> = self.seen.keys().filter(|k| !live.contains(k)).cloned().collect();
                vanished.sort();
                let mut out: Vec<ResourceChange<K>> = vanished
                    .into_iter()
                    .filter_map(|k| self.seen.remove(&k))
                    .map(|obj| ResourceChange::new(ChangePhase::Deleted, obj))
                    .collect();
                out.extend(list.into_iter().map(|obj| self.applied(obj)));
                out
            }
        }
    }

    fn applied(&mut self, obj: K) -> ResourceChange<K> {
        let phase = match self.seen.insert(key(&obj), obj.clone()) {
            Some(_) => ChangePhase::Modified,
            None => ChangePhase::Added,
        };
        ResourceChange::new(phase, obj)
    }
}
