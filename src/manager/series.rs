use super::probe::{ProbeRecord, Sample};
use crate::config::ProbeConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

pub const SERIES_WINDOW: usize = 30;

/// Sliding window of `(time, value)` samples for one probe index.
#[derive(Debug, Clone)]
pub struct IndexedSeries {
    capacity: usize,
    samples: VecDeque<(i32, f32)>,
    min: Option<f32>,
    max: Option<f32>,
}

impl IndexedSeries {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity),
            min: None,
            max: None,
        }
    }

    /// Append a sample, evicting the oldest one when the window is full.
    pub fn append(&mut self, time: i32, value: f32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((time, value));

        let values = self.samples.iter().map(|&(_, v)| v);
        self.min = values.clone().reduce(f32::min);
        self.max = values.reduce(f32::max);
    }

    pub fn min(&self) -> Option<f32> {
        self.min
    }

    pub fn max(&self) -> Option<f32> {
        self.max
    }

    pub fn last(&self) -> Option<(i32, f32)> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = (i32, f32)> + '_ {
        self.samples.iter().copied()
    }
}

impl Default for IndexedSeries {
    fn default() -> Self {
        Self::new(SERIES_WINDOW)
    }
}

#[derive(Debug, Clone)]
struct Probe {
    name: String,
    indexes: Vec<IndexedSeries>,
}

type ProbeKey = (String, u8);

/// Registered probes, keyed by component name and stat id.
///
/// Ids are 1-based on the wire; 0 addresses the first entry.
#[derive(Debug, Default)]
pub struct ProbeStore {
    probes: RwLock<HashMap<ProbeKey, Probe>>,
}

fn key(component: &str, stat_id: u8) -> ProbeKey {
    (component.to_ascii_uppercase(), stat_id.max(1))
}

impl ProbeStore {
    pub fn new(configs: &[ProbeConfig]) -> Self {
        let probes = configs
            .iter()
            .map(|c| {
                let probe = Probe {
                    name: c.name.clone(),
                    indexes: vec![IndexedSeries::default(); c.indexes.max(1) as usize],
                };
                (key(&c.component, c.stat_id), probe)
            })
            .collect();
        Self {
            probes: RwLock::new(probes),
        }
    }

    /// Route a decoded datagram into its series. Returns `false` when the
    /// component, stat or index is unknown.
    pub fn append(&self, record: &ProbeRecord) -> bool {
        let component = record.component.to_string();
        let mut probes = self.probes.write().unwrap_or_else(PoisonError::into_inner);
        let Some(probe) = probes.get_mut(&key(&component, record.stat_id)) else {
            debug!("{} stat {} is not a registered probe", component, record.stat_id);
            return false;
        };

        let mut push = |index: i32, time: i32, value: f32| -> bool {
            let slot = usize::try_from(index.max(1) - 1).ok();
            match slot.and_then(|i| probe.indexes.get_mut(i)) {
                Some(series) => {
                    series.append(time, value);
                    true
                }
                None => {
                    debug!(
                        "{} {} index {} outside [1, {}]",
                        component,
                        probe.name,
                        index,
                        probe.indexes.len()
                    );
                    false
                }
            }
        };

        match record.sample {
            Sample::Single { time, index, value } => push(index, time, value),
            Sample::Dual {
                time,
                value,
                value2,
            } => {
                let first = push(1, time, value);
                if first {
                    // Only probes declaring a second index keep the second value.
                    let _ = push(2, time, value2);
                }
                first
            }
        }
    }

    /// Copy of one series, `index` being 1-based.
    pub fn series(&self, component: &str, stat_id: u8, index: u32) -> Option<IndexedSeries> {
        let probes = self.probes.read().unwrap_or_else(PoisonError::into_inner);
        let probe = probes.get(&key(component, stat_id))?;
        let slot = index.max(1) as usize - 1;
        probe.indexes.get(slot).cloned()
    }

    pub fn probe_name(&self, component: &str, stat_id: u8) -> Option<String> {
        let probes = self.probes.read().unwrap_or_else(PoisonError::into_inner);
        probes.get(&key(component, stat_id)).map(|p| p.name.clone())
    }

    pub fn len(&self) -> usize {
        self.probes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
