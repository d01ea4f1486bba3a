//! Slow-data store.
//!
//! Slow (EPICS-like) values arrive as SlowUpdate transitions, far less often
//! than events. Transitions reach every destination, so each consumer keeps
//! its own store, fed from the events it handles, and asks "what was the
//! latest value at this event's time".

use crate::dgram::{Dgram, Timestamp, TransitionId};
use crate::error::{EbError, EbResult};
use crate::event::Event;

/// SlowUpdate datagrams of every source ordered by timestamp.
#[derive(Debug, Default, Clone)]
pub struct EnvStore {
    sources: Vec<Vec<Dgram>>,
}

impl EnvStore {
    /// Store for `n_sources` sources. It grows if an event carries more.
    #[must_use]
    pub fn new(n_sources: usize) -> Self {
        Self {
            sources: vec![Vec::new(); n_sources],
        }
    }

    /// Number of sources.
    #[must_use]
    pub fn n_sources(&self) -> usize {
        self.sources.len()
    }

    /// Number of datagrams stored for `source`.
    #[must_use]
    pub fn len(&self, source: usize) -> usize {
        self.sources.get(source).map_or(0, Vec::len)
    }

    /// Nothing stored at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.iter().all(Vec::is_empty)
    }

    /// Store the SlowUpdate datagrams of `event`. Returns how many were new.
    ///
    /// A datagram already stored for its timestamp is skipped. One stamped
    /// before the latest stored value of its source is a format error.
    pub fn observe(&mut self, event: &Event) -> EbResult<usize> {
        if event.dgrams().iter().flatten().all(|d| d.service() != TransitionId::SlowUpdate) {
            return Ok(0);
        }
        if self.sources.len() < event.dgrams().len() {
            self.sources.resize(event.dgrams().len(), Vec::new());
        }

        let mut added = 0;
        for (source, d) in event.dgrams().iter().enumerate() {
            let Some(d) = d.as_ref().filter(|d| d.service() == TransitionId::SlowUpdate) else {
                continue;
            };
            let stored = &mut self.sources[source];
            match stored.last().map(Dgram::timestamp) {
                Some(last) if last == d.timestamp() => continue,
                Some(last) if last > d.timestamp() => {
                    return Err(EbError::format(format!(
                        "slow datagram at {} after {last} in source {source}",
                        d.timestamp()
                    )));
                }
                _ => {}
            }
            stored.push(d.clone());
            added += 1;
        }
        Ok(added)
    }

    /// Latest datagram of `source` at or before `ts`.
    #[must_use]
    pub fn lookup(&self, source: usize, ts: Timestamp) -> Option<&Dgram> {
        let dgrams = self.sources.get(source)?;
        let pos = dgrams.partition_point(|d| d.timestamp() <= ts);
        pos.checked_sub(1).map(|i| &dgrams[i])
    }

    /// Per source, the latest datagram at or before the event.
    #[must_use]
    pub fn checkout(&self, event: &Event) -> Vec<Option<&Dgram>> {
        (0..self.sources.len())
            .map(|s| self.lookup(s, event.timestamp()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dgram(sec: u32, service: TransitionId) -> Dgram {
        Dgram::from_bytes(Dgram::encode(Timestamp::from_parts(sec, 0), service, 0, b"pv")).unwrap()
    }

    fn event(sec: u32, slots: Vec<Option<TransitionId>>) -> Event {
        let dgrams = slots.into_iter().map(|s| s.map(|s| dgram(sec, s))).collect();
        Event::new(Timestamp::from_parts(sec, 0), dgrams).unwrap()
    }

    #[test]
    fn test_lookup_latest_before() {
        use TransitionId::SlowUpdate;
        let mut store = EnvStore::new(1);
        store.observe(&event(10, vec![Some(SlowUpdate)])).unwrap();
        store.observe(&event(20, vec![Some(SlowUpdate)])).unwrap();

        assert!(store.lookup(0, Timestamp::from_parts(5, 0)).is_none());
        assert_eq!(
            store.lookup(0, Timestamp::from_parts(10, 0)).unwrap().timestamp(),
            Timestamp::from_parts(10, 0)
        );
        assert_eq!(
            store.lookup(0, Timestamp::from_parts(99, 0)).unwrap().timestamp(),
            Timestamp::from_parts(20, 0)
        );
    }

    #[test]
    fn test_only_slow_updates_stored() {
        use TransitionId::*;
        let mut store = EnvStore::new(0);
        assert_eq!(store.observe(&event(1, vec![Some(L1Accept), None])).unwrap(), 0);
        assert_eq!(store.observe(&event(2, vec![None, Some(SlowUpdate)])).unwrap(), 1);
        assert_eq!(store.n_sources(), 2);
        assert_eq!(store.len(0), 0);
        assert_eq!(store.len(1), 1);

        let later = event(5, vec![Some(L1Accept), Some(L1Accept)]);
        let slots = store.checkout(&later);
        assert!(slots[0].is_none());
        assert_eq!(slots[1].unwrap().timestamp(), Timestamp::from_parts(2, 0));
    }

    #[test]
    fn test_repeated_and_backwards_updates() {
        use TransitionId::SlowUpdate;
        let mut store = EnvStore::new(1);
        store.observe(&event(4, vec![Some(SlowUpdate)])).unwrap();
        assert_eq!(store.observe(&event(4, vec![Some(SlowUpdate)])).unwrap(), 0);
        assert!(matches!(
            store.observe(&event(3, vec![Some(SlowUpdate)])),
            Err(EbError::Format(_))
        ));
        assert_eq!(store.len(0), 1);
    }
}
