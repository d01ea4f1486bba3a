//! Event building scenarios
//!
//! # Test Coverage
//!
//! - Two sources with gaps, batch size 3
//! - Empty chunks terminate without yielding
//! - Output bytes bounded by input bytes with transitions and several
//!   destinations
//! - Per-destination time ordering with a destination function
//! - Transitions bypass the filter and the selected timestamps
//! - `max_events` across chunks
//! - Late destinations receive the full transition history

mod common;

use bytes::Bytes;
use common::{l1, stream};
use smd_eb::events::Events;
use smd_eb::{
    DestId, DsParms, EbError, Event, EventBuilder, EventBuilderManager, PacketFooter, SmdChunk, StepHistory, Timestamp,
    TransitionId,
};

fn seconds(data: &Bytes) -> Vec<u32> {
    Events::from_batch(data)
        .unwrap()
        .map(|e| e.timestamp().seconds())
        .collect()
}

#[test]
fn test_two_sources_batch_size_three() {
    let views = [l1(&[1, 2, 3, 4, 5]), l1(&[1, 3, 5])];
    let parms = DsParms::default().with_batch_size(3);
    let mut eb = EventBuilder::new(&views, 2).unwrap();

    let first = eb.build(&parms, parms.batch_size).unwrap();
    assert_eq!(first.nevents, 3);
    let batch = &first.batches[&0];
    assert_eq!(seconds(&batch.data), vec![1, 2, 3]);

    let events: Vec<Event> = Events::from_batch(&batch.data).unwrap().collect();
    assert!(events[0].dgram(1).is_some());
    assert!(events[1].dgram(1).is_none());
    assert_eq!(first.min_ts, Some(Timestamp::from_parts(1, 0)));
    assert_eq!(first.max_ts, Some(Timestamp::from_parts(3, 0)));

    let second = eb.build(&parms, parms.batch_size).unwrap();
    assert_eq!(seconds(&second.batches[&0].data), vec![4, 5]);
    assert!(eb.build(&parms, parms.batch_size).unwrap().is_done());
}

#[test]
fn test_empty_chunk_yields_nothing() {
    let parms = DsParms::default();
    let chunk = SmdChunk::new(vec![Bytes::new(), Bytes::new()]);
    let mut manager = EventBuilderManager::new(&chunk, &parms, 0).unwrap();
    assert_eq!(manager.batches().count(), 0);
}

fn payload(batch: &smd_eb::Batch) -> usize {
    let footer = PacketFooter::parse(&batch.data).unwrap();
    batch.size() - footer.footer_size()
}

#[test]
fn test_output_bounded_by_input() {
    use TransitionId::*;
    let a = [(1, BeginRun), (2, BeginStep), (3, L1Accept), (4, L1Accept), (5, SlowUpdate), (6, L1Accept), (7, EndStep)];
    let b = [(1, BeginRun), (2, BeginStep), (4, L1Accept), (6, L1Accept), (7, EndStep), (8, L1Accept)];
    let views = vec![stream(&a), stream(&b)];
    let input: usize = views.iter().map(Bytes::len).sum();
    let chunk = SmdChunk::new(views);
    let parms = DsParms::default()
        .with_batch_size(2)
        .with_workers(3)
        .with_destination(|e: &Event| Ok((e.timestamp().seconds() % 3) as DestId));

    let mut manager = EventBuilderManager::new(&chunk, &parms, 0).unwrap();
    let (mut output, mut nsteps) = (0, 0);
    for out in manager.batches() {
        let out = out.unwrap();
        output += out.batches.values().map(payload).sum::<usize>();
        output += out.steps.as_ref().map_or(0, payload);
        nsteps += out.nsteps;
    }
    assert_eq!(nsteps, 5);
    assert_eq!(output, input);
}

#[test]
fn test_destinations_keep_time_order() {
    use TransitionId::*;
    let mut items = vec![(1, Configure), (2, BeginRun)];
    items.extend((3..40).map(|s| (s, L1Accept)));
    let chunk = SmdChunk::new(vec![stream(&items), stream(&items)]);
    let parms = DsParms::default()
        .with_batch_size(5)
        .with_workers(3)
        .with_destination(|e: &Event| Ok((e.timestamp().seconds() % 3) as DestId));

    let mut per_dest: Vec<Vec<u32>> = vec![Vec::new(); 3];
    let mut manager = EventBuilderManager::new(&chunk, &parms, 0).unwrap();
    for out in manager.batches() {
        let out = out.unwrap();
        for (dest, secs) in per_dest.iter_mut().enumerate() {
            if let Some(batch) = out.delivery(dest).unwrap() {
                secs.extend(seconds(&batch.data));
            }
        }
    }
    for (dest, secs) in per_dest.iter().enumerate() {
        assert!(secs.windows(2).all(|w| w[0] < w[1]), "dest {dest} out of order: {secs:?}");
        // both transitions reach every destination before its data
        assert_eq!(&secs[..2], &[1, 2]);
        assert!(secs[2..].iter().all(|s| s % 3 == dest as u32));
    }
}

#[test]
fn test_destination_out_of_range_is_error() {
    let chunk = SmdChunk::new(vec![l1(&[1])]);
    let parms = DsParms::default().with_workers(2).with_destination(|_: &Event| Ok(7));
    let mut manager = EventBuilderManager::new(&chunk, &parms, 0).unwrap();
    assert!(matches!(manager.batches().next(), Some(Err(EbError::Destination(_)))));
    assert!(manager.batches().next().is_none());
}

#[test]
fn test_transitions_bypass_filter_and_selection() {
    use TransitionId::*;
    let chunk = SmdChunk::new(vec![stream(&[
        (1, BeginRun),
        (2, L1Accept),
        (3, L1Accept),
        (4, L1Accept),
        (5, BeginStep),
        (6, L1Accept),
    ])]);
    let parms = DsParms::default()
        .with_filter(|e: &Event| e.timestamp().seconds() != 3)
        .with_timestamps([2, 3, 6].map(|s| Timestamp::from_parts(s, 0)));

    let mut manager = EventBuilderManager::new(&chunk, &parms, 0).unwrap();
    let out = manager.batches().next().unwrap().unwrap();
    assert_eq!(seconds(&out.batches[&0].data), vec![2, 6]);
    assert_eq!(seconds(&out.delivery(0).unwrap().unwrap().data), vec![1, 2, 5, 6]);
    assert_eq!(out.nevents, 2);
    assert_eq!(out.nsteps, 2);
    assert_eq!(out.nfiltered, 1);
    assert_eq!(seconds(&out.steps.unwrap().data), vec![1, 5]);
}

#[test]
fn test_max_events_across_chunks() {
    let parms = DsParms::default().with_batch_size(4).with_max_events(6);
    let first = SmdChunk::new(vec![l1(&[1, 2, 3, 4, 5])]);
    let second = SmdChunk::new(vec![l1(&[6, 7, 8, 9])]);

    let mut manager = EventBuilderManager::new(&first, &parms, 0).unwrap();
    let built: usize = manager.batches().map(|o| o.unwrap().nevents).sum();
    assert_eq!(built, 5);

    let mut manager = EventBuilderManager::new(&second, &parms, manager.accepted()).unwrap();
    let outs: Vec<_> = manager.batches().map(Result::unwrap).collect();
    assert_eq!(outs.len(), 1);
    assert_eq!(seconds(&outs[0].batches[&0].data), vec![6]);
    assert!(manager.limit_reached());
}

#[test]
fn test_late_destination_gets_every_transition() {
    use TransitionId::*;
    let mut history = StepHistory::new(2);
    let configure = stream(&[(1, Configure)]);
    let begin_run = stream(&[(2, BeginRun)]);
    history
        .extend_buffers(&[configure.clone(), configure.clone()], 0, false)
        .unwrap();
    history
        .extend_buffers(&[begin_run.clone(), begin_run.clone()], 1, false)
        .unwrap();

    // destination 0 saw Configure only, destination 5 saw nothing
    let missing = history.get_buffer(0);
    assert_eq!(missing, vec![begin_run.clone(), begin_run.clone()]);
    let late = history.get_buffer(5);
    assert_eq!(seconds(&PacketFooter::pack(&late)), vec![1, 2]);
    assert!(history.get_buffer(5).iter().all(Bytes::is_empty));
    assert_eq!(history.pending(1), 1);
}
