use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use roiflow_core::{Buffer, NdArray, Roi, Value};
use roiflow_graph::Graph;
use roiflow_operators::{OpArrayPiper, OpTrackSlotVersion, OpValuePiper};
use roiflow_scheduler::Scheduler;

fn volume(seed: u8) -> Buffer {
    NdArray::<u8>::from_fn(&[10, 12, 13, 2], |i| {
        let mix = (i[0] * 1_000 + i[1] * 100 + i[2] * 10 + i[3]) as u32;
        ((mix.wrapping_mul(2_654_435_761) >> 24) as u8) ^ seed
    })
    .into()
}

#[test]
fn array_piper_passes_data_and_dirtiness_through() {
    let scheduler = Scheduler::with_workers(2).unwrap();
    let graph = Graph::new(&scheduler);
    let first = graph.add_operator(OpArrayPiper);
    let second = graph.add_operator(OpArrayPiper);
    second
        .input("Input")
        .unwrap()
        .connect(&first.output("Output").unwrap())
        .unwrap();
    let data = volume(1);
    first.input("Input").unwrap().set_value(data.clone()).unwrap();

    let out = second.output("Output").unwrap();
    assert_eq!(out.meta().unwrap().axistags.unwrap().to_string(), "zyxc");
    let full = Roi::full(&[10, 12, 13, 2]);
    assert_eq!(out.get(full).wait().unwrap(), data);

    out.take_dirty_regions().unwrap();
    let stale = Roi::new(vec![1, 2, 3, 0], vec![4, 5, 6, 2]).unwrap();
    first.input("Input").unwrap().set_dirty(stale.clone()).unwrap();
    assert_eq!(out.dirty_regions(), vec![stale]);
    scheduler.stop();
}

#[test]
fn version_counts_dirty_notifications() {
    let scheduler = Scheduler::with_workers(2).unwrap();
    let graph = Graph::new(&scheduler);
    let source = graph.add_operator(OpArrayPiper);
    let tracker = graph.add_operator(OpTrackSlotVersion);
    let version = tracker.output("Version").unwrap();

    let data = volume(7);
    source.input("Input").unwrap().set_value(data.clone()).unwrap();
    // Connected after the data arrived: nothing has gone stale yet.
    tracker
        .input("Input")
        .unwrap()
        .connect(&source.output("Output").unwrap())
        .unwrap();
    assert_eq!(version.value(), Some(Value::Int(0)));

    let output = tracker
        .output("Output")
        .unwrap()
        .get(Roi::full(&[10, 12, 13, 2]))
        .wait()
        .unwrap();
    assert_eq!(output, data);

    for expected in 1..=10 {
        source.input("Input").unwrap().set_dirty_all().unwrap();
        assert_eq!(version.value(), Some(Value::Int(expected)));
    }

    // Reconfiguration resets the count, then the new data is one change.
    let replacement = volume(8);
    assert_ne!(replacement, data);
    source.input("Input").unwrap().set_value(replacement).unwrap();
    assert_eq!(version.value(), Some(Value::Int(1)));
}

#[test]
fn version_changes_notify_listeners() {
    let scheduler = Scheduler::with_workers(1).unwrap();
    let graph = Graph::new(&scheduler);
    let tracker = graph.add_operator(OpTrackSlotVersion);
    tracker.input("Input").unwrap().set_value(volume(3)).unwrap();

    let version = tracker.output("Version").unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    version
        .subscribe_dirty(move |slot, roi| {
            assert_eq!(roi.rank(), 0);
            assert!(slot.value().is_some());
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    tracker.input("Input").unwrap().set_dirty_all().unwrap();
    tracker.input("Input").unwrap().set_dirty_all().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(version.value(), Some(Value::Int(3)));
    scheduler.stop();
}

#[test]
fn value_piper_publishes_every_kind_of_value() {
    let scheduler = Scheduler::with_workers(1).unwrap();
    let graph = Graph::new(&scheduler);
    let pipe = graph.add_operator(OpValuePiper::new());
    let input = pipe.input("Input").unwrap();
    let output = pipe.output("Output").unwrap();
    assert_eq!(output.value(), None);

    let values = [
        Value::from("Somestring"),
        Value::from(1i64),
        Value::from("Different string"),
        Value::from(true),
        Value::Shape(vec![3, 4]),
        Value::from(volume(5)),
    ];
    for value in values {
        input.set_value(value.clone()).unwrap();
        assert_eq!(output.value(), Some(value));
    }
    scheduler.stop();
}

#[test]
fn value_piper_chain_follows_reconfiguration() {
    let scheduler = Scheduler::with_workers(1).unwrap();
    let graph = Graph::new(&scheduler);
    let first = graph.add_operator(OpValuePiper::new());
    let second = graph.add_operator(OpValuePiper::new());
    first.input("Input").unwrap().set_value(2.5).unwrap();
    second
        .input("Input")
        .unwrap()
        .connect(&first.output("Output").unwrap())
        .unwrap();
    let out = second.output("Output").unwrap();
    assert_eq!(out.value(), Some(Value::Float(2.5)));

    let dirty = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dirty);
    out.subscribe_dirty(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    first.input("Input").unwrap().set_value("changed").unwrap();
    assert_eq!(out.value(), Some(Value::from("changed")));
    // The new value arrives through reconfiguration, not as dirtiness.
    assert_eq!(dirty.load(Ordering::SeqCst), 0);
    scheduler.stop();
}

#[test]
fn value_piper_extra_inputs_dirty_the_whole_output() {
    let scheduler = Scheduler::with_workers(1).unwrap();
    let graph = Graph::new(&scheduler);
    let pipe = graph.add_operator(OpValuePiper::new().with_extra_input("Sigma"));
    pipe.input("Input").unwrap().set_value(1i64).unwrap();
    let out = pipe.output("Output").unwrap();

    let dirty = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dirty);
    out.subscribe_dirty(move |_, roi| {
        assert_eq!(*roi, Roi::full(&[]));
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    pipe.input("Sigma").unwrap().set_value(0.7).unwrap();
    assert_eq!(dirty.load(Ordering::SeqCst), 1);
    pipe.input("Input").unwrap().set_dirty_all().unwrap();
    assert_eq!(dirty.load(Ordering::SeqCst), 1);
    scheduler.stop();
}
