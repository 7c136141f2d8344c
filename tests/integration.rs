//! Integration tests for merge and sync pipelines.

use std::cell::RefCell;
use std::rc::Rc;
use tributary::{
    CloseMode, Item, MergeOpts, Source, State, StreamMerge, StreamSync, Subscribable,
    SubscribableExt, Subscriber, Subscription, SyncOpts, Transform, Tuple,
};

type Log<T> = Rc<RefCell<Vec<T>>>;

fn input(id: &str) -> Subscription<Item<i32>> {
    Subscription::named(id)
}

fn record<T: Clone + 'static, S: Subscribable<T>>(stream: &S) -> (Subscription<T>, Log<T>) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    let sub = stream.subscribe(Subscriber::new(move |v| sink.borrow_mut().push(v)));
    (sub, log)
}

fn tuple(pairs: &[(&str, i32)]) -> Tuple<i32> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// --- Sync Tuple Semantics ---

#[test]
fn test_sync_retains_stale_values() {
    init_tracing();
    let (a, b) = (input("a"), input("b"));
    let sync =
        StreamSync::with_sources(SyncOpts::default(), [a.clone().into(), b.clone().into()])
            .unwrap();
    let (_sub, log) = record(&sync);

    a.next(Item::Value(1));
    b.next(Item::Value(2));
    a.next(Item::Value(3));
    b.next(Item::Value(4));

    assert_eq!(
        *log.borrow(),
        vec![
            tuple(&[("a", 1), ("b", 2)]),
            tuple(&[("a", 3), ("b", 2)]),
            tuple(&[("a", 3), ("b", 4)]),
        ]
    );
}

#[test]
fn test_sync_reset_withholds_until_all_refresh() {
    let (a, b) = (input("a"), input("b"));
    let sync = StreamSync::with_sources(
        SyncOpts::default().reset(true),
        [a.clone().into(), b.clone().into()],
    )
    .unwrap();
    let (_sub, log) = record(&sync);

    a.next(Item::Value(1));
    b.next(Item::Value(2));
    a.next(Item::Value(3));
    assert_eq!(log.borrow().len(), 1);

    b.next(Item::Value(4));
    assert_eq!(log.borrow().last(), Some(&tuple(&[("a", 3), ("b", 4)])));
}

#[test]
fn test_sync_merge_only_emits_partial_tuples() {
    let (a, b) = (input("a"), input("b"));
    let sync = StreamSync::with_sources(
        SyncOpts::default().merge_only(true),
        [a.clone().into(), b.clone().into()],
    )
    .unwrap();
    let (_sub, log) = record(&sync);

    a.next(Item::Value(1));
    b.next(Item::Value(2));
    assert_eq!(
        *log.borrow(),
        vec![tuple(&[("a", 1)]), tuple(&[("a", 1), ("b", 2)])]
    );
}

#[test]
fn test_sync_back_pressure_zips_in_order() {
    let (a, b) = (input("a"), input("b"));
    let sync = StreamSync::with_sources(
        SyncOpts::default().back_pressure(4),
        [a.clone().into(), b.clone().into()],
    )
    .unwrap();
    let (_sub, log) = record(&sync);

    a.next(Item::Value(1));
    a.next(Item::Value(2));
    b.next(Item::Value(10));
    b.next(Item::Value(20));

    assert_eq!(
        *log.borrow(),
        vec![tuple(&[("a", 1), ("b", 10)]), tuple(&[("a", 2), ("b", 20)])]
    );
}

#[test]
fn test_sync_partial_flush_when_not_all() {
    let (a, b) = (input("a"), input("b"));
    let sync = StreamSync::with_sources(
        SyncOpts::default().all(false),
        [a.clone().into(), b.clone().into()],
    )
    .unwrap();
    let (_sub, log) = record(&sync);

    a.next(Item::Value(1));
    a.done();
    assert_eq!(log.borrow().len(), 0);

    b.next(Item::Value(2));
    b.done();
    assert_eq!(*log.borrow(), vec![tuple(&[("b", 2)])]);
    assert_eq!(sync.state(), State::Done);
}

// --- Merge Closing Policies ---

#[test]
fn test_merge_last_finishes_with_final_source() {
    let inputs: Vec<_> = (0..4).map(|i| input(&format!("s{i}"))).collect();
    let merge = StreamMerge::with_sources(
        MergeOpts::default(),
        inputs.iter().map(|s| Source::from(s.clone())),
    )
    .unwrap();
    let (sub, _) = record(&merge);

    for s in &inputs[..3] {
        s.done();
        assert_eq!(merge.state(), State::Active);
        assert!(!sub.state().is_terminal());
    }
    inputs[3].done();
    assert_eq!(merge.state(), State::Done);
    assert_eq!(sub.state(), State::Done);
}

#[test]
fn test_merge_first_finishes_immediately() {
    let (a, b) = (input("a"), input("b"));
    let merge = StreamMerge::with_sources(
        MergeOpts::default().close(CloseMode::First),
        [a.clone().into(), b.clone().into()],
    )
    .unwrap();
    let (_sub, log) = record(&merge);

    b.next(Item::Value(1));
    b.done();
    assert_eq!(merge.state(), State::Done);

    a.next(Item::Value(2));
    assert_eq!(*log.borrow(), vec![1]);
}

#[test]
fn test_merge_never_outlives_inputs() {
    let a = input("a");
    let merge =
        StreamMerge::with_sources(MergeOpts::default().close(CloseMode::Never), [a.clone().into()])
            .unwrap();
    a.done();
    assert_eq!(merge.source_count(), 0);
    assert!(!merge.state().is_terminal());

    let c = input("c");
    merge.add(c.clone().into()).unwrap();
    let (_sub, log) = record(&merge);
    c.next(Item::Value(9));
    assert_eq!(*log.borrow(), vec![9]);
}

// --- Dynamic Flattening ---

#[test]
fn test_merge_flattens_emitted_sources() {
    let outer = input("outer");
    let merge = StreamMerge::with_sources(MergeOpts::default(), [outer.clone().into()]).unwrap();
    let (_sub, log) = record(&merge);

    let inner = input("inner");
    outer.next(Item::Source(inner.clone().into()));
    assert!(log.borrow().is_empty());
    assert_eq!(merge.source_count(), 2);

    inner.next(Item::Value(5));
    outer.next(Item::Value(6));
    assert_eq!(*log.borrow(), vec![5, 6]);
}

#[test]
fn test_sync_flattens_emitted_sources() {
    let outer = input("outer");
    let sync = StreamSync::with_sources(SyncOpts::default(), [outer.clone().into()]).unwrap();
    let (_sub, log) = record(&sync);

    let inner = input("inner");
    outer.next(Item::Source(inner.clone().into()));
    assert_eq!(sync.labels(), vec!["outer".to_string(), "inner".to_string()]);
    assert!(log.borrow().is_empty());

    outer.next(Item::Value(1));
    inner.next(Item::Value(2));
    assert_eq!(*log.borrow(), vec![tuple(&[("inner", 2), ("outer", 1)])]);
}

// --- Composition ---

#[test]
fn test_sync_of_merges_via_lift() {
    let (a, b, c) = (input("a"), input("b"), input("c"));
    let left =
        StreamMerge::with_sources(MergeOpts::id("left"), [a.clone().into(), b.clone().into()])
            .unwrap();
    let sync = StreamSync::new(SyncOpts::default()).unwrap();
    sync.add(left.lift()).unwrap();
    sync.add_as(c.clone().into(), "right").unwrap();
    let (_sub, log) = record(&sync);

    a.next(Item::Value(1));
    c.next(Item::Value(2));
    b.next(Item::Value(3));

    let labels = sync.labels();
    assert_eq!(labels.len(), 2);
    let left_label = labels[0].clone();
    let expected: Vec<Tuple<i32>> = vec![
        [(left_label.clone(), 1), ("right".to_string(), 2)].into_iter().collect(),
        [(left_label, 3), ("right".to_string(), 2)].into_iter().collect(),
    ];
    assert_eq!(*log.borrow(), expected);
}

#[test]
fn test_inner_merge_lives_on_inside_sync() {
    let (a, b, c) = (input("a"), input("b"), input("c"));
    let sync = StreamSync::new(SyncOpts::default()).unwrap();
    {
        let left =
            StreamMerge::with_sources(MergeOpts::id("left"), [a.clone().into(), b.clone().into()])
                .unwrap();
        sync.add_as(left.lift(), "left").unwrap();
    }
    sync.add_as(c.clone().into(), "right").unwrap();
    let (_sub, log) = record(&sync);

    b.next(Item::Value(1));
    c.next(Item::Value(2));
    assert_eq!(*log.borrow(), vec![tuple(&[("left", 1), ("right", 2)])]);

    sync.unsubscribe();
    assert_eq!(a.subscriber_count(), 0);
    assert_eq!(b.subscriber_count(), 0);
    assert_eq!(c.subscriber_count(), 0);
}

#[test]
fn test_parsed_lines_feed_merge() {
    let lines = Subscription::<String>::named("lines");
    let numbers =
        lines.transform(Transform::filter_map(|line: String| line.trim().parse::<i32>().ok()));
    let merge = StreamMerge::new(MergeOpts::default());
    merge.add(numbers.lift()).unwrap();
    let (_sub, log) = record(&merge);

    for line in ["1", "two", " 3 ", ""] {
        lines.next(line.to_string());
    }
    assert_eq!(*log.borrow(), vec![1, 3]);
}

#[test]
fn test_transform_pipeline_feeds_merge() {
    let raw = Subscription::<i32>::named("raw");
    let evens = raw.transform(
        Transform::filter(|x: &i32| x % 2 == 0).then(Transform::map(|x: i32| x * 10)),
    );
    let merge = StreamMerge::new(MergeOpts::default());
    merge.add(evens.lift()).unwrap();
    let (_sub, log) = record(&merge);

    for x in 1..=5 {
        raw.next(x);
    }
    assert_eq!(*log.borrow(), vec![20, 40]);
}

#[test]
fn test_partition_flushes_on_done() {
    let raw = Subscription::<i32>::named("raw");
    let batches = raw.transform(Transform::partition(2, true));
    let (sub, log) = record(&batches);

    for x in 1..=5 {
        raw.next(x);
    }
    raw.done();
    assert_eq!(*log.borrow(), vec![vec![1, 2], vec![3, 4], vec![5]]);
    assert_eq!(sub.state(), State::Done);
}

// --- Membership & Aliasing ---

#[test]
fn test_sync_alias_remove_and_lookup() {
    let (a, b) = (input("a"), input("b"));
    let sync = StreamSync::with_labeled_sources(
        SyncOpts::default(),
        [("left", Source::from(a.clone())), ("right", Source::from(b.clone()))],
    )
    .unwrap();

    let sources = sync.sources();
    assert_eq!(sources.keys().collect::<Vec<_>>(), vec!["left", "right"]);
    assert_eq!(sources["left"].id(), "a");

    assert!(sync.remove(&Source::from(a.clone())));
    assert!(!sync.remove(&Source::from(a.clone())));
    assert!(!sync.remove_by_id("a"));
    assert!(sync.remove_by_id("right"));
    assert_eq!(sync.source_count(), 0);
    assert!(sync.is_consistent());
    assert_eq!(a.subscriber_count(), 0);
}

#[test]
fn test_removed_source_stops_contributing() {
    let (a, b) = (input("a"), input("b"));
    let merge =
        StreamMerge::with_sources(MergeOpts::default(), [a.clone().into(), b.clone().into()])
            .unwrap();
    let (_sub, log) = record(&merge);

    assert!(merge.remove_by_id("a"));
    a.next(Item::Value(1));
    b.next(Item::Value(2));
    assert_eq!(*log.borrow(), vec![2]);
}

#[test]
fn test_last_subscriber_leaving_tears_down_merge() {
    let a = input("a");
    let merge = StreamMerge::with_sources(MergeOpts::default(), [a.clone().into()]).unwrap();
    let (sub, _) = record(&merge);

    assert!(sub.unsubscribe());
    assert_eq!(merge.state(), State::Done);
    assert_eq!(merge.source_count(), 0);
    assert_eq!(a.subscriber_count(), 0);
}

// --- Unsubscribe ---

#[test]
fn test_unsubscribe_twice_notifies_once() {
    let done_calls = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&done_calls);
    let a = input("a");
    let sync = StreamSync::with_sources(SyncOpts::default(), [a.clone().into()]).unwrap();
    let _sub = sync.subscribe(Subscriber::empty().on_done(move || *counter.borrow_mut() += 1));

    a.done();
    assert_eq!(sync.state(), State::Done);
    assert_eq!(*done_calls.borrow(), 1);

    assert!(sync.unsubscribe());
    assert!(!sync.unsubscribe());
    assert_eq!(*done_calls.borrow(), 1);
    assert_eq!(sync.state(), State::Done);
}

#[test]
fn test_unsubscribe_releases_inputs_silently() {
    let (a, b) = (input("a"), input("b"));
    let merge =
        StreamMerge::with_sources(MergeOpts::default(), [a.clone().into(), b.clone().into()])
            .unwrap();
    let (_sub, log) = record(&merge);

    assert!(merge.unsubscribe());
    assert_eq!(merge.state(), State::Done);
    assert_eq!(a.subscriber_count(), 0);
    assert_eq!(b.subscriber_count(), 0);

    a.next(Item::Value(1));
    assert!(log.borrow().is_empty());
    assert!(!merge.unsubscribe());
}

// --- Configuration ---

#[test]
fn test_sync_opts_from_json() {
    let opts = SyncOpts::from_json(r#"{"id": "joined", "reset": true, "all": false}"#).unwrap();
    let (a, b) = (input("a"), input("b"));
    let sync = StreamSync::with_sources(opts, [a.clone().into(), b.clone().into()]).unwrap();
    assert_eq!(sync.id(), "joined");
    assert!(sync.config().reset);
    assert!(!sync.config().all);
}

#[test]
fn test_merge_opts_from_json() {
    let opts: MergeOpts = serde_json::from_str(r#"{"close": "never"}"#).unwrap();
    assert_eq!(opts.close, CloseMode::Never);
    assert!(opts.id.is_none());
    let merge: StreamMerge<i32> = StreamMerge::new(opts);
    assert!(merge.id().starts_with("streammerge-"));
}
