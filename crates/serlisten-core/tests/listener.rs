use parking_lot::Mutex;
use serlisten_core::{
    write_chunks, CallbackRegistry, EntryId, Listener, ListenerEvent, ListenerState,
    MemoryChannel,
};
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Log = Arc<Mutex<Vec<String>>>;

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn tagged(log: &Log, tag: &'static str) -> impl FnMut(u8) + Send + 'static {
    let log = log.clone();
    move |byte| log.lock().push(format!("{tag}:{}", byte as char))
}

#[test]
fn drains_bytes_then_stops_quietly() {
    let registry = Arc::new(CallbackRegistry::new());
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        registry.register(move |b| received.lock().push(b)).unwrap();
    }

    let channel = Arc::new(MemoryChannel::new());
    channel.feed(b"abc");

    let listener = Listener::new(registry);
    let handle = listener.start(channel.clone()).unwrap();
    assert!(wait_until(|| received.lock().len() == 3));
    assert_eq!(*received.lock(), b"abc");

    let started = Instant::now();
    handle.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(listener.state(), ListenerState::Stopped);

    channel.feed(b"def");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(*received.lock(), b"abc");
    assert_eq!(channel.pending(), 3);
}

#[test]
fn handlers_run_in_registration_order() {
    let registry = Arc::new(CallbackRegistry::new());
    let log = Log::default();
    registry.register(tagged(&log, "A")).unwrap();
    registry.register(tagged(&log, "B")).unwrap();

    let channel = Arc::new(MemoryChannel::new());
    let listener = Listener::new(registry);
    listener.start(channel.clone()).unwrap();

    channel.feed(b"x");
    assert!(wait_until(|| log.lock().len() == 2));
    listener.stop().unwrap();

    assert_eq!(*log.lock(), vec!["A:x", "B:x"]);
}

#[test]
fn unregistered_handler_is_not_called() {
    let registry = Arc::new(CallbackRegistry::new());
    let log = Log::default();
    let a = registry.register(tagged(&log, "A")).unwrap();
    registry.register(tagged(&log, "B")).unwrap();
    assert!(registry.unregister(a));

    let channel = Arc::new(MemoryChannel::new());
    let listener = Listener::new(registry.clone());
    listener.start(channel.clone()).unwrap();

    channel.feed(b"y");
    assert!(wait_until(|| !log.lock().is_empty()));
    listener.stop().unwrap();

    assert_eq!(*log.lock(), vec!["B:y"]);
    assert!(!registry.unregister(a));
    assert_eq!(registry.len(), 1);
}

#[test]
fn bytes_of_one_burst_arrive_in_order() {
    let registry = Arc::new(CallbackRegistry::new());
    let log = Log::default();
    registry.register(tagged(&log, "A")).unwrap();
    registry.register(tagged(&log, "B")).unwrap();

    let channel = Arc::new(MemoryChannel::new());
    let listener = Listener::new(registry);
    listener.start(channel.clone()).unwrap();
    channel.feed(b"12");
    assert!(wait_until(|| log.lock().len() == 4));
    listener.stop().unwrap();

    assert_eq!(*log.lock(), vec!["A:1", "B:1", "A:2", "B:2"]);
}

#[test]
fn concurrent_registration_loses_nothing() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 10;
    const BYTES: u8 = 200;

    let registry = Arc::new(CallbackRegistry::new());
    let dispatched = Arc::new(AtomicUsize::new(0));
    {
        let dispatched = dispatched.clone();
        registry
            .register(move |_| {
                dispatched.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    let channel = Arc::new(MemoryChannel::new());
    let listener = Listener::new(registry.clone());
    listener.start(channel.clone()).unwrap();

    let feeder = {
        let channel = channel.clone();
        thread::spawn(move || {
            for byte in 0..BYTES {
                channel.feed(&[byte]);
                thread::sleep(Duration::from_micros(200));
            }
        })
    };

    let registrars: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || {
                (0..PER_THREAD)
                    .map(|_| {
                        let seen = Arc::new(Mutex::new(Vec::new()));
                        let sink = seen.clone();
                        let id = registry.register(move |b| sink.lock().push(b)).unwrap();
                        (id, seen)
                    })
                    .collect::<Vec<(EntryId, Arc<Mutex<Vec<u8>>>)>>()
            })
        })
        .collect();

    let entries: Vec<_> = registrars
        .into_iter()
        .flat_map(|t| t.join().unwrap())
        .collect();
    feeder.join().unwrap();
    assert!(wait_until(|| dispatched.load(Ordering::SeqCst) == BYTES as usize));

    // every handler is registered by now, so all of them see this one
    channel.feed(&[BYTES]);
    assert!(wait_until(|| dispatched.load(Ordering::SeqCst) == BYTES as usize + 1));
    listener.stop().unwrap();

    assert_eq!(registry.len(), THREADS * PER_THREAD + 1);
    let ids: HashSet<EntryId> = registry.ids().into_iter().collect();
    assert_eq!(ids.len(), THREADS * PER_THREAD + 1);

    for (id, seen) in &entries {
        assert!(ids.contains(id));
        let seen = seen.lock();
        assert_eq!(seen.last(), Some(&BYTES), "handler {id} missed the final byte");
        assert!(
            seen.windows(2).all(|w| w[1] == w[0] + 1),
            "handler {id} skipped bytes: {seen:?}"
        );
    }
}

#[test]
fn no_calls_after_unregister_returns() {
    let registry = Arc::new(CallbackRegistry::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let id = {
        let calls = calls.clone();
        registry
            .register(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    };

    let channel = Arc::new(MemoryChannel::new());
    let listener = Listener::new(registry.clone());
    listener.start(channel.clone()).unwrap();

    channel.feed(&[0; 64]);
    assert!(registry.unregister(id));
    let after = calls.load(Ordering::SeqCst);

    channel.feed(&[1; 64]);
    assert!(wait_until(|| channel.pending() == 0));
    listener.stop().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), after);
}

#[test]
fn failed_run_leaves_registry_reusable() {
    let registry = Arc::new(CallbackRegistry::new());
    let log = Log::default();
    registry.register(tagged(&log, "A")).unwrap();

    let listener = Listener::new(registry);
    let events = listener.events();

    let broken = Arc::new(MemoryChannel::new());
    let handle = listener.start(broken.clone()).unwrap();
    broken.fail_next_read(io::ErrorKind::BrokenPipe);
    assert!(handle.wait().is_err());
    assert_eq!(listener.state(), ListenerState::Stopped);

    let repaired = Arc::new(MemoryChannel::new());
    let handle = listener.start(repaired.clone()).unwrap();
    repaired.feed(b"k");
    assert!(wait_until(|| log.lock().len() == 1));
    handle.stop().unwrap();

    assert_eq!(*log.lock(), vec!["A:k"]);
    let seen: Vec<_> = events.try_iter().collect();
    assert_eq!(seen[0], ListenerEvent::Started);
    assert!(matches!(seen[1], ListenerEvent::Failed(_)));
    assert_eq!(
        &seen[2..],
        &[ListenerEvent::Started, ListenerEvent::Stopped]
    );
}

#[test]
fn concurrent_stops_both_return_after_exit() {
    let listener = Arc::new(Listener::new(Arc::new(CallbackRegistry::new())));
    listener.start(Arc::new(MemoryChannel::new())).unwrap();

    let stoppers: Vec<_> = (0..4)
        .map(|_| {
            let listener = listener.clone();
            thread::spawn(move || {
                listener.stop().unwrap();
                listener.state()
            })
        })
        .collect();

    for stopper in stoppers {
        assert_eq!(stopper.join().unwrap(), ListenerState::Stopped);
    }
}

#[test]
fn writes_share_the_channel_with_the_listener() {
    let registry = Arc::new(CallbackRegistry::new());
    let received = Arc::new(AtomicUsize::new(0));
    {
        let received = received.clone();
        registry
            .register(move |_| {
                received.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    let channel = Arc::new(MemoryChannel::new());
    let listener = Listener::new(registry);
    listener.start(channel.clone()).unwrap();

    let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    channel.feed(&payload);
    let sent = write_chunks(&*channel, payload.as_slice(), 20).unwrap();

    assert_eq!(sent, 1000);
    assert!(wait_until(|| received.load(Ordering::SeqCst) == 1000));
    listener.stop().unwrap();
    assert_eq!(channel.written(), payload);
}
