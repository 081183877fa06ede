//! End-to-end event loop behavior: dispatch order, stop protocol, and
//! re-registration across threads.

mod common;

use common::{init_logging, wait_until};
use eventide::{pipe, EventHandler, EventLoop, FdEvent, IoObject, Priority, TriggerMode};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn deactivating_recorder(tag: u32, log: Arc<Mutex<Vec<u32>>>) -> EventHandler {
    Arc::new(move |iop| {
        log.lock().push(tag);
        let evlp = iop.io().event_loop().expect("owning loop");
        evlp.deactivate(iop, FdEvent::WRITABLE)
    })
}

#[test]
fn higher_priority_dispatches_first() {
    init_logging();
    let evlp = Arc::new(EventLoop::new().expect("event loop"));
    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    // Pipe write ends are born writable, so both events are ready in the
    // same wake. The low-priority one is registered first on purpose.
    let (_rd_lo, wr_lo) = pipe().expect("pipe");
    let (_rd_hi, wr_hi) = pipe().expect("pipe");
    let lo: Arc<dyn IoObject> = wr_lo;
    let hi: Arc<dyn IoObject> = wr_hi;

    evlp.register_and_activate(
        &lo,
        FdEvent::WRITABLE,
        deactivating_recorder(6, order.clone()),
        Priority::P6,
    )
    .expect("register low");
    evlp.register_and_activate(
        &hi,
        FdEvent::WRITABLE,
        deactivating_recorder(0, order.clone()),
        Priority::P0,
    )
    .expect("register high");

    evlp.loop_once(Some(Duration::from_secs(1))).expect("loop_once");

    assert_eq!(*order.lock(), vec![0, 6]);
}

#[test]
fn stop_wakes_a_parked_loop() {
    init_logging();
    let evlp = Arc::new(EventLoop::new().expect("event loop"));
    let running = Arc::new(AtomicBool::new(false));

    let loop_evlp = evlp.clone();
    let loop_running = running.clone();
    let thread = std::thread::spawn(move || {
        loop_running.store(true, Ordering::SeqCst);
        // Indefinite wait; only the stop event can end this.
        loop_evlp.loop_forever(None).expect("loop_forever");
    });

    assert!(wait_until(Duration::from_secs(1), || running
        .load(Ordering::SeqCst)));
    std::thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    let stopped = evlp
        .stop_loop_timeout(Duration::from_secs(5))
        .expect("stop_loop_timeout");
    assert!(stopped);
    assert!(start.elapsed() < Duration::from_secs(5));
    thread.join().expect("join loop thread");
}

#[test]
fn stop_loop_waits_indefinitely_until_observed() {
    init_logging();
    let evlp = Arc::new(EventLoop::new().expect("event loop"));

    let loop_evlp = evlp.clone();
    let thread = std::thread::spawn(move || {
        loop_evlp.loop_forever(None).expect("loop_forever");
    });
    std::thread::sleep(Duration::from_millis(50));

    evlp.stop_loop().expect("stop_loop");
    thread.join().expect("join loop thread");
}

#[test]
fn loop_restarts_after_stop() {
    init_logging();
    let evlp = Arc::new(EventLoop::new().expect("event loop"));

    for _ in 0..2 {
        let loop_evlp = evlp.clone();
        let thread = std::thread::spawn(move || {
            loop_evlp.loop_forever(None).expect("loop_forever");
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(evlp
            .stop_loop_timeout(Duration::from_secs(5))
            .expect("stop_loop_timeout"));
        thread.join().expect("join loop thread");
    }
}

#[test]
fn oneshot_mode_fires_once_until_rearmed() {
    init_logging();
    let evlp = Arc::new(EventLoop::new().expect("event loop"));
    let fired = Arc::new(AtomicUsize::new(0));

    let (_rd, wr) = pipe().expect("pipe");
    let iop: Arc<dyn IoObject> = wr;
    evlp.set_mode(&iop, TriggerMode::Oneshot);

    let fired2 = fired.clone();
    let handler: EventHandler = Arc::new(move |_| {
        fired2.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    evlp.register_and_activate(&iop, FdEvent::WRITABLE, handler, Priority::P0)
        .expect("register");

    evlp.loop_once(Some(Duration::from_millis(200))).expect("first");
    evlp.loop_once(Some(Duration::from_millis(200))).expect("second");
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Rearming takes a deactivate/activate pair.
    evlp.deactivate(&iop, FdEvent::WRITABLE).expect("deactivate");
    evlp.activate(&iop, FdEvent::WRITABLE).expect("activate");
    evlp.loop_once(Some(Duration::from_millis(200))).expect("third");
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn handler_error_does_not_stop_dispatch() {
    init_logging();
    let evlp = Arc::new(EventLoop::new().expect("event loop"));
    let reached = Arc::new(AtomicBool::new(false));

    let (_rd_a, wr_a) = pipe().expect("pipe");
    let (_rd_b, wr_b) = pipe().expect("pipe");
    let failing: Arc<dyn IoObject> = wr_a;
    let healthy: Arc<dyn IoObject> = wr_b;

    let fail_handler: EventHandler = Arc::new(|iop| {
        let evlp = iop.io().event_loop().expect("owning loop");
        evlp.deactivate(iop, FdEvent::WRITABLE)?;
        Err(eventide::Error::runtime("intentional failure"))
    });
    let reached2 = reached.clone();
    let ok_handler: EventHandler = Arc::new(move |iop| {
        reached2.store(true, Ordering::SeqCst);
        let evlp = iop.io().event_loop().expect("owning loop");
        evlp.deactivate(iop, FdEvent::WRITABLE)
    });

    evlp.register_and_activate(&failing, FdEvent::WRITABLE, fail_handler, Priority::P0)
        .expect("register failing");
    evlp.register_and_activate(&healthy, FdEvent::WRITABLE, ok_handler, Priority::P6)
        .expect("register healthy");

    evlp.loop_once(Some(Duration::from_secs(1))).expect("loop_once");
    assert!(reached.load(Ordering::SeqCst));
}
