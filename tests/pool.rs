use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use evio::{Buffer, EventLoop, Fd};

mod util;
use util::{init, run_until, socketpair};

#[test]
fn write_progress_accounts_every_byte() {
    init();
    let base = EventLoop::new().unwrap();
    let (a, b) = socketpair();

    let writer = Fd::new(&base, a, None).unwrap();
    let reader = Fd::new(&base, b, None).unwrap();

    let data: Vec<u8> = (0..1_000_000u32).map(|i| i as u8).collect();
    let out = Buffer::from_bytes(&data);
    let input = Buffer::new();

    let wrote = Rc::new(Cell::new(false));
    let got = Rc::new(Cell::new(false));

    let w = wrote.clone();
    writer.write_buffer(&out, move |success| {
        assert!(success);
        w.set(true);
    });

    let g = got.clone();
    reader.read_bytes(&input, data.len(), move |success| {
        assert!(success);
        g.set(true);
    });

    let done = {
        let (w, g) = (wrote.clone(), got.clone());
        move || w.get() && g.get()
    };
    run_until(&base, Duration::from_secs(10), done);

    assert_eq!(input.to_vec(), data);
    assert_eq!(writer.write_progress().total(), data.len());
    assert_eq!(reader.read_progress().total(), data.len());
}

#[test]
fn transfers_complete_in_submission_order() {
    init();
    let base = EventLoop::new().unwrap();
    let (a, b) = socketpair();

    let writer = Fd::new(&base, a, None).unwrap();
    let reader = Fd::new(&base, b, None).unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));

    for (i, chunk) in [&b"hello "[..], &b"world"[..]].iter().enumerate() {
        let o = order.clone();
        writer.write_buffer(&Buffer::from_bytes(chunk), move |success| {
            assert!(success);
            o.borrow_mut().push(i);
        });
    }

    let input = Buffer::new();
    let got = Rc::new(Cell::new(false));
    let g = got.clone();
    reader.read_bytes(&input, 11, move |success| {
        assert!(success);
        g.set(true);
    });

    run_until(&base, Duration::from_secs(5), move || got.get());
    assert_eq!(*order.borrow(), vec![0, 1]);
    assert_eq!(input.to_vec(), b"hello world");
}

#[test]
fn read_until_stops_at_delimiter() {
    init();
    let base = EventLoop::new().unwrap();
    let (a, b) = socketpair();

    let writer = Fd::new(&base, a, None).unwrap();
    let reader = Fd::new(&base, b, None).unwrap();

    writer.write_buffer(&Buffer::from_bytes(b"line one\r\nrest"), |_| {});

    let input = Buffer::new();
    let done = Rc::new(Cell::new(false));
    let d = done.clone();
    reader.read_until(&input, 1024, b"\r\n", move |success| {
        assert!(success);
        d.set(true);
    });

    run_until(&base, Duration::from_secs(5), move || done.get());

    let line = input.read_line(1024, b"\r\n").unwrap().unwrap();
    assert_eq!(line, "line one");
}

#[test]
fn read_times_out_and_reports_status() {
    init();
    let base = EventLoop::new().unwrap();
    let (a, _b_keepalive) = socketpair();

    let fd = Fd::new(&base, a, None).unwrap();
    fd.set_read_timeout(Some(Duration::from_millis(300)));

    let failed = Rc::new(Cell::new(false));
    let f = failed.clone();
    let start = std::time::Instant::now();
    fd.read_bytes(&Buffer::new(), 10, move |success| {
        assert!(!success);
        f.set(true);
    });

    run_until(&base, Duration::from_secs(5), move || failed.get());
    assert!(Duration::from_millis(300) <= start.elapsed());
    assert!(fd.status().read_timedout());

    unsafe { libc::close(_b_keepalive) };
}

#[test]
fn close_fails_pending_transfers_exactly_once() {
    init();
    let base = EventLoop::new().unwrap();
    let (a, _b) = socketpair();

    let fd = Fd::new(&base, a, None).unwrap();

    let calls = Rc::new(Cell::new(0));
    let c = calls.clone();
    fd.read_bytes(&Buffer::new(), 10, move |success| {
        assert!(!success);
        c.set(c.get() + 1);
    });

    fd.close();

    let c = calls.clone();
    run_until(&base, Duration::from_secs(5), move || 0 < c.get());

    // A few extra ticks must not re-run the callback.
    for _ in 0..5 {
        base.run_nonblock().unwrap();
    }
    assert_eq!(calls.get(), 1);

    unsafe { libc::close(_b) };
}

#[test]
fn duplicate_fd_registration_is_rejected() {
    init();
    let base = EventLoop::new().unwrap();
    let (a, b) = socketpair();

    let first = Fd::new(&base, a, None).unwrap();
    assert!(Fd::new(&base, a, None).is_err());
    drop(first);

    unsafe { libc::close(b) };
}

#[test]
fn transfer_for_unknown_fd_fails() {
    init();
    let base = EventLoop::new().unwrap();
    let (a, b) = socketpair();

    let fd = Fd::new(&base, a, None).unwrap();
    fd.close();

    let failed = Rc::new(Cell::new(false));
    let f = failed.clone();
    fd.read_bytes(&Buffer::new(), 1, move |success| {
        assert!(!success);
        f.set(true);
    });

    run_until(&base, Duration::from_secs(5), move || failed.get());
    unsafe { libc::close(b) };
}
