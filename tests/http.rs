use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use evio::http::{Client, Method, Server};
use evio::{ConnectionError, EventLoop, LoopConfig, PoolBackend};

mod util;
use util::{init, run_until};

fn echo_path_server(base: &EventLoop) -> (Server, u16) {
    let server = Server::new(base, |req| {
        let body = format!("you asked for {}", req.uri());
        req.reply_with(200, body.as_bytes());
        Ok(())
    });
    let addr = server.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    (server, addr.port())
}

/// Run a blocking exchange on a helper thread: connect, write `request`,
/// read until the peer closes, and hand the raw response back.
fn raw_exchange(port: u16, request: Vec<u8>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        // The peer may legitimately drop us before the write lands.
        let _ = stream.write_all(&request);
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response);
        let _ = tx.send(response);
    });
    rx
}

#[test]
fn get_round_trip() {
    init();
    let base = EventLoop::new().unwrap();

    let (_server, port) = {
        let server = Server::new(&base, |req| {
            assert_eq!(req.method(), Method::Get);
            assert_eq!(req.uri(), "/x");
            assert_eq!(req.in_get("Host").as_deref(), Some("h"));
            req.reply_with(200, b"hello");
            Ok(())
        });
        let addr = server.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        (server, addr.port())
    };

    let client = Client::new(&base);
    let done = Rc::new(Cell::new(false));

    let d = done.clone();
    let req = client
        .call(
            &format!("http://127.0.0.1:{}/x", port),
            Method::Get,
            None,
            move |req, err| {
                assert_eq!(err, ConnectionError::Ok);
                assert_eq!(req.response_code(), 200);
                assert_eq!(req.input_buffer().to_vec(), b"hello");
                d.set(true);
            },
        )
        .unwrap();
    req.out_set("Host", "h");

    run_until(&base, Duration::from_secs(10), move || done.get());
}

#[test]
fn chunked_upload_reassembles_body() {
    init();
    let base = EventLoop::new().unwrap();

    let seen = Rc::new(RefCell::new(None));
    let s = seen.clone();
    let server = Server::new(&base, move |req| {
        assert_eq!(req.method(), Method::Post);
        // The trailer header block merges into the request headers.
        assert_eq!(req.in_get("X-Trail").as_deref(), Some("yes"));
        *s.borrow_mut() = Some(req.input_buffer().to_vec());
        req.reply_with(200, b"ok");
        Ok(())
    });
    let port = server.bind(&"127.0.0.1:0".parse().unwrap()).unwrap().port();

    let request = b"POST /u HTTP/1.1\r\n\
                    Host: h\r\n\
                    Connection: close\r\n\
                    Transfer-Encoding: chunked\r\n\
                    \r\n\
                    5\r\nhello\r\n\
                    6\r\n world\r\n\
                    0\r\n\
                    X-Trail: yes\r\n\
                    \r\n"
        .to_vec();
    let rx = raw_exchange(port, request);

    let s = seen.clone();
    run_until(&base, Duration::from_secs(10), move || s.borrow().is_some());
    assert_eq!(seen.borrow().as_deref(), Some(&b"hello world"[..]));

    let response = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let response = String::from_utf8_lossy(&response).into_owned();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
}

#[test]
fn pipelined_requests_answered_in_order() {
    init();
    let base = EventLoop::new().unwrap();
    let (_server, port) = echo_path_server(&base);

    let request = b"GET /one HTTP/1.1\r\nHost: h\r\n\r\n\
                    GET /two HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n"
        .to_vec();
    let rx = raw_exchange(port, request);

    let got = Rc::new(RefCell::new(None));
    {
        let got = got.clone();
        run_until(&base, Duration::from_secs(10), move || {
            match rx.try_recv() {
                Ok(response) => {
                    *got.borrow_mut() = Some(response);
                    true
                }
                Err(_) => false,
            }
        });
    }

    let response = got.borrow_mut().take().unwrap();
    let text = String::from_utf8_lossy(&response).into_owned();
    let one = text.find("you asked for /one").expect("first response missing");
    let two = text.find("you asked for /two").expect("second response missing");
    assert!(one < two);
}

#[test]
fn expect_continue_gets_interim_then_final() {
    init();
    let base = EventLoop::new().unwrap();

    let server = Server::new(&base, |req| {
        req.reply_with(200, b"done");
        Ok(())
    });
    let port = server.bind(&"127.0.0.1:0".parse().unwrap()).unwrap().port();

    let request = b"POST /u HTTP/1.1\r\n\
                    Host: h\r\n\
                    Connection: close\r\n\
                    Expect: 100-continue\r\n\
                    Content-Length: 0\r\n\
                    \r\n"
        .to_vec();
    let rx = raw_exchange(port, request);

    let got = Rc::new(RefCell::new(None));
    {
        let got = got.clone();
        run_until(&base, Duration::from_secs(10), move || match rx.try_recv() {
            Ok(response) => {
                *got.borrow_mut() = Some(response);
                true
            }
            Err(_) => false,
        });
    }

    let text = String::from_utf8_lossy(got.borrow().as_deref().unwrap()).into_owned();
    assert!(text.starts_with("HTTP/1.1 100 Continue\r\n\r\n"), "{}", text);
    let rest = &text["HTTP/1.1 100 Continue\r\n\r\n".len()..];
    assert!(rest.starts_with("HTTP/1.1 200 OK\r\n"), "{}", rest);
    assert_eq!(text.matches("HTTP/1.1 200").count(), 1);
}

#[test]
fn header_size_boundary() {
    init();
    let base = EventLoop::new().unwrap();
    let (server, port) = echo_path_server(&base);

    // Build a request whose full header block is exactly `limit` bytes.
    let head = "GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\nX-Pad: ";
    let tail = "\r\n\r\n";
    let limit = 256;
    let pad = limit - head.len() - tail.len();
    let exact = format!("{}{}{}", head, "a".repeat(pad), tail);
    assert_eq!(exact.len(), limit);

    server.set_max_header_size(limit);

    let rx = raw_exchange(port, exact.clone().into_bytes());
    let got = Rc::new(RefCell::new(None));
    {
        let got = got.clone();
        run_until(&base, Duration::from_secs(10), move || match rx.try_recv() {
            Ok(r) => {
                *got.borrow_mut() = Some(r);
                true
            }
            Err(_) => false,
        });
    }
    let text = String::from_utf8_lossy(got.borrow().as_deref().unwrap()).into_owned();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);

    // One byte more aborts with 400.
    let over = format!("{}{}{}", head, "a".repeat(pad + 1), tail);
    let rx = raw_exchange(port, over.into_bytes());
    let got = Rc::new(RefCell::new(None));
    {
        let got = got.clone();
        run_until(&base, Duration::from_secs(10), move || match rx.try_recv() {
            Ok(r) => {
                *got.borrow_mut() = Some(r);
                true
            }
            Err(_) => false,
        });
    }
    let text = String::from_utf8_lossy(got.borrow().as_deref().unwrap()).into_owned();
    assert!(text.starts_with("HTTP/1.1 400 "), "{}", text);
}

#[test]
fn oversized_body_is_refused() {
    init();
    let base = EventLoop::new().unwrap();
    let (server, port) = echo_path_server(&base);
    server.set_max_body_size(16);

    let request = b"POST /u HTTP/1.1\r\n\
                    Host: h\r\n\
                    Connection: close\r\n\
                    Content-Length: 64\r\n\
                    \r\n"
        .to_vec();
    let rx = raw_exchange(port, request);

    let got = Rc::new(RefCell::new(None));
    {
        let got = got.clone();
        run_until(&base, Duration::from_secs(10), move || match rx.try_recv() {
            Ok(r) => {
                *got.borrow_mut() = Some(r);
                true
            }
            Err(_) => false,
        });
    }
    let text = String::from_utf8_lossy(got.borrow().as_deref().unwrap()).into_owned();
    assert!(text.starts_with("HTTP/1.1 413 "), "{}", text);
}

#[test]
fn denied_address_is_dropped_without_response() {
    init();
    let base = EventLoop::new().unwrap();
    let (server, port) = echo_path_server(&base);
    server.deny("127.0.0.1");

    let request = b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec();
    let rx = raw_exchange(port, request);

    let got = Rc::new(RefCell::new(None));
    {
        let got = got.clone();
        run_until(&base, Duration::from_secs(10), move || match rx.try_recv() {
            Ok(r) => {
                *got.borrow_mut() = Some(r);
                true
            }
            Err(_) => false,
        });
    }
    assert!(got.borrow().as_deref().unwrap().is_empty());
}

#[test]
fn allow_list_overrides_deny() {
    init();
    let base = EventLoop::new().unwrap();
    let (_server, port) = {
        let server = Server::new(&base, |req| {
            req.reply_with(200, b"in");
            Ok(())
        });
        let addr = server.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        server.allow("127.0.0.0/8");
        server.deny("127.0.0.1");
        (server, addr.port())
    };

    let client = Client::new(&base);
    let done = Rc::new(Cell::new(false));
    let d = done.clone();
    client
        .call(
            &format!("http://127.0.0.1:{}/", port),
            Method::Get,
            None,
            move |req, err| {
                assert_eq!(err, ConnectionError::Ok);
                assert_eq!(req.response_code(), 200);
                d.set(true);
            },
        )
        .unwrap();

    run_until(&base, Duration::from_secs(10), move || done.get());
}

#[test]
fn post_round_trip_with_body() {
    init();
    let base = EventLoop::new().unwrap();

    let server = Server::new(&base, |req| {
        assert_eq!(req.method(), Method::Post);
        let body = req.input_buffer().to_vec();
        req.reply_with(200, &body);
        Ok(())
    });
    let port = server.bind(&"127.0.0.1:0".parse().unwrap()).unwrap().port();

    let client = Client::new(&base);
    let done = Rc::new(Cell::new(false));
    let d = done.clone();
    client
        .call(
            &format!("http://127.0.0.1:{}/echo", port),
            Method::Post,
            Some(b"payload bytes"),
            move |req, err| {
                assert_eq!(err, ConnectionError::Ok);
                assert_eq!(req.input_buffer().to_vec(), b"payload bytes");
                d.set(true);
            },
        )
        .unwrap();

    run_until(&base, Duration::from_secs(10), move || done.get());
}

#[test]
fn loop_pool_backend_serves_requests() {
    init();
    let base = EventLoop::with_config(LoopConfig {
        pool: PoolBackend::Loop,
        ..LoopConfig::default()
    })
    .unwrap();

    let (_server, port) = echo_path_server(&base);

    let client = Client::new(&base);
    let done = Rc::new(Cell::new(false));
    let d = done.clone();
    client
        .call(
            &format!("http://127.0.0.1:{}/lp", port),
            Method::Get,
            None,
            move |req, err| {
                assert_eq!(err, ConnectionError::Ok);
                assert_eq!(req.input_buffer().to_vec(), b"you asked for /lp");
                d.set(true);
            },
        )
        .unwrap();

    run_until(&base, Duration::from_secs(10), move || done.get());
}

#[test]
fn connection_failure_reports_connect_error() {
    init();
    let base = EventLoop::new().unwrap();

    // Bind a port and close it again so nothing is listening.
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client = Client::new(&base);
    let done = Rc::new(Cell::new(false));
    let d = done.clone();
    client
        .call(
            &format!("http://127.0.0.1:{}/", dead_port),
            Method::Get,
            None,
            move |_req, err| {
                assert_eq!(err, ConnectionError::Connect);
                d.set(true);
            },
        )
        .unwrap();

    run_until(&base, Duration::from_secs(10), move || done.get());
}
