use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use evio::http::{Client, Server};
use evio::ws::{Websocket, WebsocketHandlers};
use evio::EventLoop;

mod util;
use util::{init, run_until};

fn echo_server(base: &EventLoop) -> (Server, u16) {
    let server = Server::new(base, |req| {
        let handlers = WebsocketHandlers {
            on_message: Some(Box::new(|ws, msg| {
                let msg = msg.to_vec();
                ws.send(&msg);
            })),
            ..WebsocketHandlers::default()
        };
        Websocket::upgrade(req, handlers)?;
        Ok(())
    });
    let addr = server.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    (server, addr.port())
}

#[test]
fn large_message_echo() {
    init();
    let base = EventLoop::new().unwrap();
    let (_server, port) = echo_server(&base);

    // Bigger than one 64 KiB frame, so the client sends TEXT + CONTINUE
    // fragments and receives the echo reassembled.
    let message: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();

    let echoed = Rc::new(RefCell::new(None));
    let client = Client::new(&base);

    let sent = message.clone();
    let e = echoed.clone();
    let handlers = WebsocketHandlers {
        on_open: Some(Box::new(move |ws| {
            ws.send(&sent);
        })),
        on_message: Some(Box::new(move |_ws, msg| {
            *e.borrow_mut() = Some(msg.to_vec());
        })),
        ..WebsocketHandlers::default()
    };

    let ws = Websocket::connect(&client, &format!("ws://127.0.0.1:{}/ws", port), handlers)
        .unwrap();

    let e = echoed.clone();
    run_until(&base, Duration::from_secs(15), move || e.borrow().is_some());

    assert_eq!(echoed.borrow().as_deref(), Some(&message[..]));
    assert_eq!(ws.messages_sent(), 1);
    assert_eq!(ws.messages_received(), 1);
}

#[test]
fn close_is_echoed_to_the_peer() {
    init();
    let base = EventLoop::new().unwrap();

    let server_status = Rc::new(Cell::new(0u16));
    let st = server_status.clone();
    let server = Server::new(&base, move |req| {
        let st = st.clone();
        let handlers = WebsocketHandlers {
            on_close: Some(Box::new(move |status, _reason| st.set(status))),
            ..WebsocketHandlers::default()
        };
        Websocket::upgrade(req, handlers)?;
        Ok(())
    });
    let port = server.bind(&"127.0.0.1:0".parse().unwrap()).unwrap().port();

    let client = Client::new(&base);
    let opened = Rc::new(Cell::new(false));
    let o = opened.clone();
    let handlers = WebsocketHandlers {
        on_open: Some(Box::new(move |_ws| o.set(true))),
        ..WebsocketHandlers::default()
    };
    let ws = Websocket::connect(&client, &format!("ws://127.0.0.1:{}/", port), handlers)
        .unwrap();

    {
        let opened = opened.clone();
        run_until(&base, Duration::from_secs(10), move || opened.get());
    }

    ws.close(1000, "bye");

    let st = server_status.clone();
    run_until(&base, Duration::from_secs(10), move || st.get() != 0);
    assert_eq!(server_status.get(), 1000);
}

#[test]
fn text_message_round_trip() {
    init();
    let base = EventLoop::new().unwrap();
    let (_server, port) = echo_server(&base);

    let client = Client::new(&base);
    let echoed = Rc::new(RefCell::new(None));

    let e = echoed.clone();
    let handlers = WebsocketHandlers {
        on_open: Some(Box::new(|ws| ws.send(b"ping me back"))),
        on_message: Some(Box::new(move |_ws, msg| {
            *e.borrow_mut() = Some(String::from_utf8_lossy(msg).into_owned());
        })),
        ..WebsocketHandlers::default()
    };
    Websocket::connect(&client, &format!("ws://127.0.0.1:{}/", port), handlers).unwrap();

    let e = echoed.clone();
    run_until(&base, Duration::from_secs(10), move || e.borrow().is_some());
    assert_eq!(echoed.borrow().as_deref(), Some("ping me back"));
}
