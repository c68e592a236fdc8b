mod common;

use std::cell::RefCell;
use std::rc::Rc;

use http::{Method, StatusCode};
use micro_proxy_http::codec::CodecType;
use micro_proxy_net::buffer::Buffer;
use micro_proxy_net::network::ConnectionCloseType;

use common::{RawConnectionDriver, TestServer, init_logging, make_single_request};

#[test]
fn get_status_completes_with_an_empty_body() {
    init_logging();
    let server = TestServer::start(CodecType::Http1);

    let response = make_single_request(server.port(), Method::GET, "/status", "", CodecType::Http1);

    assert!(response.complete());
    assert_eq!(response.status(), Some(StatusCode::OK));
    assert_eq!(response.body(), "");
    assert_eq!(server.log(), vec!["headers GET /status true"]);
}

#[test]
fn post_echo_returns_the_request_body() {
    init_logging();
    let server = TestServer::start(CodecType::Http1);

    let response = make_single_request(server.port(), Method::POST, "/echo", "hello", CodecType::Http1);

    assert!(response.complete());
    assert_eq!(response.status(), Some(StatusCode::OK));
    assert_eq!(response.body(), "hello");
    assert_eq!(server.log(), vec!["headers POST /echo false", "data hello true"]);
}

#[test]
fn unknown_path_is_not_found() {
    init_logging();
    let server = TestServer::start(CodecType::Http1);

    let response = make_single_request(server.port(), Method::GET, "/missing", "", CodecType::Http1);

    assert_eq!(response.status(), Some(StatusCode::NOT_FOUND));
    assert!(response.complete());
}

#[test]
fn raw_driver_forwards_every_byte_in_order() {
    init_logging();
    let server = TestServer::start(CodecType::Http1);
    let expected = concat!(
        "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n",
        "HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello",
    );

    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&received);
    let mut requests = Buffer::from(concat!(
        "GET /status HTTP/1.1\r\nhost: localhost\r\n\r\n",
        "POST /echo HTTP/1.1\r\nhost: localhost\r\ncontent-length: 5\r\n\r\nhello",
    ));
    let driver = RawConnectionDriver::new(server.port(), &mut requests, move |connection, data| {
        sink.borrow_mut().extend_from_slice(data.as_slice());
        data.clear();
        if sink.borrow().len() >= expected.len() {
            connection.close(ConnectionCloseType::FlushWrite);
        }
    });
    driver.run();

    assert_eq!(String::from_utf8_lossy(&received.borrow()), expected);
}

#[test]
fn malformed_request_closes_the_connection() {
    init_logging();
    let server = TestServer::start(CodecType::Http1);

    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&received);
    let mut garbage = Buffer::from("NOT-HTTP\r\n\r\n");
    let driver = RawConnectionDriver::new(server.port(), &mut garbage, move |_connection, data| {
        sink.borrow_mut().extend_from_slice(data.as_slice());
        data.clear();
    });
    driver.run();

    assert!(received.borrow().is_empty());
    assert!(server.log().is_empty());
}
