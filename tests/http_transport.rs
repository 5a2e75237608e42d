//! The reqwest backend against tiny local HTTP/1.1 and HTTPS servers

mod common;

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::rc::Rc;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use netfetch::network::{CertError, FetchConfig, FetchEngine, FetchId, FetchParams, HttpTransport};
use netfetch::security::{MemorySiteStore, SiteStore};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned, SupportedProtocolVersion};
use url::Url;

use common::{Msg, RecordingSink, outcome};

/// Request as seen by the server
struct Seen {
    head: String,
    body: Vec<u8>,
}

/// Read one request; `None` if the connection broke first
fn read_request(stream: impl Read) -> Option<Seen> {
    let mut reader = BufReader::new(stream);
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 || line == "\r\n" {
            break;
        }
        head.push_str(&line);
    }
    let length = head
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    let mut body = vec![0; length];
    reader.read_exact(&mut body).ok()?;
    Some(Seen { head, body })
}

/// Serve one canned response per connection, `count` times
fn serve(responses: Vec<&'static str>) -> (Url, mpsc::Receiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for response in responses {
            let (mut stream, _) = listener.accept().unwrap();
            let seen = read_request(&mut stream).unwrap();
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
            let _ = tx.send(seen);
        }
    });
    (Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap(), rx)
}

fn run(engine: &FetchEngine<HttpTransport>, id: FetchId, log: &Rc<std::cell::RefCell<Vec<Msg>>>) {
    assert!(engine.start(id));
    let deadline = Instant::now() + Duration::from_secs(10);
    while !log.borrow().iter().any(is_terminal) {
        assert!(Instant::now() < deadline, "fetch did not finish: {:?}", log.borrow());
        engine.poll();
        thread::sleep(Duration::from_millis(5));
    }
}

fn is_terminal(msg: &Msg) -> bool {
    !matches!(msg, Msg::Progress(_) | Msg::Header(_) | Msg::Data(_) | Msg::Certificates(_))
}

/// Self-signed certificate for 127.0.0.1
fn self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    (vec![CertificateDer::from(cert.cert)], key.into())
}

/// Answer every TLS connection with `response` until the test ends
fn serve_tls(versions: &[&'static SupportedProtocolVersion], response: &'static str) -> Url {
    let (certs, key) = self_signed();
    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(versions)
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .unwrap();
    let config = Arc::new(config);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            let Ok(conn) = ServerConnection::new(Arc::clone(&config)) else {
                continue;
            };
            let mut tls = StreamOwned::new(conn, stream);
            // a refused handshake shows up as a failed read
            if read_request(&mut tls).is_none() {
                continue;
            }
            let _ = tls.write_all(response.as_bytes());
            tls.conn.send_close_notify();
            let _ = tls.flush();
        }
    });
    Url::parse(&format!("https://127.0.0.1:{}/", port)).unwrap()
}

const SECURE_PAGE: &str = "HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecure";

fn engine_with(config: FetchConfig, sites: Rc<dyn SiteStore>) -> FetchEngine<HttpTransport> {
    let engine = FetchEngine::new(HttpTransport::new(), config, sites);
    engine.initialise("http").unwrap();
    engine
}

fn engine() -> FetchEngine<HttpTransport> {
    engine_with(FetchConfig::default(), Rc::new(MemorySiteStore::new()))
}

fn body(log: &[Msg]) -> Vec<u8> {
    log.iter()
        .filter_map(|m| match m {
            Msg::Data(chunk) => Some(chunk.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

#[test]
fn test_get_delivers_headers_body_and_finished() {
    let (base, seen) = serve(vec![
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 11\r\n\r\nhello world",
    ]);
    let engine = engine();

    let (sink, log) = RecordingSink::new();
    let id = engine
        .setup(Box::new(sink), &base.join("page").unwrap(), FetchParams::new().header("X-Extra: yes"))
        .unwrap();
    run(&engine, id, &log);

    let log = log.borrow();
    assert_eq!(log.first(), Some(&Msg::Header("HTTP/1.1 200 OK\r\n".to_string())));
    assert!(log.contains(&Msg::Header("content-type: text/plain\r\n".to_string())));
    assert!(log.contains(&Msg::Header("\r\n".to_string())));
    assert_eq!(body(&log), b"hello world".to_vec());
    assert_eq!(log.last(), Some(&Msg::Finished));

    let request = seen.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(request.head.starts_with("GET /page HTTP/1.1\r\n"));
    assert!(request.head.to_ascii_lowercase().contains("x-extra: yes"));
    assert!(!request.head.to_ascii_lowercase().contains("pragma"));

    engine.free(id).unwrap();
    assert_eq!(engine.pool_len(), 1);
    engine.finalise("http");
}

#[test]
fn test_redirect_is_not_followed() {
    let (base, _seen) = serve(vec![
        "HTTP/1.1 301 Moved Permanently\r\nLocation: /elsewhere\r\nContent-Length: 5\r\n\r\nmoved",
    ]);
    let engine = engine();

    let (sink, log) = RecordingSink::new();
    let id = engine
        .setup(Box::new(sink), &base, FetchParams::new())
        .unwrap();
    run(&engine, id, &log);

    assert_eq!(outcome(&log.borrow()), vec![Msg::Redirect("/elsewhere".to_string())]);
    engine.finalise("http");
}

#[test]
fn test_urlencoded_post() {
    let (base, seen) = serve(vec!["HTTP/1.1 204 No Content\r\n\r\n"]);
    let engine = engine();

    let (sink, log) = RecordingSink::new();
    let id = engine
        .setup(
            Box::new(sink),
            &base.join("submit").unwrap(),
            FetchParams::new().post_urlenc("a=1&b=two"),
        )
        .unwrap();
    run(&engine, id, &log);

    assert_eq!(log.borrow().last(), Some(&Msg::Finished));
    let request = seen.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(request.head.starts_with("POST /submit HTTP/1.1\r\n"));
    assert!(request
        .head
        .to_ascii_lowercase()
        .contains("content-type: application/x-www-form-urlencoded"));
    assert_eq!(request.body, b"a=1&b=two".to_vec());
    engine.finalise("http");
}

#[test]
fn test_connection_refused_is_an_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let engine = engine();

    let (sink, log) = RecordingSink::new();
    let target = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();
    let id = engine
        .setup(Box::new(sink), &target, FetchParams::new())
        .unwrap();
    run(&engine, id, &log);

    let log = log.borrow();
    assert_eq!(log.len(), 1);
    assert!(matches!(log[0], Msg::Error(_)));
    engine.finalise("http");
}

#[test]
fn test_stalled_body_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_request(&mut stream).unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nabcde")
            .unwrap();
        stream.flush().unwrap();
        // hold the connection open without sending the rest
        thread::sleep(Duration::from_secs(6));
    });

    let config = FetchConfig {
        low_speed_limit: 1,
        low_speed_time: Duration::from_secs(1),
        ..FetchConfig::default()
    };
    let engine = engine_with(config, Rc::new(MemorySiteStore::new()));
    let (sink, log) = RecordingSink::new();
    let target = Url::parse(&format!("http://127.0.0.1:{}/slow", port)).unwrap();
    let id = engine
        .setup(Box::new(sink), &target, FetchParams::new())
        .unwrap();
    run(&engine, id, &log);

    let log = log.borrow();
    assert_eq!(body(&log), b"abcde".to_vec());
    match log.last() {
        Some(Msg::Timeout(text)) => assert!(text.contains("too slow"), "{}", text),
        other => panic!("expected a timeout, got {:?}", other),
    }
    engine.finalise("http");
}

#[test]
fn test_self_signed_server_fails_with_chain() {
    let base = serve_tls(&[&rustls::version::TLS13, &rustls::version::TLS12], SECURE_PAGE);
    let engine = engine();

    let (sink, log) = RecordingSink::new();
    let id = engine
        .setup(Box::new(sink), &base, FetchParams::new())
        .unwrap();
    run(&engine, id, &log);

    assert_eq!(
        *log.borrow(),
        vec![Msg::Certificates(vec![CertError::SelfSigned]), Msg::CertificateError]
    );
    let cached = engine.cached_chain(&base).unwrap();
    assert_eq!(cached.len(), 1);
    assert!(!cached.get(0).unwrap().der().is_empty());
    engine.finalise("http");
}

#[test]
fn test_accepted_certificate_errors_let_fetch_finish() {
    let base = serve_tls(&[&rustls::version::TLS13, &rustls::version::TLS12], SECURE_PAGE);
    let sites = Rc::new(MemorySiteStore::new());
    sites.accept_certificate_errors(&base);
    let engine = engine_with(FetchConfig::default(), sites);

    let (sink, log) = RecordingSink::new();
    let id = engine
        .setup(Box::new(sink), &base, FetchParams::new())
        .unwrap();
    run(&engine, id, &log);

    let log = log.borrow();
    assert_eq!(body(&log), b"secure".to_vec());
    assert_eq!(log.last(), Some(&Msg::Finished));
    assert!(!log.iter().any(|m| matches!(m, Msg::Certificates(_))));
    assert!(engine.cached_chain(&base).is_none());
    engine.finalise("http");
}

#[test]
fn test_downgraded_client_against_tls13_only_server() {
    let base = serve_tls(&[&rustls::version::TLS13], SECURE_PAGE);
    let engine = engine();

    let (sink, log) = RecordingSink::new();
    let id = engine
        .setup(Box::new(sink), &base, FetchParams::new().downgrade_tls(true))
        .unwrap();
    run(&engine, id, &log);

    assert_eq!(*log.borrow(), vec![Msg::TlsError]);
    engine.finalise("http");
}
