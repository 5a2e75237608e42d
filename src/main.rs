//! netfetch - fetch one URL and print every message the engine delivers
//!
//! Usage: `netfetch <url> [--post k=v]... [--header "Name: value"]...
//! [--downgrade-tls] [--only-2xx] [--insecure]`

use std::cell::Cell;
use std::env;
use std::process;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use netfetch::network::{FetcherRegistry, HttpTransport, register_http};
use netfetch::security::MemorySiteStore;
use netfetch::{FetchConfig, FetchEngine, FetchMsg, FetchParams, FetchSink, Flow, NAME, VERSION};
use url::Url;
use url::form_urlencoded::Serializer;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_START_ATTEMPTS: u32 = 50;

struct Options {
    url: Url,
    params: FetchParams,
    insecure: bool,
}

fn usage() -> ! {
    eprintln!(
        "usage: {} <url> [--post k=v]... [--header \"Name: value\"]... \
         [--downgrade-tls] [--only-2xx] [--insecure]",
        NAME
    );
    process::exit(2);
}

fn parse_args() -> Options {
    let mut args = env::args().skip(1);
    let mut url = None;
    let mut params = FetchParams::new();
    let mut post = Serializer::new(String::new());
    let mut has_post = false;
    let mut insecure = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--post" => {
                let Some(pair) = args.next() else { usage() };
                let (key, value) = pair.split_once('=').unwrap_or((pair.as_str(), ""));
                post.append_pair(key, value);
                has_post = true;
            }
            "--header" => {
                let Some(line) = args.next() else { usage() };
                params = params.header(line);
            }
            "--downgrade-tls" => params = params.downgrade_tls(true),
            "--only-2xx" => params = params.only_2xx(true),
            "--insecure" => insecure = true,
            "--version" => {
                println!("{} {}", NAME, VERSION);
                process::exit(0);
            }
            s if s.starts_with("--") => usage(),
            s if url.is_none() => match Url::parse(s) {
                Ok(parsed) => url = Some(parsed),
                Err(e) => {
                    eprintln!("{}: bad url {:?}: {}", NAME, s, e);
                    process::exit(2);
                }
            },
            _ => usage(),
        }
    }

    if has_post {
        params = params.post_urlenc(post.finish());
    }
    let Some(url) = url else { usage() };
    Options {
        url,
        params,
        insecure,
    }
}

/// Prints messages and notes when the fetch is over
struct PrintSink {
    finished: Rc<Cell<bool>>,
}

impl FetchSink for PrintSink {
    fn deliver(&mut self, msg: FetchMsg<'_>) -> Flow {
        match msg {
            FetchMsg::Header(line) => print!("< {}", String::from_utf8_lossy(line)),
            FetchMsg::Data(chunk) => print!("{}", String::from_utf8_lossy(chunk)),
            FetchMsg::Progress(text) => eprintln!("[progress] {}", text),
            FetchMsg::Certificates(chain) => {
                for (depth, cert) in chain.iter().enumerate() {
                    eprintln!("[certificate {}] {} {}", depth, cert.err(), cert.fingerprint());
                }
            }
            FetchMsg::Redirect(location) => eprintln!("[redirect] {}", location),
            FetchMsg::Auth { realm } => eprintln!("[auth] realm {}", realm.unwrap_or("(none)")),
            FetchMsg::Timeout(text) => eprintln!("[timeout] {}", text),
            FetchMsg::Error(text) => eprintln!("[error] {}", text),
            other => eprintln!("[{}]", other.kind()),
        }
        if msg.is_terminal() {
            self.finished.set(true);
        }
        Flow::Continue
    }

    fn set_http_code(&mut self, code: u16) {
        log::debug!("http status {}", code);
    }
}

fn main() {
    env_logger::init();
    let options = parse_args();

    let sites = Rc::new(MemorySiteStore::new());
    if options.insecure {
        sites.accept_certificate_errors(&options.url);
    }

    let engine = FetchEngine::new(HttpTransport::new(), FetchConfig::default(), sites);
    let mut registry = FetcherRegistry::new();
    if let Err(e) = register_http(&mut registry, engine) {
        eprintln!("{}: {}", NAME, e);
        process::exit(1);
    }

    let fetcher = match registry.fetcher_for(&options.url) {
        Ok(fetcher) => fetcher,
        Err(e) => {
            eprintln!("{}: {}", NAME, e);
            process::exit(1);
        }
    };

    let finished = Rc::new(Cell::new(false));
    let sink = PrintSink {
        finished: Rc::clone(&finished),
    };
    let id = match fetcher.setup(Box::new(sink), &options.url, options.params) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("{}: {}", NAME, e);
            process::exit(1);
        }
    };

    let mut attempts = 0;
    while !fetcher.start(id) {
        attempts += 1;
        if attempts == MAX_START_ATTEMPTS {
            eprintln!("{}: could not start fetch for {}", NAME, options.url);
            process::exit(1);
        }
        thread::sleep(POLL_INTERVAL);
    }
    while !finished.get() {
        registry.poll_all();
        thread::sleep(POLL_INTERVAL);
    }

    if let Err(e) = fetcher.free(id) {
        log::warn!("free failed: {}", e);
    }
    drop(fetcher);
    registry.finalise_all();
}
