//! reqwest/rustls transport
//!
//! Every transfer runs as a task on a private tokio runtime and posts what
//! happens as [`Event`]s. [`HttpTransport::perform`] drains them on the
//! engine thread and replays them as [`TransferEvents`] callbacks, so the
//! engine only ever sees callbacks from inside its own poll.

use std::collections::{HashMap, VecDeque};
use std::error::Error as StdError;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::redirect::Policy;
use reqwest::{Body, Client, Method, NoProxy, Proxy};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use rustls::{CertificateError, ClientConfig, RootCertStore, SupportedProtocolVersion};
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::verifier::{CapturingVerifier, CertReporter};
use super::{
    Fd, FdSets, TemplateOptions, TransferEvents, TransferOptions, TransferResult, Transport,
};
use crate::network::certs::CertError;
use crate::network::config::{FetchConfig, ProxyAuth, ProxyConfig};
use crate::network::headers::split_request_header;
use crate::network::postdata::{MimeForm, PartSource, Upload};
use crate::network::request::FetchId;
use crate::utils::TransportError;

/// Something that happened to a transfer on the runtime
#[derive(Debug)]
pub(super) enum Event {
    Header {
        id: FetchId,
        status: u16,
        line: Bytes,
    },
    Data {
        id: FetchId,
        status: u16,
        chunk: Bytes,
    },
    Progress {
        id: FetchId,
        total: u64,
        now: u64,
    },
    Certificate {
        id: FetchId,
        depth: usize,
        der: Bytes,
        err: CertError,
    },
    ChainVerified {
        id: FetchId,
        ok: bool,
    },
    Debug {
        id: FetchId,
        text: String,
    },
    Done {
        id: FetchId,
        result: TransferResult,
    },
}

/// Client settings that need a separately built client
#[derive(Debug, Clone, PartialEq)]
struct ClientKey {
    https: bool,
    verify_peer: bool,
    downgrade_tls: bool,
    proxy: Option<ProxyConfig>,
}

/// Connection handle: a reqwest client with its own keep-alive connection
pub struct HttpHandle {
    options: Arc<TemplateOptions>,
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
    reporter: CertReporter,
    client: Option<(ClientKey, Client)>,
    request: Option<TransferOptions>,
}

impl HttpHandle {
    /// Client for `key`, built on first use and kept while the key matches
    fn client_for(&mut self, key: ClientKey) -> Result<Client, TransportError> {
        if let Some((current, client)) = &self.client {
            if *current == key {
                return Ok(client.clone());
            }
        }
        let client = build_client(self, &key)?;
        self.client = Some((key, client.clone()));
        Ok(client)
    }
}

struct Transfer {
    handle: HttpHandle,
    task: JoinHandle<()>,
    status: Option<u16>,
    finished: bool,
}

/// Transfer limits shared with the running tasks
struct Limits {
    total: Arc<Semaphore>,
    per_host: HashMap<String, Arc<Semaphore>>,
    max_per_host: usize,
}

impl Limits {
    /// Forget hosts no running transfer holds on to
    fn prune(&mut self) {
        self.per_host.retain(|_, semaphore| Arc::strong_count(semaphore) > 1);
    }

    fn host(&mut self, host: &str) -> Arc<Semaphore> {
        let max = self.max_per_host;
        Arc::clone(
            self.per_host
                .entry(host.to_ascii_lowercase())
                .or_insert_with(|| Arc::new(Semaphore::new(max))),
        )
    }
}

/// A transfer is stalled when it moves fewer than `limit` bytes per second
/// for `time`; a zero limit turns the check off
#[derive(Debug, Clone, Copy, PartialEq)]
struct LowSpeed {
    limit: u64,
    time: Duration,
}

impl LowSpeed {
    fn from_options(options: &TemplateOptions) -> Self {
        Self {
            limit: options.low_speed_limit,
            time: options.low_speed_time,
        }
    }

    fn enabled(&self) -> bool {
        self.limit > 0 && !self.time.is_zero()
    }

    /// Whether `bytes` over one full window is below the limit
    fn stalled(&self, bytes: u64) -> bool {
        u128::from(bytes) * 1000 < u128::from(self.limit) * self.time.as_millis()
    }

    fn timed_out(&self) -> TransferResult {
        TransferResult::TimedOut(format!(
            "Operation too slow. Less than {} bytes/sec transferred the last {} seconds",
            self.limit,
            self.time.as_secs()
        ))
    }
}

/// [`Transport`] backed by reqwest and rustls
pub struct HttpTransport {
    runtime: Option<Runtime>,
    limits: Option<Limits>,
    events_tx: UnboundedSender<Event>,
    events_rx: UnboundedReceiver<Event>,
    transfers: HashMap<FetchId, Transfer>,
    completions: VecDeque<(FetchId, TransferResult)>,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            runtime: None,
            limits: None,
            events_tx,
            events_rx,
            transfers: HashMap::new(),
            completions: VecDeque::new(),
        }
    }

    fn finish(&mut self, id: FetchId, result: TransferResult) {
        if let Some(transfer) = self.transfers.get_mut(&id) {
            if !transfer.finished {
                transfer.finished = true;
                transfer.task.abort();
                self.completions.push_back((id, result));
            }
        }
    }

    /// Whether events for `id` should still be replayed
    fn live(&self, id: FetchId) -> bool {
        self.transfers.get(&id).is_some_and(|t| !t.finished)
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl Transport for HttpTransport {
    type Handle = HttpHandle;

    fn initialise(&mut self, config: &FetchConfig) -> Result<(), TransportError> {
        if self.runtime.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("netfetch-io")
            .enable_all()
            .build()?;
        self.runtime = Some(runtime);
        self.limits = Some(Limits {
            total: Arc::new(Semaphore::new(config.max_fetchers.max(1))),
            per_host: HashMap::new(),
            max_per_host: config.max_fetchers_per_host.max(1),
        });
        Ok(())
    }

    fn cleanup(&mut self) {
        for (_, transfer) in self.transfers.drain() {
            transfer.task.abort();
            transfer.handle.reporter.unbind();
        }
        self.completions.clear();
        while self.events_rx.try_recv().is_ok() {}
        self.limits = None;
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }

    fn version(&self) -> String {
        "reqwest/0.12 rustls/0.23 (ring)".to_string()
    }

    fn reuses_connections(&self) -> bool {
        true
    }

    fn template(&mut self, options: &TemplateOptions) -> Result<HttpHandle, TransportError> {
        Ok(HttpHandle {
            roots: Arc::new(load_roots(options)?),
            provider: Arc::new(crypto_provider(options)?),
            options: Arc::new(options.clone()),
            reporter: CertReporter::default(),
            client: None,
            request: None,
        })
    }

    fn duplicate(&mut self, template: &HttpHandle) -> Result<HttpHandle, TransportError> {
        Ok(HttpHandle {
            options: Arc::clone(&template.options),
            roots: Arc::clone(&template.roots),
            provider: Arc::clone(&template.provider),
            reporter: CertReporter::default(),
            client: None,
            request: None,
        })
    }

    fn configure(
        &mut self,
        handle: &mut HttpHandle,
        options: &TransferOptions,
    ) -> Result<(), TransportError> {
        for line in &options.headers {
            let Some((name, value)) = split_request_header(line) else {
                return Err(TransportError::Option(format!("malformed header {:?}", line)));
            };
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Option(format!("{}: {}", name, e)))?;
            HeaderValue::from_str(value)
                .map_err(|e| TransportError::Option(format!("{}: {}", name, e)))?;
        }

        let key = ClientKey {
            https: options.url.scheme() == "https",
            verify_peer: options.verify_peer,
            downgrade_tls: options.downgrade_tls,
            proxy: options.proxy.clone(),
        };
        let _entered = self.runtime.as_ref().map(Runtime::enter);
        handle.client_for(key)?;
        handle.request = Some(options.clone());
        Ok(())
    }

    fn add(&mut self, id: FetchId, mut handle: HttpHandle) -> Result<(), TransportError> {
        let (Some(runtime), Some(limits)) = (self.runtime.as_ref(), self.limits.as_mut()) else {
            return Err(TransportError::Perform("transport not initialised".to_string()));
        };
        let Some(request) = handle.request.take() else {
            return Err(TransportError::Option("handle was not configured".to_string()));
        };
        let Some((_, client)) = handle.client.as_ref() else {
            return Err(TransportError::Option("handle has no client".to_string()));
        };

        limits.prune();
        let permits = (
            Arc::clone(&limits.total),
            limits.host(request.url.host_str().unwrap_or_default()),
        );
        handle.reporter.bind(id, self.events_tx.clone());
        let task = runtime.spawn(run_transfer(
            id,
            client.clone(),
            request,
            LowSpeed::from_options(&handle.options),
            permits,
            self.events_tx.clone(),
        ));
        self.transfers.insert(
            id,
            Transfer {
                handle,
                task,
                status: None,
                finished: false,
            },
        );
        Ok(())
    }

    fn remove(&mut self, id: FetchId) -> Option<HttpHandle> {
        let transfer = self.transfers.remove(&id)?;
        transfer.task.abort();
        transfer.handle.reporter.unbind();
        self.completions.retain(|(done, _)| *done != id);
        Some(transfer.handle)
    }

    fn perform(&mut self, events: &mut dyn TransferEvents) -> Result<usize, TransportError> {
        if self.runtime.is_none() {
            return Err(TransportError::Perform("transport not initialised".to_string()));
        }

        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                Event::Header { id, status, line } => {
                    if !self.live(id) {
                        continue;
                    }
                    if let Some(transfer) = self.transfers.get_mut(&id) {
                        transfer.status = Some(status);
                    }
                    if events.header(id, status, &line).is_abort() {
                        self.finish(id, TransferResult::WriteAborted);
                    }
                }
                Event::Data { id, status, chunk } => {
                    if self.live(id) && events.data(id, status, &chunk).is_abort() {
                        self.finish(id, TransferResult::WriteAborted);
                    }
                }
                Event::Progress { id, total, now } => {
                    if self.live(id) {
                        events.progress(id, total, now);
                    }
                }
                Event::Certificate { id, depth, der, err } => {
                    if self.live(id) && !events.verify_certificate(id, depth, &der, err) {
                        log::debug!("fetch {} rejected certificate at depth {}", id, depth);
                    }
                }
                Event::ChainVerified { id, ok } => {
                    if self.live(id) && !events.chain_verified(id, ok) {
                        log::debug!("fetch {} certificate chain not accepted", id);
                    }
                }
                Event::Debug { id, text } => {
                    if self.live(id) {
                        events.debug(id, &text);
                    }
                }
                Event::Done { id, result } => self.finish(id, result),
            }
        }

        Ok(self.transfers.values().filter(|t| !t.finished).count())
    }

    fn next_completion(&mut self) -> Option<(FetchId, TransferResult)> {
        self.completions.pop_front()
    }

    fn status_code(&self, id: FetchId) -> Option<u16> {
        self.transfers.get(&id).and_then(|t| t.status)
    }

    fn fdset(&self, _sets: &mut FdSets) -> Option<Fd> {
        // sockets live on the runtime's reactor
        None
    }
}

fn load_roots(options: &TemplateOptions) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        log::warn!("could not load platform certificate: {}", err);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    log::debug!("{} platform roots loaded, {} ignored", added, ignored);

    if let Some(bundle) = &options.ca_bundle {
        add_pem_file(&mut roots, bundle)?;
    }
    if let Some(dir) = &options.ca_path {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_cert = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e, "pem" | "crt" | "cer"));
            if is_cert {
                add_pem_file(&mut roots, &path)?;
            }
        }
    }

    if roots.is_empty() {
        log::warn!("no trust anchors available, https fetches will fail");
    }
    Ok(roots)
}

fn add_pem_file(roots: &mut RootCertStore, path: &Path) -> Result<(), TransportError> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| TransportError::Tls(format!("{}: {}", path.display(), e)))?
        .filter_map(|cert| cert.ok());
    let (added, ignored) = roots.add_parsable_certificates(certs);
    log::debug!("{}: {} roots added, {} ignored", path.display(), added, ignored);
    Ok(())
}

/// Name of a suite in the form used by the configuration
fn suite_name(suite: &rustls::SupportedCipherSuite) -> String {
    let name = format!("{:?}", suite.suite());
    match name.strip_prefix("TLS13_") {
        Some(rest) => format!("TLS_{}", rest),
        None => name,
    }
}

fn crypto_provider(options: &TemplateOptions) -> Result<CryptoProvider, TransportError> {
    let mut provider = rustls::crypto::ring::default_provider();
    provider.cipher_suites.retain(|suite| {
        let name = suite_name(suite);
        let allowed = match suite.version().version {
            rustls::ProtocolVersion::TLSv1_3 => &options.tls13_cipher_suites,
            _ => &options.tls12_cipher_suites,
        };
        allowed.iter().any(|s| s.eq_ignore_ascii_case(&name))
    });
    if provider.cipher_suites.is_empty() {
        return Err(TransportError::Tls("no usable cipher suites".to_string()));
    }
    Ok(provider)
}

fn tls_config(handle: &HttpHandle, key: &ClientKey) -> Result<ClientConfig, TransportError> {
    static MODERN: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13, &rustls::version::TLS12];
    static DOWNGRADED: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];

    let verifier = CapturingVerifier::new(
        Arc::clone(&handle.roots),
        Arc::clone(&handle.provider),
        !key.verify_peer,
        handle.reporter.clone(),
    )?;
    let versions = if key.downgrade_tls { DOWNGRADED } else { MODERN };

    let mut config = ClientConfig::builder_with_provider(Arc::clone(&handle.provider))
        .with_protocol_versions(versions)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn proxy(config: &ProxyConfig) -> Result<Proxy, TransportError> {
    let mut proxy = Proxy::all(format!("http://{}:{}", config.host, config.port))
        .map_err(|e| TransportError::Option(format!("proxy: {}", e)))?;
    match config.auth {
        ProxyAuth::None => {}
        ProxyAuth::Basic => proxy = proxy.basic_auth(&config.user, &config.password),
        ProxyAuth::Ntlm => {
            log::warn!("NTLM proxy authentication is not supported, connecting without")
        }
    }
    if !config.no_proxy.is_empty() {
        proxy = proxy.no_proxy(NoProxy::from_string(&config.no_proxy.join(",")));
    }
    Ok(proxy)
}

fn build_client(handle: &HttpHandle, key: &ClientKey) -> Result<Client, TransportError> {
    let options = &handle.options;
    let mut builder = Client::builder()
        .redirect(Policy::none())
        .http1_only()
        .gzip(true)
        .user_agent(options.user_agent.as_str())
        .connect_timeout(options.connect_timeout)
        .pool_max_idle_per_host(1);
    if key.https {
        builder = builder.use_preconfigured_tls(tls_config(handle, key)?);
    }
    builder = match &key.proxy {
        Some(config) => builder.proxy(proxy(config)?),
        None => builder.no_proxy(),
    };
    builder
        .build()
        .map_err(|e| TransportError::Option(format!("client: {}", e)))
}

async fn run_transfer(
    id: FetchId,
    client: Client,
    request: TransferOptions,
    low_speed: LowSpeed,
    (total, per_host): (Arc<Semaphore>, Arc<Semaphore>),
    events: UnboundedSender<Event>,
) {
    let Ok(_total) = total.acquire_owned().await else {
        return;
    };
    let Ok(_host) = per_host.acquire_owned().await else {
        return;
    };
    let result = match transfer(id, &client, request, low_speed, &events).await {
        Ok(()) => TransferResult::Complete,
        Err(result) => result,
    };
    let _ = events.send(Event::Done { id, result });
}

/// Run one request; the error side carries the failure outcome
async fn transfer(
    id: FetchId,
    client: &Client,
    request: TransferOptions,
    low_speed: LowSpeed,
    events: &UnboundedSender<Event>,
) -> Result<(), TransferResult> {
    let gone = |_| TransferResult::Failed("transfer abandoned".to_string());

    let builder = build_request(client, request).await?;
    let sent = if low_speed.enabled() {
        // nothing at all arrives while waiting for the response head
        time::timeout(low_speed.time, builder.send())
            .await
            .map_err(|_| low_speed.timed_out())?
    } else {
        builder.send().await
    };
    let mut response = sent.map_err(|e| classify(&e))?;

    let status = response.status();
    let code = status.as_u16();
    let status_line = format!(
        "{:?} {} {}\r\n",
        response.version(),
        code,
        status.canonical_reason().unwrap_or("")
    );
    events
        .send(Event::Debug {
            id,
            text: status_line.clone(),
        })
        .map_err(gone)?;

    let mut lines = vec![Bytes::from(status_line)];
    for (name, value) in response.headers() {
        let mut line = Vec::with_capacity(name.as_str().len() + value.len() + 4);
        line.extend_from_slice(name.as_str().as_bytes());
        line.extend_from_slice(b": ");
        line.extend_from_slice(value.as_bytes());
        line.extend_from_slice(b"\r\n");
        lines.push(Bytes::from(line));
    }
    lines.push(Bytes::from_static(b"\r\n"));
    for line in lines {
        events
            .send(Event::Header {
                id,
                status: code,
                line,
            })
            .map_err(gone)?;
    }

    let expected = response.content_length().unwrap_or(0);
    let mut received = 0u64;
    let mut window_start = Instant::now();
    let mut window_bytes = 0u64;
    loop {
        let next = if low_speed.enabled() {
            match time::timeout_at(window_start + low_speed.time, response.chunk()).await {
                Ok(next) => next,
                Err(_) => {
                    if low_speed.stalled(window_bytes) {
                        return Err(low_speed.timed_out());
                    }
                    window_start = Instant::now();
                    window_bytes = 0;
                    continue;
                }
            }
        } else {
            response.chunk().await
        };
        let Some(chunk) = next.map_err(|e| classify(&e))? else {
            break;
        };

        received += chunk.len() as u64;
        window_bytes += chunk.len() as u64;
        if window_start.elapsed() >= low_speed.time && low_speed.enabled() {
            if low_speed.stalled(window_bytes) {
                return Err(low_speed.timed_out());
            }
            window_start = Instant::now();
            window_bytes = 0;
        }
        events
            .send(Event::Data {
                id,
                status: code,
                chunk,
            })
            .map_err(gone)?;
        events
            .send(Event::Progress {
                id,
                total: expected,
                now: received,
            })
            .map_err(gone)?;
    }
    Ok(())
}

async fn build_request(
    client: &Client,
    request: TransferOptions,
) -> Result<reqwest::RequestBuilder, TransferResult> {
    let method = if request.upload.is_none() {
        Method::GET
    } else {
        Method::POST
    };

    let mut headers = HeaderMap::new();
    for line in &request.headers {
        // an empty value only suppresses a default, which reqwest never adds
        let Some((name, value)) = split_request_header(line).filter(|(_, v)| !v.is_empty())
        else {
            continue;
        };
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        headers.append(name, value);
    }
    if let Some(cookie) = request.cookie.as_deref() {
        if let Ok(value) = HeaderValue::from_str(cookie) {
            headers.insert(reqwest::header::COOKIE, value);
        }
    }

    let mut builder = client.request(method, request.url).headers(headers);
    if let Some(auth) = request.auth.as_deref() {
        let (user, password) = auth.split_once(':').unwrap_or((auth, ""));
        builder = builder.basic_auth(user, Some(password));
    }

    builder = match request.upload {
        Upload::None => builder,
        Upload::UrlEncoded(body) => builder
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body),
        Upload::Mime(form) => builder.multipart(multipart(&form).await?),
    };
    Ok(builder)
}

async fn multipart(form: &MimeForm) -> Result<Form, TransferResult> {
    let mut out = Form::new();
    for part in form.parts() {
        let mut body = match &part.source {
            PartSource::Memory(reader) => {
                Part::stream_with_length(Body::from(reader.bytes()), reader.len())
            }
            PartSource::File(path) => {
                let data = tokio::fs::read(path).await.map_err(|e| {
                    TransferResult::Failed(format!("{}: {}", path.display(), e))
                })?;
                Part::bytes(data)
            }
            PartSource::Empty => Part::bytes(Vec::new()),
        };
        if let Some(filename) = &part.filename {
            body = body.file_name(filename.clone());
        }
        if let Some(content_type) = &part.content_type {
            body = body
                .mime_str(content_type)
                .map_err(|e| TransferResult::Failed(format!("{}: {}", content_type, e)))?;
        }
        out = out.part(part.name.clone(), body);
    }
    Ok(out)
}

/// rustls error buried in a reqwest error chain
fn rustls_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a rustls::Error> {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            return Some(tls);
        }
        // io::Error hides its payload from source()
        if let Some(tls) = e
            .downcast_ref::<io::Error>()
            .and_then(|io| io.get_ref())
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return Some(tls);
        }
        source = e.source();
    }
    None
}

fn classify(err: &reqwest::Error) -> TransferResult {
    if err.is_timeout() {
        return TransferResult::TimedOut(err.to_string());
    }
    match rustls_error(err) {
        Some(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)) => {
            return TransferResult::CaCertificate;
        }
        Some(rustls::Error::InvalidCertificate(_)) => return TransferResult::PeerCertificate,
        Some(_) => return TransferResult::TlsConnect,
        None => {}
    }
    if err.is_body() || err.is_decode() {
        return TransferResult::PartialBody;
    }
    TransferResult::Failed(err.to_string())
}
