//! Transfer engine
//!
//! Every HTTP(S) fetch runs through one [`FetchEngine`]. The engine owns the
//! transport context, the connection pool and the certificate chain cache, and
//! turns what the transport reports into [`FetchMsg`]s for each fetch's sink.
//!
//! The engine is single threaded. While [`FetchEngine::poll`] runs, sinks may
//! call back into the engine; the engine is then in [`EnginePhase::Polling`]
//! and `start` refuses new transfers while `abort` only flags the fetch and
//! leaves the cleanup to the poll loop.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use url::Url;

use super::certs::{CertChain, CertChainCache, CertError, MAX_CERT_DEPTH, OriginKey};
use super::config::FetchConfig;
use super::headers::{SpecialHeader, build_request_headers, parse_special};
use super::message::{FetchMsg, FetchSink, Flow};
use super::pool::{ConnectionPool, PoolStats};
use super::postdata::{self, PostData};
use super::progress::progress_text;
use super::request::{FetchId, FetchParams, FetchRequest, RequestPhase};
use super::transport::{
    Fd, FdSets, TemplateOptions, TransferEvents, TransferOptions, TransferResult, Transport,
};
use crate::security::SiteStore;
use crate::utils::{FetchError, Result};

/// Error text delivered when a 2xx-only fetch gets another status
pub const NOT_2XX: &str = "Not2xx";

/// Whether the engine is inside its poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Polling,
}

/// Marks the engine as polling until dropped
struct PollGuard<'a> {
    phase: &'a Cell<EnginePhase>,
}

impl<'a> PollGuard<'a> {
    fn enter(phase: &'a Cell<EnginePhase>) -> Self {
        phase.set(EnginePhase::Polling);
        Self { phase }
    }
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.phase.set(EnginePhase::Idle);
    }
}

/// How a finished transfer is reported
#[derive(Debug)]
enum Outcome {
    Finished,
    Silent,
    CertificateError,
    TlsError,
    Timeout(String),
    Error(String),
}

struct Shared<T: Transport> {
    config: FetchConfig,
    sites: Rc<dyn SiteStore>,
    phase: Cell<EnginePhase>,
    users: Cell<usize>,
    teardown_pending: Cell<bool>,
    next_id: Cell<u64>,
    requests: RefCell<HashMap<FetchId, FetchRequest>>,
    transport: RefCell<T>,
    template: RefCell<Option<T::Handle>>,
    pool: RefCell<ConnectionPool<T::Handle>>,
    certs: RefCell<CertChainCache>,
}

/// Handle to the transfer engine; clones share the same engine
pub struct FetchEngine<T: Transport> {
    shared: Rc<Shared<T>>,
}

impl<T: Transport> Clone for FetchEngine<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T: Transport> FetchEngine<T> {
    /// Create an engine over `transport`; nothing is set up until
    /// [`initialise`](Self::initialise)
    pub fn new(transport: T, config: FetchConfig, sites: Rc<dyn SiteStore>) -> Self {
        let pool = ConnectionPool::new(config.max_cached_fetch_handles);
        Self {
            shared: Rc::new(Shared {
                config,
                sites,
                phase: Cell::new(EnginePhase::Idle),
                users: Cell::new(0),
                teardown_pending: Cell::new(false),
                next_id: Cell::new(1),
                requests: RefCell::new(HashMap::new()),
                transport: RefCell::new(transport),
                template: RefCell::new(None),
                pool: RefCell::new(pool),
                certs: RefCell::new(CertChainCache::new()),
            }),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.shared.config
    }

    pub fn phase(&self) -> EnginePhase {
        self.shared.phase.get()
    }

    pub fn is_polling(&self) -> bool {
        self.phase() == EnginePhase::Polling
    }

    /// Whether global setup has been done
    pub fn is_initialised(&self) -> bool {
        self.shared.users.get() > 0
    }

    /// Number of schemes currently using the engine
    pub fn users(&self) -> usize {
        self.shared.users.get()
    }

    /// Register one more scheme user; the first does the global setup
    pub fn initialise(&self, scheme: &str) -> Result<()> {
        let shared = &self.shared;
        if shared.users.get() == 0 && shared.template.borrow().is_none() {
            log::info!("Initialising fetcher for {}", scheme);
            shared.setup_transport()?;
        }
        shared.teardown_pending.set(false);
        shared.users.set(shared.users.get() + 1);
        log::debug!("fetcher for {} registered, {} users", scheme, shared.users.get());
        Ok(())
    }

    /// Drop one scheme user; the last one tears everything down
    pub fn finalise(&self, scheme: &str) {
        let shared = &self.shared;
        let users = shared.users.get();
        if users == 0 {
            return;
        }
        shared.users.set(users - 1);
        log::info!("Finalise fetcher for {}", scheme);
        if users == 1 {
            if self.is_polling() {
                log::debug!("deferring teardown until poll returns");
                shared.teardown_pending.set(true);
            } else {
                shared.teardown();
            }
        }
    }

    /// Whether the engine can fetch `url`
    pub fn acceptable(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| !host.is_empty())
    }

    /// Create a fetch for `url` delivering to `sink`; no I/O starts yet
    pub fn setup(&self, sink: Box<dyn FetchSink>, url: &Url, params: FetchParams) -> Result<FetchId> {
        if !self.is_initialised() {
            return Err(FetchError::NotInitialised);
        }
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(FetchError::NoHost(url.to_string())),
        };

        let headers = build_request_headers(&self.shared.config, &params.headers);
        let post = PostData::from_parts(params.post_urlenc.clone(), params.post_multipart.clone());
        let upload = postdata::encode(&post).map_err(|e| {
            log::warn!("postdata conversion failed for {}: {}", url, e);
            FetchError::PostData(e)
        })?;

        let id = FetchId(self.shared.next_id.get());
        self.shared.next_id.set(id.0 + 1);

        let request = FetchRequest::new(
            id,
            url.clone(),
            host,
            headers,
            post,
            upload,
            &params,
            sink,
            self.shared.config.progress_interval(),
        );
        log::info!("fetch {}, url '{}'", id, url);
        self.shared.requests.borrow_mut().insert(id, request);
        Ok(id)
    }

    /// Begin the transfer for `id`.
    ///
    /// Returns false when the transfer cannot begin right now; the caller
    /// should try again on a later pass.
    pub fn start(&self, id: FetchId) -> bool {
        if self.is_polling() {
            log::debug!("Deferring fetch {} because inside transport", id);
            return false;
        }
        self.shared.initiate(id)
    }

    /// Abort the fetch; safe to call more than once
    pub fn abort(&self, id: FetchId) {
        let shared = &self.shared;
        let phase = {
            let mut requests = shared.requests.borrow_mut();
            let Some(request) = requests.get_mut(&id) else {
                return;
            };
            log::info!("fetch {}, url '{}' abort", id, request.url);
            request.mark_aborted();
            if request.phase == RequestPhase::Created {
                request.phase = RequestPhase::Released;
            }
            request.phase
        };

        if phase == RequestPhase::Active {
            if self.is_polling() {
                log::debug!("Deferring cleanup of fetch {}", id);
            } else {
                log::debug!("Immediate abort of fetch {}", id);
                shared.stop(id);
            }
        }
    }

    /// Release everything held for `id`
    pub fn free(&self, id: FetchId) -> Result<()> {
        let shared = &self.shared;
        let phase = shared
            .requests
            .borrow()
            .get(&id)
            .map(|r| r.phase)
            .ok_or(FetchError::UnknownFetch(id))?;

        if phase == RequestPhase::Active {
            if self.is_polling() {
                return Err(FetchError::StillActive(id));
            }
            let handle = shared.transport.borrow_mut().remove(id);
            drop(handle);
        }

        shared.requests.borrow_mut().remove(&id);
        Ok(())
    }

    /// Drive all transfers as far as they can go without blocking
    pub fn poll(&self) {
        let shared = &self.shared;
        if self.is_polling() {
            log::debug!("poll re-entered from a callback, ignoring");
            return;
        }
        if !self.is_initialised() {
            return;
        }

        if shared.config.verbose && log::log_enabled!(log::Level::Trace) {
            shared.dump_fds();
        }

        {
            let _guard = PollGuard::enter(&shared.phase);
            let performed = {
                let mut dispatch = Dispatch { shared };
                shared.transport.borrow_mut().perform(&mut dispatch)
            };

            match performed {
                Ok(running) => {
                    log::trace!("{} transfers running", running);
                    loop {
                        let next = shared.transport.borrow_mut().next_completion();
                        let Some((id, result)) = next else {
                            break;
                        };
                        shared.done(id, result);
                    }
                    shared.sweep_aborted();
                }
                Err(e) => log::warn!("transport perform failed: {}", e),
            }
        }

        if shared.teardown_pending.replace(false) && shared.users.get() == 0 {
            shared.teardown();
        }
    }

    /// Descriptors the caller may wait on before polling again
    pub fn fdset(&self, sets: &mut FdSets) -> Option<Fd> {
        if !self.is_initialised() {
            return None;
        }
        let transport = self.shared.transport.try_borrow().ok()?;
        transport.fdset(sets)
    }

    pub fn request_phase(&self, id: FetchId) -> Option<RequestPhase> {
        self.shared.requests.borrow().get(&id).map(|r| r.phase)
    }

    /// Number of fetches with a transfer in the transport
    pub fn active_count(&self) -> usize {
        self.shared
            .requests
            .borrow()
            .values()
            .filter(|r| r.is_active())
            .count()
    }

    /// Number of fetches known to the engine
    pub fn request_count(&self) -> usize {
        self.shared.requests.borrow().len()
    }

    /// Number of idle pooled connection handles
    pub fn pool_len(&self) -> usize {
        self.shared.pool.borrow().len()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.borrow().stats()
    }

    /// Most recently verified chain for the origin of `url`
    pub fn cached_chain(&self, url: &Url) -> Option<Rc<CertChain>> {
        let key = OriginKey::from_url(url)?;
        self.shared.certs.borrow().lookup(&key)
    }

    pub fn cached_chain_count(&self) -> usize {
        self.shared.certs.borrow().len()
    }
}

impl<T: Transport> Shared<T> {
    fn setup_transport(&self) -> Result<()> {
        let mut transport = self.transport.borrow_mut();
        transport.initialise(&self.config).map_err(|e| {
            log::error!("transport initialisation failed: {}", e);
            FetchError::InitFailed(e.to_string())
        })?;
        log::info!("transport version {}", transport.version());
        if transport.reuses_connections() {
            log::debug!("transport keeps its own connections; pooling handles anyway");
        }

        match transport.template(&TemplateOptions::from_config(&self.config)) {
            Ok(template) => {
                *self.template.borrow_mut() = Some(template);
                Ok(())
            }
            Err(e) => {
                log::error!("template handle setup failed: {}", e);
                transport.cleanup();
                Err(FetchError::InitFailed(e.to_string()))
            }
        }
    }

    fn teardown(&self) {
        let active: Vec<FetchId> = self
            .requests
            .borrow()
            .values()
            .filter(|r| r.is_active())
            .map(|r| r.id)
            .collect();
        for id in active {
            self.stop(id);
        }

        self.pool.borrow_mut().flush();
        *self.template.borrow_mut() = None;
        self.transport.borrow_mut().cleanup();
        log::debug!("cleaning up certificate chain cache");
        self.certs.borrow_mut().clear();
    }

    fn dump_fds(&self) {
        let mut sets = FdSets::new();
        let Ok(transport) = self.transport.try_borrow() else {
            return;
        };
        let max_fd = transport.fdset(&mut sets);
        drop(transport);

        log::trace!("transport file descriptor states (maxfd={:?}):", max_fd);
        for fd in 0..=max_fd.unwrap_or(-1) {
            let (read, write, error) = sets.state(fd);
            if read || write || error {
                log::trace!(
                    "  fd {}: {} {} {}",
                    fd,
                    if read { "read" } else { "    " },
                    if write { "write" } else { "     " },
                    if error { "error" } else { "     " },
                );
            }
        }
    }

    fn initiate(&self, id: FetchId) -> bool {
        if self.template.borrow().is_none() {
            log::warn!("fetch {} started before the engine was initialised", id);
            return false;
        }

        let (url, host) = {
            let mut requests = self.requests.borrow_mut();
            let Some(request) = requests.get_mut(&id) else {
                return false;
            };
            if request.phase != RequestPhase::Created || request.abort {
                return false;
            }
            request.reset_response();
            (request.url.clone(), request.host.clone())
        };

        let cookie = self.sites.get_cookie(&url, true);
        let auth = self.sites.auth_details(&url);
        let verify_peer = !self.sites.ignore_certificate_errors(&url);

        let options = {
            let mut requests = self.requests.borrow_mut();
            let Some(request) = requests.get_mut(&id) else {
                return false;
            };
            request.cookie = cookie.clone();
            request.verify_peer = verify_peer;
            TransferOptions {
                url,
                headers: request.headers.clone(),
                cookie,
                auth,
                proxy: self.config.proxy.clone(),
                verify_peer,
                downgrade_tls: request.downgrade_tls,
                upload: request.upload.clone(),
            }
        };

        let handle = {
            let template = self.template.borrow();
            let Some(template) = template.as_ref() else {
                return false;
            };
            self.pool
                .borrow_mut()
                .acquire_or_else(&host, || self.transport.borrow_mut().duplicate(template))
        };
        let mut handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("no connection handle for fetch {}: {}", id, e);
                return false;
            }
        };

        let mut transport = self.transport.borrow_mut();
        if let Err(e) = transport.configure(&mut handle, &options) {
            log::warn!("transport handle maybe went bad, retry later: {}", e);
            drop(handle);
            return false;
        }
        if let Err(e) = transport.add(id, handle) {
            log::warn!("could not add fetch {} to transport: {}", id, e);
            return false;
        }
        drop(transport);

        if let Some(request) = self.requests.borrow_mut().get_mut(&id) {
            request.phase = RequestPhase::Active;
        }
        true
    }

    /// Detach the transfer for `id` from the transport. The handle is pooled
    /// unless the fetch was aborted, in which case it is destroyed.
    fn stop(&self, id: FetchId) {
        let (host, aborted) = {
            let mut requests = self.requests.borrow_mut();
            let Some(request) = requests.get_mut(&id) else {
                return;
            };
            log::info!("fetch {}, url '{}' stopped", id, request.url);
            request.phase = RequestPhase::Released;
            (request.host.clone(), request.abort)
        };

        let handle = self.transport.borrow_mut().remove(id);
        if let Some(handle) = handle {
            if aborted {
                drop(handle);
            } else {
                self.pool.borrow_mut().release(handle, &host);
            }
        }
    }

    /// Run `f` on the fetch's sink with no engine state borrowed
    fn with_sink<R>(&self, id: FetchId, f: impl FnOnce(&mut dyn FetchSink) -> R) -> Option<R> {
        let mut sink = self.requests.borrow_mut().get_mut(&id)?.sink.take()?;
        let result = f(sink.as_mut());
        if let Some(request) = self.requests.borrow_mut().get_mut(&id) {
            request.sink = Some(sink);
        }
        Some(result)
    }

    /// Deliver `msg` and report whether the fetch has been aborted
    fn deliver(&self, id: FetchId, msg: FetchMsg<'_>) -> Flow {
        let flow = self.with_sink(id, |sink| sink.deliver(msg));
        let mut requests = self.requests.borrow_mut();
        let Some(request) = requests.get_mut(&id) else {
            return Flow::Abort;
        };
        if flow == Some(Flow::Abort) {
            request.mark_aborted();
        }
        if request.abort {
            Flow::Abort
        } else {
            Flow::Continue
        }
    }

    fn is_aborted(&self, id: FetchId) -> bool {
        self.requests.borrow().get(&id).is_none_or(|r| r.abort)
    }

    fn note_http_code(&self, id: FetchId, status: u16) {
        let known = {
            let mut requests = self.requests.borrow_mut();
            let Some(request) = requests.get_mut(&id) else {
                return;
            };
            if request.http_code != 0 || status == 0 {
                return;
            }
            request.http_code = status;
            if request.code_reported {
                return;
            }
            request.code_reported = true;
            status
        };
        self.with_sink(id, |sink| sink.set_http_code(known));
    }

    /// Decide what the response status means for the fetch.
    ///
    /// Returns true if the fetch must not go on to deliver a body.
    fn process_headers(&self, id: FetchId, status: Option<u16>) -> bool {
        if let Some(request) = self.requests.borrow_mut().get_mut(&id) {
            request.had_headers = true;
        }
        if let Some(status) = status {
            self.note_http_code(id, status);
        }

        let (code, has_body, location, realm, not_2xx) = {
            let requests = self.requests.borrow();
            let Some(request) = requests.get(&id) else {
                return true;
            };
            let code = request.http_code;
            (
                code,
                request.post.has_body(),
                request.location.clone(),
                request.realm.clone(),
                request.only_2xx && request.is_http() && !(200..=299).contains(&code),
            )
        };
        log::info!("HTTP status code {}", code);

        if code == 304 && !has_body {
            self.deliver(id, FetchMsg::NotModified);
            return true;
        }

        if (300..400).contains(&code) {
            if let Some(location) = location.as_deref() {
                log::info!("FETCH_REDIRECT, '{}'", location);
                self.deliver(id, FetchMsg::Redirect(location));
                return true;
            }
        }

        if code == 401 {
            self.deliver(
                id,
                FetchMsg::Auth {
                    realm: realm.as_deref(),
                },
            );
            return true;
        }

        if not_2xx {
            self.deliver(id, FetchMsg::Error(NOT_2XX));
            return true;
        }

        self.is_aborted(id)
    }

    /// Send the cached chain for the fetch's origin, once.
    ///
    /// Nothing is sent when certificate problems were overridden: no chain
    /// was checked for this transfer and a cached one would be stale.
    fn report_certs(&self, id: FetchId) {
        let origin = {
            let mut requests = self.requests.borrow_mut();
            let Some(request) = requests.get_mut(&id) else {
                return;
            };
            request.certs_sent = true;
            if !request.verify_peer {
                return;
            }
            request.origin.clone()
        };

        let chain = origin.and_then(|key| self.certs.borrow().lookup(&key));
        if let Some(chain) = chain {
            self.deliver(id, FetchMsg::Certificates(&chain));
        }
    }

    fn done(&self, id: FetchId, result: TransferResult) {
        let Some((aborted, stopped, had_headers)) = self
            .requests
            .borrow()
            .get(&id)
            .map(|r| (r.abort, r.stopped, r.had_headers))
        else {
            log::warn!("completion for unknown fetch {}", id);
            drop(self.transport.borrow_mut().remove(id));
            return;
        };
        log::info!("done fetch {}: {:?}", id, result);

        let status = self.transport.borrow().status_code(id);
        let late_headers = || !had_headers && self.process_headers(id, status);

        let outcome = if aborted {
            Outcome::Silent
        } else {
            match result {
                TransferResult::Complete | TransferResult::WriteAborted if !stopped => {
                    // a write error we did not cause is a junk compressed
                    // stream; what arrived so far is kept
                    if late_headers() {
                        Outcome::Silent
                    } else {
                        Outcome::Finished
                    }
                }
                TransferResult::PartialBody => {
                    if late_headers() {
                        Outcome::Silent
                    } else {
                        Outcome::Finished
                    }
                }
                TransferResult::Complete | TransferResult::WriteAborted => Outcome::Silent,
                TransferResult::PeerCertificate | TransferResult::CaCertificate => {
                    Outcome::CertificateError
                }
                TransferResult::TlsConnect => Outcome::TlsError,
                TransferResult::TimedOut(message) => Outcome::Timeout(message),
                TransferResult::Failed(message) => {
                    log::info!("transfer for fetch {} failed: {}", id, message);
                    Outcome::Error(message)
                }
            }
        };

        self.stop(id);

        let certs_sent = self
            .requests
            .borrow()
            .get(&id)
            .is_none_or(|r| r.certs_sent);
        if !certs_sent && !self.is_aborted(id) {
            self.report_certs(id);
        }

        if self.is_aborted(id) {
            return;
        }
        match outcome {
            Outcome::Silent => {}
            Outcome::Finished => {
                self.deliver(id, FetchMsg::Finished);
            }
            Outcome::CertificateError => {
                self.deliver(id, FetchMsg::CertificateError);
            }
            Outcome::TlsError => {
                self.deliver(id, FetchMsg::TlsError);
            }
            Outcome::Timeout(message) => {
                self.deliver(id, FetchMsg::Timeout(&message));
            }
            Outcome::Error(message) => {
                self.deliver(id, FetchMsg::Error(&message));
            }
        }
    }

    /// Clean up transfers whose abort was deferred while callbacks ran
    fn sweep_aborted(&self) {
        let aborted: Vec<FetchId> = self
            .requests
            .borrow()
            .values()
            .filter(|r| r.is_active() && r.abort)
            .map(|r| r.id)
            .collect();
        for id in aborted {
            log::debug!("cleaning up aborted fetch {}", id);
            self.stop(id);
        }
    }
}

/// Routes transport callbacks to the fetch they belong to
struct Dispatch<'a, T: Transport> {
    shared: &'a Shared<T>,
}

impl<T: Transport> TransferEvents for Dispatch<'_, T> {
    fn header(&mut self, id: FetchId, status: u16, line: &[u8]) -> Flow {
        let shared = self.shared;
        let certs_sent = {
            let mut requests = shared.requests.borrow_mut();
            let Some(request) = requests.get_mut(&id) else {
                return Flow::Abort;
            };
            if request.abort {
                request.stopped = true;
                return Flow::Abort;
            }
            request.certs_sent
        };

        if !certs_sent {
            shared.report_certs(id);
        }
        shared.note_http_code(id, status);

        if shared.deliver(id, FetchMsg::Header(line)).is_abort() {
            if let Some(request) = shared.requests.borrow_mut().get_mut(&id) {
                request.stopped = true;
            }
            return Flow::Abort;
        }

        let mut cookie = None;
        if let Some(special) = parse_special(line) {
            let mut requests = shared.requests.borrow_mut();
            let Some(request) = requests.get_mut(&id) else {
                return Flow::Abort;
            };
            match special {
                SpecialHeader::Location(location) => request.location = Some(location.to_string()),
                SpecialHeader::ContentLength(length) => request.content_length = Some(length),
                SpecialHeader::Realm(realm) => request.realm = Some(realm.to_string()),
                SpecialHeader::SetCookie(value) => cookie = Some((request.url.clone(), value)),
            }
        }
        if let Some((url, value)) = cookie {
            shared.sites.set_cookie(&url, value);
        }

        Flow::Continue
    }

    fn data(&mut self, id: FetchId, status: u16, chunk: &[u8]) -> Flow {
        let shared = self.shared;
        shared.note_http_code(id, status);

        let (aborted, had_headers) = {
            let mut requests = shared.requests.borrow_mut();
            let Some(request) = requests.get_mut(&id) else {
                return Flow::Abort;
            };
            // swallow the body of a 401 and forget the code so a follow
            // up authenticated fetch starts clean
            if request.http_code == 401 {
                request.http_code = 0;
                return Flow::Continue;
            }
            (request.abort, request.had_headers)
        };

        let stop = aborted
            || (!had_headers && shared.process_headers(id, None))
            || shared.deliver(id, FetchMsg::Data(chunk)).is_abort();
        if stop {
            if let Some(request) = shared.requests.borrow_mut().get_mut(&id) {
                request.stopped = true;
            }
            return Flow::Abort;
        }
        Flow::Continue
    }

    fn progress(&mut self, id: FetchId, total: u64, now: u64) {
        let shared = self.shared;
        let (report, total) = {
            let mut requests = shared.requests.borrow_mut();
            let Some(request) = requests.get_mut(&id) else {
                return;
            };
            // fall back to the announced length when the transport has none
            let total = match total {
                0 => request.content_length.unwrap_or(0),
                known => known,
            };
            (
                !request.abort && request.progress.should_report(Instant::now()),
                total,
            )
        };
        if report {
            let text = progress_text(now, total);
            shared.deliver(id, FetchMsg::Progress(&text));
        }
    }

    fn verify_certificate(&mut self, id: FetchId, depth: usize, der: &[u8], err: CertError) -> bool {
        let mut requests = self.shared.requests.borrow_mut();
        let Some(request) = requests.get_mut(&id) else {
            return false;
        };
        let proceed = request.capture.verify(depth, der, err);
        if !proceed && depth >= MAX_CERT_DEPTH {
            log::info!("certificate chain for fetch {} is too long", id);
        }
        proceed
    }

    fn chain_verified(&mut self, id: FetchId, ok: bool) -> bool {
        let shared = self.shared;
        let requests = shared.requests.borrow();
        let Some(request) = requests.get(&id) else {
            return false;
        };
        let Some(origin) = request.origin.as_ref() else {
            return ok;
        };
        match shared.certs.borrow_mut().replace(origin, &request.capture) {
            Ok(_) => ok,
            Err(e) => {
                log::debug!("could not store certificate chain for {}: {}", origin, e);
                false
            }
        }
    }

    fn debug(&mut self, id: FetchId, text: &str) {
        if self.shared.config.verbose {
            log::trace!("fetch {}: {}", id, text.trim_end());
        }
    }
}
