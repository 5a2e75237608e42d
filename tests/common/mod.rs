//! Shared fixtures for the engine integration tests
//!
//! `ScriptedTransport` plays back canned responses per URL, synchronously,
//! from inside `perform`. `RecordingSink` keeps an owned copy of every
//! message a fetch receives.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use netfetch::network::transport::{
    Fd, FdSets, TemplateOptions, TransferEvents, TransferOptions, TransferResult, Transport,
};
use netfetch::network::{CertError, FetchConfig, FetchId, FetchMsg, FetchSink, Flow};
use netfetch::utils::TransportError;

/// One thing a scripted transfer does during `perform`
#[derive(Debug, Clone)]
pub enum Step {
    Header(String),
    Data(Vec<u8>),
    Progress(u64, u64),
    /// Certificates indexed by depth; played back deepest first
    Chain(Vec<(Vec<u8>, CertError)>),
}

/// Canned response for one URL
#[derive(Debug, Clone)]
pub struct Script {
    pub status: u16,
    pub steps: Vec<Step>,
    /// `None` keeps the transfer running forever
    pub result: Option<TransferResult>,
}

impl Script {
    /// A complete response with the given status, headers and body
    pub fn response(status: u16, headers: &[&str], body: &[&[u8]]) -> Self {
        let mut steps = vec![Step::Header(format!("HTTP/1.1 {} X\r\n", status))];
        steps.extend(headers.iter().map(|h| Step::Header(format!("{}\r\n", h))));
        steps.push(Step::Header("\r\n".to_string()));
        steps.extend(body.iter().map(|chunk| Step::Data(chunk.to_vec())));
        Self {
            status,
            steps,
            result: Some(TransferResult::Complete),
        }
    }

    /// Fails before anything arrives
    pub fn failing(result: TransferResult) -> Self {
        Self {
            status: 0,
            steps: Vec::new(),
            result: Some(result),
        }
    }

    pub fn with_chain(mut self, chain: Vec<(Vec<u8>, CertError)>) -> Self {
        self.steps.insert(0, Step::Chain(chain));
        self
    }

    pub fn hanging(mut self) -> Self {
        self.result = None;
        self
    }
}

/// State shared between a test and its transport
#[derive(Debug, Default)]
pub struct ScriptState {
    pub scripts: HashMap<String, Script>,
    pub configured: Vec<TransferOptions>,
    pub handles_created: usize,
    pub handles_dropped: Rc<Cell<usize>>,
    pub fail_init: bool,
    pub fail_configure: bool,
    pub initialised: usize,
    pub cleanups: usize,
    pub performs: usize,
}

impl ScriptState {
    pub fn script(&mut self, url: &str, script: Script) {
        self.scripts.insert(url.to_string(), script);
    }

    pub fn live_handles(&self) -> usize {
        self.handles_created - self.handles_dropped.get()
    }
}

/// Connection handle that counts its own destruction
#[derive(Debug)]
pub struct MockHandle {
    pub serial: usize,
    dropped: Rc<Cell<usize>>,
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.dropped.set(self.dropped.get() + 1);
    }
}

struct Running {
    id: FetchId,
    url: String,
    handle: MockHandle,
    played: bool,
    status: Option<u16>,
}

pub struct ScriptedTransport {
    pub state: Rc<RefCell<ScriptState>>,
    running: Vec<Running>,
    pending_url: HashMap<usize, String>,
    completions: VecDeque<(FetchId, TransferResult)>,
}

impl ScriptedTransport {
    pub fn new() -> (Self, Rc<RefCell<ScriptState>>) {
        let state = Rc::new(RefCell::new(ScriptState::default()));
        (
            Self {
                state: Rc::clone(&state),
                running: Vec::new(),
                pending_url: HashMap::new(),
                completions: VecDeque::new(),
            },
            state,
        )
    }

    fn new_handle(&mut self) -> MockHandle {
        let mut state = self.state.borrow_mut();
        state.handles_created += 1;
        MockHandle {
            serial: state.handles_created,
            dropped: Rc::clone(&state.handles_dropped),
        }
    }

    /// Play one transfer's steps; returns its outcome if it ends
    fn play(
        &self,
        id: FetchId,
        script: &Script,
        events: &mut dyn TransferEvents,
    ) -> Option<TransferResult> {
        for step in &script.steps {
            match step {
                Step::Header(line) => {
                    if events.header(id, script.status, line.as_bytes()).is_abort() {
                        return Some(TransferResult::WriteAborted);
                    }
                }
                Step::Data(chunk) => {
                    if events.data(id, script.status, chunk).is_abort() {
                        return Some(TransferResult::WriteAborted);
                    }
                }
                Step::Progress(total, now) => events.progress(id, *total, *now),
                Step::Chain(chain) => {
                    let mut ok = true;
                    for depth in (0..chain.len()).rev() {
                        let (der, err) = &chain[depth];
                        ok = events.verify_certificate(id, depth, der, *err);
                    }
                    if !events.chain_verified(id, ok) {
                        return Some(TransferResult::PeerCertificate);
                    }
                }
            }
        }
        script.result.clone()
    }
}

impl Transport for ScriptedTransport {
    type Handle = MockHandle;

    fn initialise(&mut self, _config: &FetchConfig) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if state.fail_init {
            return Err(TransportError::Init("scripted failure".to_string()));
        }
        state.initialised += 1;
        Ok(())
    }

    fn cleanup(&mut self) {
        self.running.clear();
        self.completions.clear();
        self.state.borrow_mut().cleanups += 1;
    }

    fn version(&self) -> String {
        "scripted/1".to_string()
    }

    fn template(&mut self, _options: &TemplateOptions) -> Result<MockHandle, TransportError> {
        Ok(self.new_handle())
    }

    fn duplicate(&mut self, _template: &MockHandle) -> Result<MockHandle, TransportError> {
        Ok(self.new_handle())
    }

    fn configure(
        &mut self,
        handle: &mut MockHandle,
        options: &TransferOptions,
    ) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if state.fail_configure {
            return Err(TransportError::Option("scripted failure".to_string()));
        }
        state.configured.push(options.clone());
        self.pending_url.insert(handle.serial, options.url.to_string());
        Ok(())
    }

    fn add(&mut self, id: FetchId, handle: MockHandle) -> Result<(), TransportError> {
        let url = self.pending_url.remove(&handle.serial).unwrap_or_default();
        self.running.push(Running {
            id,
            url,
            handle,
            played: false,
            status: None,
        });
        Ok(())
    }

    fn remove(&mut self, id: FetchId) -> Option<MockHandle> {
        let index = self.running.iter().position(|r| r.id == id)?;
        self.completions.retain(|(done, _)| *done != id);
        Some(self.running.remove(index).handle)
    }

    fn perform(&mut self, events: &mut dyn TransferEvents) -> Result<usize, TransportError> {
        self.state.borrow_mut().performs += 1;
        let pending: Vec<(FetchId, String)> = self
            .running
            .iter()
            .filter(|r| !r.played)
            .map(|r| (r.id, r.url.clone()))
            .collect();

        for (id, url) in pending {
            let script = self
                .state
                .borrow()
                .scripts
                .get(&url)
                .cloned()
                .unwrap_or_else(|| Script::response(200, &[], &[b"ok"]));
            if let Some(running) = self.running.iter_mut().find(|r| r.id == id) {
                running.played = true;
                running.status = Some(script.status);
            }
            if let Some(result) = self.play(id, &script, events) {
                self.completions.push_back((id, result));
            }
        }

        Ok(self.running.len() - self.completions.len())
    }

    fn next_completion(&mut self) -> Option<(FetchId, TransferResult)> {
        self.completions.pop_front()
    }

    fn status_code(&self, id: FetchId) -> Option<u16> {
        self.running
            .iter()
            .find(|r| r.id == id)
            .and_then(|r| r.status)
            .filter(|status| *status != 0)
    }

    fn fdset(&self, sets: &mut FdSets) -> Option<Fd> {
        let fds: Vec<Fd> = self
            .running
            .iter()
            .filter(|r| !r.played)
            .map(|r| 3 + r.handle.serial as Fd)
            .collect();
        sets.read.extend(&fds);
        fds.into_iter().max()
    }
}

/// Owned copy of a delivered message
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Progress(String),
    Header(String),
    Data(Vec<u8>),
    Finished,
    Timeout(String),
    Error(String),
    Redirect(String),
    NotModified,
    Auth(Option<String>),
    Certificates(Vec<CertError>),
    CertificateError,
    TlsError,
}

impl From<FetchMsg<'_>> for Msg {
    fn from(msg: FetchMsg<'_>) -> Self {
        match msg {
            FetchMsg::Progress(text) => Msg::Progress(text.to_string()),
            FetchMsg::Header(line) => Msg::Header(String::from_utf8_lossy(line).into_owned()),
            FetchMsg::Data(chunk) => Msg::Data(chunk.to_vec()),
            FetchMsg::Finished => Msg::Finished,
            FetchMsg::Timeout(text) => Msg::Timeout(text.to_string()),
            FetchMsg::Error(text) => Msg::Error(text.to_string()),
            FetchMsg::Redirect(location) => Msg::Redirect(location.to_string()),
            FetchMsg::NotModified => Msg::NotModified,
            FetchMsg::Auth { realm } => Msg::Auth(realm.map(str::to_string)),
            FetchMsg::Certificates(chain) => {
                Msg::Certificates(chain.iter().map(|c| c.err()).collect())
            }
            FetchMsg::CertificateError => Msg::CertificateError,
            FetchMsg::TlsError => Msg::TlsError,
        }
    }
}

pub type Hook = Box<dyn FnMut(&Msg) -> Flow>;

/// Sink recording every message; an optional hook decides the flow
pub struct RecordingSink {
    pub log: Rc<RefCell<Vec<Msg>>>,
    pub codes: Rc<RefCell<Vec<u16>>>,
    hook: Option<Hook>,
}

impl RecordingSink {
    pub fn new() -> (Self, Rc<RefCell<Vec<Msg>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                log: Rc::clone(&log),
                codes: Rc::new(RefCell::new(Vec::new())),
                hook: None,
            },
            log,
        )
    }

    pub fn with_hook(mut self, hook: impl FnMut(&Msg) -> Flow + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }
}

impl FetchSink for RecordingSink {
    fn deliver(&mut self, msg: FetchMsg<'_>) -> Flow {
        let msg = Msg::from(msg);
        self.log.borrow_mut().push(msg.clone());
        match self.hook.as_mut() {
            Some(hook) => hook(&msg),
            None => Flow::Continue,
        }
    }

    fn set_http_code(&mut self, code: u16) {
        self.codes.borrow_mut().push(code);
    }
}

/// Messages other than progress and headers
pub fn outcome(log: &[Msg]) -> Vec<Msg> {
    log.iter()
        .filter(|m| !matches!(m, Msg::Progress(_) | Msg::Header(_)))
        .cloned()
        .collect()
}
