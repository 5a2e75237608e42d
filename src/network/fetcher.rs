//! Scheme fetchers and the registry that routes URLs to them

use std::collections::HashMap;
use std::rc::Rc;

use url::Url;

use super::engine::FetchEngine;
use super::message::FetchSink;
use super::request::{FetchId, FetchParams};
use super::transport::{Fd, FdSets, Transport};
use crate::utils::{FetchError, Result};

/// Schemes served by the HTTP engine
pub const HTTP_SCHEMES: [&str; 2] = ["http", "https"];

/// Operations a scheme fetcher offers to the registry
pub trait Fetcher {
    /// Called once for every scheme the fetcher is registered for
    fn initialise(&self, scheme: &str) -> Result<()>;

    /// Whether the fetcher can handle `url`
    fn acceptable(&self, url: &Url) -> bool;

    /// Create a fetch; nothing is transferred until `start`
    fn setup(&self, sink: Box<dyn FetchSink>, url: &Url, params: FetchParams) -> Result<FetchId>;

    /// Begin a fetch; false means "try again later"
    fn start(&self, id: FetchId) -> bool;

    fn abort(&self, id: FetchId);

    fn free(&self, id: FetchId) -> Result<()>;

    /// Make progress on every fetch of this fetcher
    fn poll(&self, scheme: &str);

    /// Descriptors worth waiting on; returns the highest one
    fn fdset(&self, scheme: &str, sets: &mut FdSets) -> Option<Fd>;

    fn finalise(&self, scheme: &str);
}

impl<T: Transport> Fetcher for FetchEngine<T> {
    fn initialise(&self, scheme: &str) -> Result<()> {
        FetchEngine::initialise(self, scheme)
    }

    fn acceptable(&self, url: &Url) -> bool {
        FetchEngine::acceptable(self, url)
    }

    fn setup(&self, sink: Box<dyn FetchSink>, url: &Url, params: FetchParams) -> Result<FetchId> {
        FetchEngine::setup(self, sink, url, params)
    }

    fn start(&self, id: FetchId) -> bool {
        FetchEngine::start(self, id)
    }

    fn abort(&self, id: FetchId) {
        FetchEngine::abort(self, id)
    }

    fn free(&self, id: FetchId) -> Result<()> {
        FetchEngine::free(self, id)
    }

    fn poll(&self, _scheme: &str) {
        FetchEngine::poll(self)
    }

    fn fdset(&self, _scheme: &str, sets: &mut FdSets) -> Option<Fd> {
        FetchEngine::fdset(self, sets)
    }

    fn finalise(&self, scheme: &str) {
        FetchEngine::finalise(self, scheme)
    }
}

/// Scheme to fetcher table
#[derive(Default)]
pub struct FetcherRegistry {
    fetchers: HashMap<String, Rc<dyn Fetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `fetcher` for `scheme`, initialising it for that scheme
    pub fn add(&mut self, scheme: &str, fetcher: Rc<dyn Fetcher>) -> Result<()> {
        let scheme = scheme.to_ascii_lowercase();
        if let Some(old) = self.fetchers.remove(&scheme) {
            old.finalise(&scheme);
        }
        fetcher.initialise(&scheme)?;
        log::info!("registered fetcher for {}", scheme);
        self.fetchers.insert(scheme, fetcher);
        Ok(())
    }

    pub fn get(&self, scheme: &str) -> Option<Rc<dyn Fetcher>> {
        self.fetchers.get(&scheme.to_ascii_lowercase()).cloned()
    }

    /// Fetcher able to handle `url`
    pub fn fetcher_for(&self, url: &Url) -> Result<Rc<dyn Fetcher>> {
        match self.get(url.scheme()) {
            Some(fetcher) if fetcher.acceptable(url) => Ok(fetcher),
            Some(_) => Err(FetchError::NoHost(url.to_string())),
            None => Err(FetchError::UnsupportedScheme(url.scheme().to_string())),
        }
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.fetchers.keys().map(String::as_str)
    }

    /// Fetchers registered for several schemes appear once
    fn distinct(&self) -> Vec<(&str, &Rc<dyn Fetcher>)> {
        let mut seen: Vec<(&str, &Rc<dyn Fetcher>)> = Vec::new();
        for (scheme, fetcher) in &self.fetchers {
            if !seen.iter().any(|(_, f)| Rc::ptr_eq(f, fetcher)) {
                seen.push((scheme.as_str(), fetcher));
            }
        }
        seen
    }

    /// Poll every registered fetcher once
    pub fn poll_all(&self) {
        for (scheme, fetcher) in self.distinct() {
            fetcher.poll(scheme);
        }
    }

    /// Collect descriptors from every fetcher; returns the highest one
    pub fn fdset_all(&self, sets: &mut FdSets) -> Option<Fd> {
        self.distinct()
            .into_iter()
            .filter_map(|(scheme, fetcher)| fetcher.fdset(scheme, sets))
            .max()
    }

    /// Finalise every scheme and empty the registry
    pub fn finalise_all(&mut self) {
        for (scheme, fetcher) in self.fetchers.drain() {
            fetcher.finalise(&scheme);
        }
    }
}

/// Register `engine` for `http` and `https`
pub fn register_http<T: Transport + 'static>(
    registry: &mut FetcherRegistry,
    engine: FetchEngine<T>,
) -> Result<()> {
    let fetcher: Rc<dyn Fetcher> = Rc::new(engine);
    for scheme in HTTP_SCHEMES {
        registry.add(scheme, Rc::clone(&fetcher))?;
    }
    Ok(())
}
