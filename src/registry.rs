//! Route tables and the resolution of requests to stubs.
//!
//! Exact routes are keyed by `METHOD PATH` and always win. Pattern routes
//! are regular expressions grouped by priority; buckets are scanned from
//! [PRIORITY_LIMIT] down to 0 and, within a bucket, in registration order.

use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
};

use regex::Regex;
use tracing::debug;

use crate::{Error, Stub, StubRoute};

/// Priority given to pattern routes registered without one.
pub const PRIORITY_DEFAULT: i64 = 10;
/// Highest allowed pattern priority. The lowest is 0.
pub const PRIORITY_LIMIT: i64 = 100;

const DEFAULT_METHOD: &str = "GET";

/// The path half of a route: a literal path or a regular expression.
#[derive(Debug, Clone)]
pub enum RoutePath {
    Exact(String),
    Pattern(Regex),
}

/// Regular expression source text, compiled when the route is registered.
/// Fails with [Error::InvalidRouteKey] if it does not compile.
#[derive(Debug, Clone, Copy)]
pub struct Pattern<'a>(pub &'a str);

/// Anything that can be registered as a route path.
pub trait IntoRoutePath {
    fn into_route_path(self) -> Result<RoutePath, Error>;
}

impl IntoRoutePath for RoutePath {
    fn into_route_path(self) -> Result<RoutePath, Error> {
        Ok(self)
    }
}

impl IntoRoutePath for &str {
    fn into_route_path(self) -> Result<RoutePath, Error> {
        Ok(RoutePath::Exact(self.to_string()))
    }
}

impl IntoRoutePath for String {
    fn into_route_path(self) -> Result<RoutePath, Error> {
        Ok(RoutePath::Exact(self))
    }
}

impl IntoRoutePath for Regex {
    fn into_route_path(self) -> Result<RoutePath, Error> {
        Ok(RoutePath::Pattern(self))
    }
}

impl IntoRoutePath for &Regex {
    fn into_route_path(self) -> Result<RoutePath, Error> {
        Ok(RoutePath::Pattern(self.clone()))
    }
}

impl IntoRoutePath for Pattern<'_> {
    fn into_route_path(self) -> Result<RoutePath, Error> {
        Regex::new(self.0)
            .map(RoutePath::Pattern)
            .map_err(|err| Error::InvalidRouteKey {
                key: self.0.to_string(),
                reason: err.to_string(),
            })
    }
}

#[derive(Debug)]
struct PatternEntry {
    pattern: Regex,
    stub: Stub,
}

#[derive(Debug, Default)]
struct RouteTables {
    exact: HashMap<String, Stub>,
    patterns: BTreeMap<i64, Vec<PatternEntry>>,
}

/// Owns every registered [Stub] and resolves requests to them.
///
/// Lookups take a read lock, so concurrent requests never block each other.
/// Registration takes the write lock and is expected to happen while no
/// traffic is in flight, although interleaving is safe.
#[derive(Debug, Default)]
pub struct StubRegistry {
    tables: RwLock<RouteTables>,
}

impl StubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stub for `method` and `path` with the default priority.
    ///
    /// Registering the same exact route twice returns the stub that is
    /// already there, so behavior set on either handle applies to both.
    /// Registering the same pattern twice at one priority replaces the stub
    /// in place and returns the new one.
    ///
    /// An empty `path` means `method` is actually the path, and the method is
    /// `GET`: `register("/foo", "")` is `register("GET", "/foo")`.
    pub fn register(&self, method: &str, path: impl IntoRoutePath) -> Result<Stub, Error> {
        self.register_with_priority(method, path, PRIORITY_DEFAULT)
    }

    /// Registers a `GET` stub for `path`.
    pub fn register_get(&self, path: impl IntoRoutePath) -> Result<Stub, Error> {
        self.register(DEFAULT_METHOD, path)
    }

    /// Like [register](StubRegistry::register) with an explicit priority in
    /// `0..=100`. The priority only applies to pattern routes and is ignored
    /// for exact ones.
    pub fn register_with_priority(
        &self,
        method: &str,
        path: impl IntoRoutePath,
        priority: i64,
    ) -> Result<Stub, Error> {
        let (method, path) = route_args(method, path.into_route_path()?);

        match path {
            RoutePath::Exact(path) => {
                if path.is_empty() {
                    return Err(Error::InvalidRouteKey {
                        key: path,
                        reason: "route has neither a method nor a path".to_string(),
                    });
                }
                let key = exact_key(&method, &path);
                let mut tables = self.tables.write().expect("lock poisoned");
                let stub = tables.exact.entry(key).or_insert_with(|| {
                    debug!("String stub added: {} {}", method, path);
                    Stub::for_route(StubRoute::Exact {
                        method: method.clone(),
                        path: path.clone(),
                    })
                });
                Ok(stub.clone())
            }
            RoutePath::Pattern(pattern) => {
                if !(0..=PRIORITY_LIMIT).contains(&priority) {
                    return Err(Error::InvalidPriority(priority));
                }
                let stub = Stub::for_route(StubRoute::Pattern {
                    method: method.clone(),
                    pattern: pattern.as_str().to_string(),
                    priority,
                });
                let mut tables = self.tables.write().expect("lock poisoned");
                let bucket = tables.patterns.entry(priority).or_default();
                match bucket
                    .iter_mut()
                    .find(|entry| entry.pattern.as_str() == pattern.as_str())
                {
                    Some(entry) => {
                        debug!("Regex stub replaced: {} {} ({})", method, pattern, priority);
                        *entry = PatternEntry {
                            pattern,
                            stub: stub.clone(),
                        };
                    }
                    None => {
                        debug!("Regex stub added: {} {} ({})", method, pattern, priority);
                        bucket.push(PatternEntry {
                            pattern,
                            stub: stub.clone(),
                        });
                    }
                }
                Ok(stub)
            }
        }
    }

    /// Finds the stub for an incoming request. Exact routes win over
    /// patterns regardless of priority; among patterns, the highest priority
    /// wins and ties go to the first registered. The single-argument rule of
    /// [register](StubRegistry::register) applies to an empty `path`.
    pub fn resolve(&self, method: &str, path: &str) -> Option<Stub> {
        let (method, path) = match (method, path) {
            (method, "") => (DEFAULT_METHOD.to_string(), method),
            ("", path) => (DEFAULT_METHOD.to_string(), path),
            (method, path) => (method.to_uppercase(), path),
        };

        let tables = self.tables.read().expect("lock poisoned");
        if let Some(stub) = tables.exact.get(&exact_key(&method, path)) {
            debug!("Found string match: {} {}", method, path);
            return Some(stub.clone());
        }

        tables
            .patterns
            .values()
            .rev()
            .find_map(|entries| {
                let entry = entries.iter().find(|entry| entry.pattern.is_match(path))?;
                debug!(
                    "Found regular expression: {} {} (registered as {:?})",
                    method, path, entry.stub.route()
                );
                Some(entry.stub.clone())
            })
    }

    /// Drops every registered stub along with its call history.
    pub fn reset(&self) {
        *self.tables.write().expect("lock poisoned") = RouteTables::default();
        debug!("All stubs restored");
    }
}

fn route_args(method: &str, path: RoutePath) -> (String, RoutePath) {
    match path {
        RoutePath::Exact(path) if path.is_empty() => (
            DEFAULT_METHOD.to_string(),
            RoutePath::Exact(method.to_string()),
        ),
        path if method.is_empty() => (DEFAULT_METHOD.to_string(), path),
        path => (method.to_uppercase(), path),
    }
}

fn exact_key(method: &str, path: &str) -> String {
    format!("{} {}", method, path)
}
