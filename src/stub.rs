use std::{
    fmt::{self, Display},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, RwLock},
};

use hyper::{body::Bytes, HeaderMap};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// The value a [Stub] produces when invoked. The server turns it into a
/// status, body and content type:
///
/// | variant        | status          | body                          | content type       |
/// |----------------|-----------------|-------------------------------|--------------------|
/// | `Status(n)`    | `n`             | `"response"`                  | `text/plain`       |
/// | `Body(s)`      | 200             | `s`                           | `text/plain`       |
/// | `Structured`   | `status` or 200 | JSON for objects and arrays, text otherwise | depends on body |
/// | `Empty`        | 200             | `"response"`                  | `text/plain`       |
#[derive(Debug, Clone, PartialEq)]
pub enum StubReturn {
    Status(u16),
    Body(String),
    Structured {
        status: Option<u16>,
        body: Option<Value>,
    },
    Empty,
}

impl StubReturn {
    /// A structured return with a JSON (or scalar) body and the default status.
    pub fn json(body: Value) -> Self {
        Self::Structured {
            status: None,
            body: Some(body),
        }
    }

    pub fn status_and_body(status: u16, body: impl Into<Value>) -> Self {
        Self::Structured {
            status: Some(status),
            body: Some(body.into()),
        }
    }
}

impl Default for StubReturn {
    fn default() -> Self {
        Self::Empty
    }
}

impl From<u16> for StubReturn {
    fn from(status: u16) -> Self {
        Self::Status(status)
    }
}

impl From<&str> for StubReturn {
    fn from(body: &str) -> Self {
        Self::Body(body.to_string())
    }
}

impl From<String> for StubReturn {
    fn from(body: String) -> Self {
        Self::Body(body)
    }
}

impl From<()> for StubReturn {
    fn from(_: ()) -> Self {
        Self::Empty
    }
}

/// Numbers become a status, strings a body and objects are read for their
/// `status` and `body` keys. Anything else falls back to the defaults.
impl From<Value> for StubReturn {
    fn from(value: Value) -> Self {
        match value {
            Value::Number(n) => Self::Status(number_to_status(&n)),
            Value::String(s) => Self::Body(s),
            Value::Object(mut map) => Self::Structured {
                status: match map.get("status") {
                    Some(Value::Number(n)) => Some(number_to_status(n)),
                    _ => None,
                },
                body: map.remove("body"),
            },
            _ => Self::Empty,
        }
    }
}

// Floats are truncated toward zero. Numbers that do not fit a u16 map to 0,
// which is rejected as an invalid status when the response is built.
fn number_to_status(n: &serde_json::Number) -> u16 {
    let truncated = match n.as_u64() {
        Some(n) => Some(n),
        None => n
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| f.trunc() as u64),
    };
    truncated
        .and_then(|n| u16::try_from(n).ok())
        .unwrap_or(0)
}

/// The request context a [Stub] was invoked with.
#[derive(Debug, Clone, Default)]
pub struct StubCall {
    pub method: String,
    /// The request target as sent, including any query string.
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl StubCall {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// The url without its query string.
    pub fn path(&self) -> &str {
        self.url.split('?').next().unwrap_or_default()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// The route a [Stub] was registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubRoute {
    Exact {
        method: String,
        path: String,
    },
    /// Pattern routes match any method; `method` is the one given at
    /// registration.
    Pattern {
        method: String,
        pattern: String,
        priority: i64,
    },
}

impl StubRoute {
    pub fn method(&self) -> &str {
        match self {
            StubRoute::Exact { method, .. } | StubRoute::Pattern { method, .. } => method,
        }
    }
}

impl Display for StubRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StubRoute::Exact { method, path } => write!(f, "{} {}", method, path),
            StubRoute::Pattern {
                method,
                pattern,
                priority,
            } => write!(f, "{} /{}/ (priority {})", method, pattern, priority),
        }
    }
}

type ComputeFn = dyn Fn(&StubCall) -> Result<StubReturn, String> + Send + Sync;

#[derive(Clone, Default)]
enum Behavior {
    #[default]
    Unset,
    Fixed(StubReturn),
    Computed(Arc<ComputeFn>),
}

#[derive(Default)]
struct StubInner {
    route: Option<StubRoute>,
    behavior: RwLock<Behavior>,
    calls: Mutex<Vec<StubCall>>,
}

/// A registered route handler with settable behavior and a record of every
/// call made to it.
///
/// Cloning a stub is cheap and yields a handle to the same underlying stub,
/// so behavior set through one handle is seen by all of them. The call
/// history lives as long as the stub and is dropped when the registry is
/// reset.
#[derive(Clone, Default)]
pub struct Stub {
    inner: Arc<StubInner>,
}

impl Stub {
    /// Creates a stub that is not registered under any route.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn for_route(route: StubRoute) -> Self {
        Self {
            inner: Arc::new(StubInner {
                route: Some(route),
                ..Default::default()
            }),
        }
    }

    /// The route this stub was registered under, if any.
    pub fn route(&self) -> Option<&StubRoute> {
        self.inner.route.as_ref()
    }

    /// The method this stub was registered under, if any.
    pub fn method(&self) -> Option<&str> {
        self.route().map(StubRoute::method)
    }

    /// Makes every following call return `value`.
    pub fn returns(&self, value: impl Into<StubReturn>) -> &Self {
        *self.inner.behavior.write().expect("lock poisoned") = Behavior::Fixed(value.into());
        self
    }

    /// Makes every following call return the result of `f`. An error
    /// returned from `f`, or a panic inside it, makes the server answer with
    /// a 500.
    ///
    /// Infallible closures can wrap their value with
    /// [handle_ok](crate::handle_ok).
    pub fn returns_with<F, R, E>(&self, f: F) -> &Self
    where
        F: Fn(&StubCall) -> Result<R, E> + Send + Sync + 'static,
        R: Into<StubReturn>,
        E: Display,
    {
        let f: Arc<ComputeFn> =
            Arc::new(move |call: &StubCall| f(call).map(Into::into).map_err(|e| e.to_string()));
        *self.inner.behavior.write().expect("lock poisoned") = Behavior::Computed(f);
        self
    }

    /// Records `call` and produces the stub's return value.
    pub(crate) fn invoke(&self, call: StubCall) -> Result<StubReturn, String> {
        let behavior = self.inner.behavior.read().expect("lock poisoned").clone();
        let result = match behavior {
            Behavior::Unset => Ok(StubReturn::Empty),
            Behavior::Fixed(value) => Ok(value),
            Behavior::Computed(f) => panic::catch_unwind(AssertUnwindSafe(|| f(&call)))
                .unwrap_or_else(|_| Err("stub function panicked".to_string())),
        };
        self.inner.calls.lock().expect("lock poisoned").push(call);
        result
    }

    pub fn was_called(&self) -> bool {
        self.call_count() > 0
    }

    pub fn called_once(&self) -> bool {
        self.call_count() == 1
    }

    pub fn call_count(&self) -> usize {
        self.inner.calls.lock().expect("lock poisoned").len()
    }

    /// Returns a snapshot of all calls, oldest first.
    pub fn calls(&self) -> Vec<StubCall> {
        self.inner.calls.lock().expect("lock poisoned").clone()
    }

    pub fn call(&self, n: usize) -> Option<StubCall> {
        self.inner.calls.lock().expect("lock poisoned").get(n).cloned()
    }

    pub fn last_call(&self) -> Option<StubCall> {
        self.inner.calls.lock().expect("lock poisoned").last().cloned()
    }

    /// Returns true if both handles point at the same stub.
    pub fn ptr_eq(a: &Stub, b: &Stub) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let behavior = match &*self.inner.behavior.read().expect("lock poisoned") {
            Behavior::Unset => "unset".to_string(),
            Behavior::Fixed(value) => format!("{:?}", value),
            Behavior::Computed(_) => "computed".to_string(),
        };
        f.debug_struct("Stub")
            .field("route", &self.inner.route)
            .field("behavior", &behavior)
            .field("call_count", &self.call_count())
            .finish()
    }
}
