use std::{
    fmt,
    future::Future,
    ops::Deref,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    },
    task::{Context, Poll},
};

use pin_project::pin_project;
use tracing::{debug_span, instrument::Instrumented, Instrument as _};

static GLOBAL_PROCESS_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Process identifier.
///
/// A simple, numeric identifier that uniquely identifies a process. Every started instance of a child gets a fresh
/// identifier, so restarts are distinguishable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Id(usize);

impl Id {
    fn new() -> Self {
        Self(GLOBAL_PROCESS_ID_COUNTER.fetch_add(1, Relaxed))
    }

    /// Returns the identifier as a `usize`.
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// Process name.
///
/// A human-readable name for a process that only contains alphanumeric characters, underscores, and periods.
///
/// Process names are scoped, such that the resulting process name is nested. For example, if a supervisor has a name of
/// `root_sup`, and a child process is added to that supervisor with a name of `worker`, the resulting process name for
/// the child process will be `root_sup.worker`.
///
/// Invalid characters, such as hyphens or spaces, are replaced with underscores. Not guaranteed to be unique.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Name(Arc<str>);

impl Name {
    pub(crate) fn root<N: AsRef<str>>(name: N) -> Option<Self> {
        let sanitized = get_sanitized_name(name.as_ref());
        if sanitized.is_empty() {
            return None;
        }

        Some(Self(sanitized))
    }

    pub(crate) fn scoped<N: AsRef<str>>(parent: &Name, name: N) -> Option<Self> {
        let sanitized = get_sanitized_name(name.as_ref());
        if sanitized.is_empty() {
            return None;
        }

        Some(Self(format!("{}.{}", parent.0, sanitized).into()))
    }
}

impl Deref for Name {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A runtime process.
///
/// Identifies one running instance of a supervisor or worker within the supervision tree.
#[derive(Clone, Debug)]
pub struct Process {
    id: Id,
    name: Name,
}

impl Process {
    pub(crate) fn root<N: AsRef<str>>(name: N) -> Option<Self> {
        Name::root(name).map(|name| Self { id: Id::new(), name })
    }

    pub(crate) fn scoped<N: AsRef<str>>(name: N, parent: &Process) -> Option<Self> {
        Name::scoped(&parent.name, name).map(|name| Self { id: Id::new(), name })
    }

    /// Returns the process identifier.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns the hierarchical process name.
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Wraps the given future so that it executes within this process's `tracing` span.
    pub fn into_instrumented<F>(self, inner: F) -> InstrumentedProcess<F>
    where
        F: Future,
    {
        InstrumentedProcess::new(self, inner)
    }
}

/// An instrumented process.
#[pin_project]
pub struct InstrumentedProcess<F> {
    #[pin]
    inner: Instrumented<F>,
}

impl<F> InstrumentedProcess<F>
where
    F: Future,
{
    fn new(process: Process, inner: F) -> Self {
        let span = debug_span!(
            "process",
            process_id = process.id().as_usize(),
            process_name = &*process.name,
        );

        Self {
            inner: inner.instrument(span),
        }
    }
}

impl<F> Future for InstrumentedProcess<F>
where
    F: Future,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().inner.poll(cx)
    }
}

/// Helper trait for running process futures with instrumentation.
pub trait ProcessExt {
    /// Converts the process future into an instrumented future.
    fn into_instrumented(self, process: Process) -> InstrumentedProcess<Self>
    where
        Self: Future + Sized;
}

impl<F> ProcessExt for F
where
    F: Future,
{
    fn into_instrumented(self, process: Process) -> InstrumentedProcess<Self>
    where
        Self: Future + Sized,
    {
        process.into_instrumented(self)
    }
}

fn is_process_name_segment_valid(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    // Segments must start and end with an alphanumeric character, and may only contain alphanumerics and underscores
    // in between. Periods are reserved as the separator between segments.
    name.starts_with(|c: char| c.is_alphanumeric())
        && name.ends_with(|c: char| c.is_alphanumeric())
        && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn get_sanitized_name(name: &str) -> Arc<str> {
    if is_process_name_segment_valid(name) {
        return name.into();
    }

    // Collapse every run of invalid characters (and underscores) into a single underscore.
    let mut sanitized = String::with_capacity(name.len());
    let mut last_was_underscore = true;
    for c in name.chars() {
        if c.is_alphanumeric() {
            sanitized.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            sanitized.push('_');
            last_was_underscore = true;
        }
    }

    Arc::from(sanitized.trim_matches(|c: char| !c.is_alphanumeric()))
}
