//! Structured reporting of protocol and synchronization anomalies.
//!
//! Things that are wrong but survivable (a malformed frame, a server message from a joiner, an
//! overflowing event queue) are not returned as errors: the offending input is dropped and the
//! session carries on. They are still reported here as structured [`SpecViolation`]s so they can
//! be:
//!
//! - logged via `tracing` (the default, through [`TracingObserver`])
//! - collected programmatically in tests (through [`CollectingObserver`])
//! - forwarded to any custom [`ViolationObserver`]
//!
//! # Example
//!
//! ```
//! use lockstep_mesh::telemetry::{CollectingObserver, ViolationKind};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! assert!(!observer.has_violation(ViolationKind::NetworkProtocol));
//! ```

use crate::Frame;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Serializes `Option<Frame>` as a plain integer, or `null` for `None` and [`Frame::NULL`].
#[cfg(feature = "json")]
mod frame_serializer {
    use crate::Frame;
    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(frame: &Option<Frame>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match frame {
            Some(f) if f.is_valid() => serializer.serialize_i32(f.as_i32()),
            _ => serializer.serialize_none(),
        }
    }
}

/// Severity of a reported violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected input was dropped; nothing else was affected.
    Warning,
    /// A peer was removed or data was lost.
    Error,
    /// Local bookkeeping is inconsistent.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subsystem a violation belongs to.
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]`. Always include a wildcard arm when matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Bad wire data: malformed frames, unparsable payloads, unknown kinds.
    NetworkProtocol,
    /// A message that is well-formed but illegal in the current connection state, such as a
    /// server message from a non-host peer or a handshake for an unknown name.
    Handshake,
    /// Lockstep accounting: divergence, eviction, batches from outside the sync set.
    Synchronization,
    /// Transport failures that cost a peer.
    Transport,
    /// The application event queue overflowed.
    EventQueue,
    /// Invalid configuration values.
    Configuration,
    /// Internal bookkeeping went wrong. Please report these.
    InternalError,
    /// A type's structural invariant was found broken.
    Invariant,
}

impl ViolationKind {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkProtocol => "network_protocol",
            Self::Handshake => "handshake",
            Self::Synchronization => "synchronization",
            Self::Transport => "transport",
            Self::EventQueue => "event_queue",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
            Self::Invariant => "invariant",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded violation with enough context to diagnose it.
///
/// # Example
///
/// ```
/// use lockstep_mesh::telemetry::{SpecViolation, ViolationKind, ViolationSeverity};
/// use lockstep_mesh::Frame;
///
/// let violation = SpecViolation::new(
///     ViolationSeverity::Error,
///     ViolationKind::Synchronization,
///     "peer diverged",
///     "sync_layer.rs:1",
/// )
/// .with_frame(Frame::new(12))
/// .with_context("peer", "mallory");
///
/// assert_eq!(violation.context["peer"], "mallory");
/// assert!(violation.to_string().contains("frame=12"));
/// ```
#[derive(Debug, Clone, serde::Serialize)]
pub struct SpecViolation {
    /// The severity level of this violation.
    pub severity: ViolationSeverity,
    /// The subsystem where the violation occurred.
    pub kind: ViolationKind,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Source location where the violation was detected (file:line).
    pub location: &'static str,
    /// The lockstep frame at which the violation occurred, if applicable.
    #[cfg_attr(
        feature = "json",
        serde(serialize_with = "frame_serializer::serialize")
    )]
    pub frame: Option<Frame>,
    /// Additional structured context as key-value pairs.
    pub context: BTreeMap<String, String>,
}

impl SpecViolation {
    /// Creates a new violation.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            frame: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the frame at which this violation occurred.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Adds a context key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Serializes this violation to a JSON string.
    ///
    /// Returns `None` if serialization fails.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl std::fmt::Display for SpecViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(frame) = self.frame {
            write!(f, ", frame={frame}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Receives every violation a session reports.
///
/// # Example
///
/// ```
/// use lockstep_mesh::telemetry::{SpecViolation, ViolationObserver};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(Default)]
/// struct Counter(AtomicUsize);
///
/// impl ViolationObserver for Counter {
///     fn on_violation(&self, _violation: &SpecViolation) {
///         self.0.fetch_add(1, Ordering::Relaxed);
///     }
/// }
/// ```
#[cfg(feature = "sync-send")]
pub trait ViolationObserver: Send + Sync {
    /// Called when a violation is detected. Called from inside the poll loop, so keep it quick.
    fn on_violation(&self, violation: &SpecViolation);
}

#[cfg(not(feature = "sync-send"))]
/// Receives every violation a session reports.
pub trait ViolationObserver {
    /// Called when a violation is detected. Called from inside the poll loop, so keep it quick.
    fn on_violation(&self, violation: &SpecViolation);
}

/// Default observer: forwards violations to `tracing`.
///
/// `Warning` maps to `tracing::warn!`; `Error` and `Critical` map to `tracing::error!`. The
/// severity, kind, location, frame and context are emitted as structured fields.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates a new tracing observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn format_frame(frame: Option<Frame>) -> String {
        match frame {
            Some(f) if f.is_valid() => f.as_i32().to_string(),
            _ => "null".to_owned(),
        }
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &SpecViolation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let frame_str = Self::format_frame(violation.frame);
        let context_str = {
            let pairs: Vec<String> = violation
                .context
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        };

        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(
                    severity,
                    kind,
                    location,
                    frame = %frame_str,
                    context = %context_str,
                    "{}",
                    violation.message
                );
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(
                    severity,
                    kind,
                    location,
                    frame = %frame_str,
                    context = %context_str,
                    "{}",
                    violation.message
                );
            },
        }
    }
}

/// Observer that stores every violation, for assertions in tests.
///
/// # Example
///
/// ```
/// use lockstep_mesh::telemetry::{
///     CollectingObserver, SpecViolation, ViolationKind, ViolationObserver, ViolationSeverity,
/// };
///
/// let observer = CollectingObserver::new();
/// observer.on_violation(&SpecViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::Handshake,
///     "unexpected PeerConnect",
///     "test.rs:1",
/// ));
/// assert_eq!(observer.len(), 1);
/// assert!(observer.has_violation(ViolationKind::Handshake));
/// ```
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<SpecViolation>>,
}

impl CollectingObserver {
    /// Creates a new collecting observer with an empty violation list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            violations: Mutex::new(Vec::new()),
        }
    }

    /// Returns a copy of all collected violations.
    #[must_use]
    pub fn violations(&self) -> Vec<SpecViolation> {
        self.violations.lock().clone()
    }

    /// Returns the number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Returns true if no violations have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Checks if any violation of the specified kind has been collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Returns all violations matching the specified kind.
    #[must_use]
    pub fn violations_of_kind(&self, kind: ViolationKind) -> Vec<SpecViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect()
    }

    /// Clears all collected violations.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &SpecViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Reports a violation through the default [`TracingObserver`], tagging it with the call site.
///
/// ```text
/// report_violation!(severity, kind, "message");
/// report_violation!(severity, kind, "message with {}", format_args);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::SpecViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::SpecViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Asserts that no violations have been collected.
///
/// # Panics
///
/// Panics if the observer holds any violation.
#[macro_export]
macro_rules! assert_no_violations {
    ($observer:expr) => {{
        let violations = $observer.violations();
        assert!(
            violations.is_empty(),
            "Expected no violations, but found {}:\n{:#?}",
            violations.len(),
            violations
        );
    }};
}

/// Asserts that a violation of the specified kind was collected.
///
/// # Panics
///
/// Panics if no violation of the specified kind was found.
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "Expected violation of kind {:?}, but found: {:#?}",
            $kind,
            $observer.violations()
        );
    }};
}

/// Reports a violation to an optional observer, falling back to [`TracingObserver`] if `None`.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &SpecViolation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation through a session's optional observer.
///
/// ```text
/// report_violation_to!(observer, severity, kind, "message");
/// report_violation_to!(observer, severity, kind, "message with {}", format_args);
/// ```
///
/// # Example
///
/// ```
/// use lockstep_mesh::{report_violation_to, telemetry::{CollectingObserver, ViolationKind, ViolationObserver, ViolationSeverity}};
/// use std::sync::Arc;
///
/// let collector = Arc::new(CollectingObserver::new());
/// let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
/// report_violation_to!(observer, ViolationSeverity::Warning, ViolationKind::EventQueue, "dropped {} events", 3);
/// assert!(collector.has_violation(ViolationKind::EventQueue));
/// ```
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::SpecViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::SpecViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

/// Describes a broken structural invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    /// Name of the type whose invariant was violated.
    pub type_name: &'static str,
    /// Description of the violated invariant.
    pub invariant: String,
    /// Additional diagnostic context.
    pub details: Option<String>,
}

impl InvariantViolation {
    /// Creates a new invariant violation.
    #[must_use]
    pub fn new(type_name: &'static str, invariant: impl Into<String>) -> Self {
        Self {
            type_name,
            invariant: invariant.into(),
            details: None,
        }
    }

    /// Adds additional details to the violation.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.type_name, self.invariant)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

/// Types with structural invariants that can be checked at runtime.
pub trait InvariantChecker {
    /// Returns `Ok(())` if all invariants hold, or the first broken one.
    fn check_invariants(&self) -> Result<(), InvariantViolation>;
}

/// Checks invariants in debug builds (or with the `paranoid` feature) and reports failures as
/// critical violations. Compiles to nothing otherwise.
#[macro_export]
#[cfg(any(debug_assertions, feature = "paranoid"))]
macro_rules! debug_check_invariants {
    ($expr:expr, $context:expr) => {{
        use $crate::telemetry::InvariantChecker as _;
        if let Err(violation) = $expr.check_invariants() {
            $crate::report_violation!(
                $crate::telemetry::ViolationSeverity::Critical,
                $crate::telemetry::ViolationKind::Invariant,
                "{} [context: {}]",
                violation,
                $context
            );
        }
    }};
}

/// No-op version for release builds without `paranoid` feature.
#[macro_export]
#[cfg(not(any(debug_assertions, feature = "paranoid")))]
macro_rules! debug_check_invariants {
    ($expr:expr, $context:expr) => {{}};
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn sample(kind: ViolationKind) -> SpecViolation {
        SpecViolation::new(ViolationSeverity::Warning, kind, "sample", "test.rs:1")
    }

    #[test]
    fn severity_ordering() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn kind_labels() {
        assert_eq!(ViolationKind::NetworkProtocol.as_str(), "network_protocol");
        assert_eq!(ViolationKind::Handshake.to_string(), "handshake");
        assert_eq!(ViolationKind::EventQueue.as_str(), "event_queue");
    }

    #[test]
    fn display_includes_frame_and_context() {
        let violation = sample(ViolationKind::Synchronization)
            .with_frame(Frame::new(7))
            .with_context("peer", "bob");
        let text = violation.to_string();
        assert!(text.starts_with("[warning/synchronization] sample"));
        assert!(text.contains("frame=7"));
        assert!(text.contains("bob"));
    }

    #[test]
    fn collecting_observer_filters_and_clears() {
        let observer = CollectingObserver::new();
        observer.on_violation(&sample(ViolationKind::Handshake));
        observer.on_violation(&sample(ViolationKind::Transport));
        observer.on_violation(&sample(ViolationKind::Handshake));

        assert_eq!(observer.len(), 3);
        assert_eq!(observer.violations_of_kind(ViolationKind::Handshake).len(), 2);
        assert!(!observer.has_violation(ViolationKind::EventQueue));

        observer.clear();
        assert!(observer.is_empty());
        assert_no_violations!(observer);
    }

    #[test]
    fn report_to_observer_prefers_the_given_observer() {
        let collector = Arc::new(CollectingObserver::new());
        report_to_observer(Some(&collector), &sample(ViolationKind::Configuration));
        assert_violation!(collector, ViolationKind::Configuration);

        // Falls back to tracing without panicking.
        report_to_observer::<CollectingObserver>(None, &sample(ViolationKind::Configuration));
    }

    #[test]
    fn report_violation_to_macro_with_none_observer() {
        let observer: Option<Arc<dyn ViolationObserver>> = None;
        report_violation_to!(
            observer,
            ViolationSeverity::Error,
            ViolationKind::Transport,
            "lost {}",
            "alice"
        );
    }

    #[test]
    fn report_violation_macro_forms() {
        report_violation!(
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "plain"
        );
        report_violation!(
            ViolationSeverity::Critical,
            ViolationKind::InternalError,
            "formatted {}",
            1
        );
    }

    struct Bounded {
        value: u32,
        max: u32,
    }

    impl InvariantChecker for Bounded {
        fn check_invariants(&self) -> Result<(), InvariantViolation> {
            if self.value > self.max {
                return Err(InvariantViolation::new("Bounded", "value exceeds maximum")
                    .with_details(format!("value={}, max={}", self.value, self.max)));
            }
            Ok(())
        }
    }

    #[test]
    fn invariant_checker_reports_details() {
        assert!(Bounded { value: 1, max: 2 }.check_invariants().is_ok());
        let err = Bounded { value: 3, max: 2 }.check_invariants().unwrap_err();
        assert_eq!(err.to_string(), "Bounded: value exceeds maximum (value=3, max=2)");
        debug_check_invariants!(Bounded { value: 3, max: 2 }, "test");
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_output_uses_plain_frame_numbers() {
        let json = sample(ViolationKind::Synchronization)
            .with_frame(Frame::new(42))
            .to_json()
            .unwrap();
        assert!(json.contains(r#""frame":42"#));
        assert!(json.contains(r#""kind":"synchronization""#));

        let json = sample(ViolationKind::Synchronization)
            .with_frame(Frame::NULL)
            .to_json()
            .unwrap();
        assert!(json.contains(r#""frame":null"#));
    }
}
