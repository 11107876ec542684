//! Iteration control: which packages run, and when a run stops.
//!
//! The run loop consults an [`IterationController`] before and after every
//! package. [`SearchMode`] is the stock implementation; it covers running
//! everything, starting at a pattern, running a single match, and resuming an
//! interrupted run from a marker persisted on disk.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by the iteration controller.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid package pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("resume state I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("resume state is corrupt: {0}")]
    State(#[from] serde_json::Error),
}

/// Shell-style pattern over package identifiers (`*` and `?` wildcards).
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Option<Regex>,
}

impl Pattern {
    pub fn new(glob: &str) -> Result<Self, SearchError> {
        let mut re = String::with_capacity(glob.len() + 4);
        re.push('^');
        let mut literal = String::new();
        for c in glob.chars() {
            match c {
                '*' | '?' => {
                    re.push_str(&regex::escape(&literal));
                    literal.clear();
                    re.push_str(if c == '*' { ".*" } else { "." });
                }
                _ => literal.push(c),
            }
        }
        re.push_str(&regex::escape(&literal));
        re.push('$');
        Ok(Self {
            source: glob.to_string(),
            regex: Some(Regex::new(&re)?),
        })
    }

    /// Matches every identifier.
    pub fn any() -> Self {
        Self {
            source: "*".to_string(),
            regex: None,
        }
    }

    pub fn matches(&self, id: &str) -> bool {
        self.regex.as_ref().map_or(true, |re| re.is_match(id))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

/// Where the iteration cursor stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorState {
    /// Nothing has been considered yet.
    NotStarted,
    /// Packages are being passed over.
    Scanning,
    /// At least one package has been activated.
    Activated,
    /// A finding stopped the run.
    Aborted,
    /// `finish` has run.
    Finished,
}

/// Decides which packages run and whether the run stops early.
///
/// Call order per package: `should_activate`, then (if active) `skip_notice`,
/// then, once the package has an outcome, `should_abort`. `finish` is called
/// exactly once after the last decision.
pub trait IterationController: Send {
    /// Whether `id` should be processed.
    fn should_activate(&mut self, id: &str) -> bool;

    /// Whether an active package is excluded by policy and must be passed over.
    fn skip_notice(&mut self, id: &str) -> bool;

    fn has_activated_any(&self) -> bool;

    /// Called after every outcome; `true` stops further dispatch.
    fn should_abort(&mut self, id: &str, finding: bool) -> bool;

    /// Release any persisted state.
    fn finish(&mut self) -> Result<(), SearchError>;

    /// Whether the controller runs a single package and then stops.
    fn stops_after_first(&self) -> bool {
        false
    }

    /// The run-one-then-stop short-circuit.
    fn exhausted(&self) -> bool {
        self.stops_after_first() && self.has_activated_any()
    }

    fn state(&self) -> CursorState;
}

/// Selection policy of a [`SearchMode`].
#[derive(Debug, Clone)]
pub enum SearchPolicy {
    /// Everything is active.
    Immediate { abort_on_finding: bool },
    /// Everything is active and findings never stop the run.
    All,
    /// Inactive until the first match of the pattern, active afterwards.
    StartAt(Pattern),
    /// Only the first match of the pattern runs.
    Only(Pattern),
    /// Inactive until the marker package, active afterwards. No marker means everything.
    Resume { marker: Option<String> },
}

impl SearchPolicy {
    fn abort_on_finding(&self) -> bool {
        match self {
            SearchPolicy::Immediate { abort_on_finding } => *abort_on_finding,
            SearchPolicy::All => false,
            SearchPolicy::StartAt(_) | SearchPolicy::Only(_) | SearchPolicy::Resume { .. } => true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SearchPolicy::Immediate { .. } => "immediate",
            SearchPolicy::All => "all",
            SearchPolicy::StartAt(_) => "search",
            SearchPolicy::Only(_) => "only",
            SearchPolicy::Resume { .. } => "resume",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ResumeMarker {
    package: String,
    updated_at: DateTime<Utc>,
}

/// Location of the resume marker for a catalog.
pub fn resume_state_path(state_dir: &Path, catalog_digest: &str) -> PathBuf {
    let short = catalog_digest.get(..16).unwrap_or(catalog_digest);
    state_dir.join(format!("resume-{short}.json"))
}

/// Stock [`IterationController`].
#[derive(Debug)]
pub struct SearchMode {
    policy: SearchPolicy,
    state: CursorState,
    scan_active: bool,
    activated: usize,
    may_fail: Vec<Pattern>,
    skips: BTreeMap<String, String>,
    resume_file: Option<PathBuf>,
    aborted_at: Option<String>,
    in_flight: Vec<String>,
}

impl SearchMode {
    fn with_policy(policy: SearchPolicy) -> Self {
        Self {
            policy,
            state: CursorState::NotStarted,
            scan_active: false,
            activated: 0,
            may_fail: Vec::new(),
            skips: BTreeMap::new(),
            resume_file: None,
            aborted_at: None,
            in_flight: Vec::new(),
        }
    }

    /// Everything runs; findings do not stop the run.
    pub fn immediate() -> Self {
        Self::with_policy(SearchPolicy::Immediate {
            abort_on_finding: false,
        })
    }

    pub fn all() -> Self {
        Self::with_policy(SearchPolicy::All)
    }

    pub fn start_at(glob: &str) -> Result<Self, SearchError> {
        Ok(Self::with_policy(SearchPolicy::StartAt(Pattern::new(glob)?)))
    }

    pub fn only(glob: &str) -> Result<Self, SearchError> {
        Ok(Self::with_policy(SearchPolicy::Only(Pattern::new(glob)?)))
    }

    /// Run the first package in order, then stop.
    pub fn only_first() -> Self {
        Self::with_policy(SearchPolicy::Only(Pattern::any()))
    }

    /// Resume from an in-memory marker, without persistence.
    pub fn resume_from(marker: Option<String>) -> Self {
        Self::with_policy(SearchPolicy::Resume { marker })
    }

    /// Resume from the marker stored at `path` (if any) and keep it updated.
    pub fn resume_with_state(path: impl Into<PathBuf>) -> Result<Self, SearchError> {
        let path = path.into();
        let marker = match std::fs::read_to_string(&path) {
            Ok(json) => {
                let stored: ResumeMarker = serde_json::from_str(&json)?;
                info!(marker = %stored.package, path = %path.display(), "Resuming run");
                Some(stored.package)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let mut mode = Self::resume_from(marker);
        mode.resume_file = Some(path);
        Ok(mode)
    }

    /// Findings on packages matching `pattern` never stop the run.
    pub fn with_may_fail(mut self, pattern: Pattern) -> Self {
        self.may_fail.push(pattern);
        self
    }

    /// Packages excluded by policy, with reasons.
    pub fn with_skips(mut self, skips: BTreeMap<String, String>) -> Self {
        self.skips = skips;
        self
    }

    /// Override the abort policy of `Immediate`; ignored by other policies.
    pub fn with_abort_on_finding(mut self, abort: bool) -> Self {
        if let SearchPolicy::Immediate { abort_on_finding } = &mut self.policy {
            *abort_on_finding = abort;
        }
        self
    }

    pub fn policy(&self) -> &SearchPolicy {
        &self.policy
    }

    pub fn skip_reason(&self, id: &str) -> Option<&str> {
        self.skips.get(id).map(String::as_str)
    }

    fn may_fail(&self, id: &str) -> bool {
        self.may_fail.iter().any(|p| p.matches(id))
    }

    fn retire(&mut self, id: &str) {
        if let Some(pos) = self.in_flight.iter().position(|p| p == id) {
            self.in_flight.remove(pos);
        }
    }

    fn persist(&self, package: &str) -> Result<(), SearchError> {
        let Some(path) = &self.resume_file else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let marker = ResumeMarker {
            package: package.to_string(),
            updated_at: Utc::now(),
        };
        std::fs::write(path, serde_json::to_string(&marker)?)?;
        Ok(())
    }

    /// Record the oldest unfinished package so a resume restarts there.
    fn persist_oldest(&self) {
        if let Some(oldest) = self.in_flight.first() {
            if let Err(e) = self.persist(oldest) {
                warn!(error = %e, "Failed to persist resume marker");
            }
        }
    }

    fn is_active(&mut self, id: &str) -> bool {
        match &self.policy {
            SearchPolicy::Immediate { .. } | SearchPolicy::All => true,
            SearchPolicy::StartAt(pattern) => {
                if !self.scan_active && pattern.matches(id) {
                    self.scan_active = true;
                }
                self.scan_active
            }
            SearchPolicy::Only(pattern) => self.activated == 0 && pattern.matches(id),
            SearchPolicy::Resume { marker: None } => true,
            SearchPolicy::Resume { marker: Some(marker) } => {
                if !self.scan_active && marker == id {
                    self.scan_active = true;
                }
                self.scan_active
            }
        }
    }

    fn never_matched(&self) -> Option<String> {
        match &self.policy {
            SearchPolicy::StartAt(p) if !self.scan_active => Some(p.to_string()),
            SearchPolicy::Only(p) if self.activated == 0 => Some(p.to_string()),
            SearchPolicy::Resume { marker: Some(m) } if !self.scan_active => Some(m.clone()),
            _ => None,
        }
    }
}

impl IterationController for SearchMode {
    fn should_activate(&mut self, id: &str) -> bool {
        if matches!(self.state, CursorState::Aborted | CursorState::Finished) {
            return false;
        }
        if !self.is_active(id) {
            if self.state == CursorState::NotStarted {
                self.state = CursorState::Scanning;
            }
            debug!(package = %id, "Passing over package");
            return false;
        }
        self.state = CursorState::Activated;
        self.activated += 1;
        self.in_flight.push(id.to_string());
        self.persist_oldest();
        true
    }

    fn skip_notice(&mut self, id: &str) -> bool {
        if self.skips.contains_key(id) {
            self.retire(id);
            return true;
        }
        false
    }

    fn has_activated_any(&self) -> bool {
        self.activated > 0
    }

    fn should_abort(&mut self, id: &str, finding: bool) -> bool {
        self.retire(id);
        self.persist_oldest();
        if self.state == CursorState::Aborted {
            return true;
        }
        if finding && self.policy.abort_on_finding() && !self.may_fail(id) {
            warn!(package = %id, mode = self.policy.name(), "Finding stops the run");
            self.state = CursorState::Aborted;
            self.aborted_at = Some(id.to_string());
            return true;
        }
        self.exhausted()
    }

    fn finish(&mut self) -> Result<(), SearchError> {
        if self.state == CursorState::Finished {
            warn!("Iteration controller finished twice");
            return Ok(());
        }
        if let Some(pattern) = self.never_matched() {
            warn!(pattern = %pattern, mode = self.policy.name(), "No package matched; nothing was activated");
        }
        let aborted = self.state == CursorState::Aborted;
        self.state = CursorState::Finished;

        let Some(path) = self.resume_file.clone() else {
            return Ok(());
        };
        match (aborted, self.aborted_at.clone()) {
            (true, Some(package)) => self.persist(&package),
            // interrupted: the marker already names the oldest unfinished package
            _ if !self.in_flight.is_empty() => Ok(()),
            _ => match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    fn stops_after_first(&self) -> bool {
        matches!(self.policy, SearchPolicy::Only(_))
    }

    fn state(&self) -> CursorState {
        self.state
    }
}
