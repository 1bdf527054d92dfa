// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Targets: the nodes of the dependency graph.
//!
//! Targets are interned in the [`store::TargetStore`] and referenced
//! through `Arc`s for the lifetime of the build context. All per-action
//! state sits in [`OpState`] slots guarded by the `task_count` lifecycle
//! word; a thread may read or mutate a slot only while it holds the
//! target (busy) or after observing `applied`/`executed`.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use thiserror::Error;

use crate::action::{Action, Operation};
use crate::mtime::Timestamp;
use crate::rule::{Recipe, Rule};
use crate::variable::{Value, VariableMap};

pub use self::types::TargetType;

pub mod store;
pub mod types;

/// Lifecycle offsets within one operation's span of the task count.
///
/// Values rest at untouched (0), `applied` or `executed`; `busy` marks a
/// transition in progress and is what losers park on. The per-operation
/// stride is 5, so finishing a batch operation leaves every target's
/// `executed` count equal to the next operation's `untouched`.
pub mod offset {
    pub const TOUCHED: usize = 1;
    pub const TRIED: usize = 2;
    pub const MATCHED: usize = 3;
    pub const APPLIED: usize = 4;
    pub const EXECUTED: usize = 5;
    pub const BUSY: usize = 7;

    /// Task-count advance per operation in a batch
    pub const STRIDE: usize = 5;
}

/// Per-action result state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
#[repr(u8)]
pub enum TargetState {
    Unknown = 0,
    Unchanged,
    Changed,
    Failed,
    /// Sentinel: state/mtime are inherited from the group target
    Group,
    /// Execution deferred to a later dependent (last mode)
    Postponed,
}

impl TargetState {
    fn from_u8(raw: u8) -> TargetState {
        match raw {
            1 => TargetState::Unchanged,
            2 => TargetState::Changed,
            3 => TargetState::Failed,
            4 => TargetState::Group,
            5 => TargetState::Postponed,
            _ => TargetState::Unknown,
        }
    }
}

/// A declared prerequisite edge, as handed over by the loader.
#[derive(Debug, Clone)]
pub struct Prerequisite {
    pub ttype: &'static TargetType,

    /// Directory part; relative against the dependent's dir
    pub dir: Option<PathBuf>,

    pub name: String,
    pub ext: Option<String>,
}

impl Prerequisite {
    pub fn new(ttype: &'static TargetType, name: impl ToString) -> Self {
        Self {
            ttype,
            dir: None,
            name: name.to_string(),
            ext: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_ext(mut self, ext: impl ToString) -> Self {
        self.ext = Some(ext.to_string());
        self
    }
}

impl fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{{}}}", self.ttype.name, self.name)
    }
}

/// A resolved prerequisite entry in a dependent's per-action list.
///
/// `data` is a rule-owned marker word (e.g. the "already updated" flag of
/// the execution helpers); `adhoc` and `unmatched` are the two stolen
/// marker bits.
#[derive(Clone)]
pub struct PrerequisiteTarget {
    pub target: Arc<Target>,
    pub adhoc: bool,

    /// Cleared from execution by a successful unmatch; neither executed
    /// nor consulted for out-of-date comparison.
    pub unmatched: bool,

    pub data: u64,
}

impl PrerequisiteTarget {
    pub fn new(target: Arc<Target>) -> Self {
        Self {
            target,
            adhoc: false,
            unmatched: false,
            data: 0,
        }
    }
}

/// Per-action (per-operation) state slot.
pub struct OpState {
    /// The lifecycle word; see [`offset`]
    pub task_count: AtomicUsize,

    /// Countdown of dependents still to execute us
    pub dependents: AtomicUsize,

    rule: RwLock<Option<Arc<dyn Rule>>>,
    recipe: RwLock<Option<Recipe>>,
    state: AtomicU8,

    pub prerequisite_targets: RwLock<Vec<PrerequisiteTarget>>,

    /// Rule-specific variables, first layer of target lookup
    pub vars: RwLock<VariableMap>,
}

impl Default for OpState {
    fn default() -> Self {
        Self {
            task_count: AtomicUsize::new(0),
            dependents: AtomicUsize::new(0),
            rule: RwLock::default(),
            recipe: RwLock::default(),
            state: AtomicU8::new(TargetState::Unknown as u8),
            prerequisite_targets: RwLock::default(),
            vars: RwLock::default(),
        }
    }
}

impl OpState {
    pub fn state(&self) -> TargetState {
        TargetState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TargetState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn rule(&self) -> Option<Arc<dyn Rule>> {
        self.rule.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_rule(&self, rule: Arc<dyn Rule>) {
        *self.rule.write().unwrap_or_else(|e| e.into_inner()) = Some(rule);
    }

    pub fn recipe(&self) -> Option<Recipe> {
        self.recipe.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_recipe(&self, recipe: Recipe) {
        *self.recipe.write().unwrap_or_else(|e| e.into_inner()) = Some(recipe);
    }
}

/// Write-once path state of a path target
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathState {
    Unset,
    /// An empty path is the legal "location unknown" marker
    Set(PathBuf),
}

/// A uniquely-keyed node in the dependency graph.
pub struct Target {
    pub ttype: &'static TargetType,

    /// Absolute, normalized output directory
    pub dir: PathBuf,

    /// Empty for out-tree targets; the out directory for src-tree ones
    pub out: PathBuf,

    pub name: String,

    ext: OnceLock<Option<String>>,
    implied: AtomicBool,

    group: OnceLock<Weak<Target>>,
    member: OnceLock<Arc<Target>>,

    prerequisites: OnceLock<Vec<Prerequisite>>,
    vars: RwLock<VariableMap>,

    path: RwLock<PathState>,
    mtime: AtomicI64,

    opstate: [OpState; Operation::COUNT],
}

impl Target {
    pub(crate) fn new(
        ttype: &'static TargetType,
        dir: PathBuf,
        out: PathBuf,
        name: String,
        ext: Option<Option<String>>,
        implied: bool,
    ) -> Self {
        let ext_cell = OnceLock::new();
        if let Some(e) = ext {
            let _ = ext_cell.set(e);
        }

        Self {
            ttype,
            dir,
            out,
            name,
            ext: ext_cell,
            implied: AtomicBool::new(implied),
            group: OnceLock::new(),
            member: OnceLock::new(),
            prerequisites: OnceLock::new(),
            vars: RwLock::default(),
            path: RwLock::new(PathState::Unset),
            mtime: AtomicI64::new(Timestamp::UNKNOWN.raw()),
            opstate: [OpState::default(), OpState::default()],
        }
    }

    /// Three-valued extension: unset, explicitly none, or present
    pub fn ext(&self) -> Option<Option<&str>> {
        self.ext.get().map(|e| e.as_deref())
    }

    /// Fill in an unset extension; returns false on a conflicting value.
    /// The key hash excludes the extension, so the store bucket is stable
    /// under this upgrade.
    pub(crate) fn upgrade_ext(&self, ext: Option<String>) -> bool {
        match self.ext.set(ext.clone()) {
            Ok(()) => true,
            Err(_) => self.ext.get().map(|e| e.as_deref()) == Some(ext.as_deref()),
        }
    }

    /// Referenced before any real declaration?
    pub fn implied(&self) -> bool {
        self.implied.load(Ordering::Acquire)
    }

    /// A real declaration arrived (load phase)
    pub fn clear_implied(&self) {
        self.implied.store(false, Ordering::Release);
    }

    /// The explicit group this target is a member of
    pub fn group(&self) -> Option<Arc<Target>> {
        self.group.get().and_then(Weak::upgrade)
    }

    /// Link into an explicit group; first writer wins
    pub fn set_group(&self, group: &Arc<Target>) {
        let _ = self.group.set(Arc::downgrade(group));
    }

    /// Head (or next link) of the ad-hoc member chain
    pub fn adhoc_member(&self) -> Option<&Arc<Target>> {
        self.member.get()
    }

    /// Append to the ad-hoc member chain.
    ///
    /// Ad-hoc groups do not nest; the chain is strictly of non-group
    /// members hanging off the primary target.
    pub fn add_adhoc_member(&self, member: Arc<Target>) {
        debug_assert!(member.member.get().is_none());

        let mut cursor: &Target = self;
        loop {
            match cursor.member.set(member.clone()) {
                Ok(()) => return,
                Err(_) => {
                    let next = cursor.member.get().expect("chain link");
                    if Arc::ptr_eq(next, &member) {
                        return;
                    }
                    // Walk to the tail; chain mutation is load/match-serial
                    cursor = next.as_ref();
                }
            }
        }
    }

    /// Declared prerequisites; empty until the loader swaps them in
    pub fn prerequisites(&self) -> &[Prerequisite] {
        self.prerequisites.get().map(Vec::as_slice).unwrap_or_default()
    }

    /// Swap in the prerequisite list; the first writer wins and all
    /// subsequent writes are discarded (returning false).
    pub fn set_prerequisites(&self, prerequisites: Vec<Prerequisite>) -> bool {
        self.prerequisites.set(prerequisites).is_ok()
    }

    /// Per-target variable assignment
    pub fn assign(&self, name: impl ToString, value: Value) {
        self.vars.write().unwrap_or_else(|e| e.into_inner()).assign(name, value);
    }

    /// Per-target variable, this map only (no scope fallback)
    pub fn var(&self, name: &str) -> Option<Value> {
        self.vars.read().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
    }

    /// Per-action state slot
    pub fn op(&self, action: Action) -> &OpState {
        &self.opstate[action.index()]
    }

    /// Resolved state for dependents: members defer to their group
    pub fn state(&self, action: Action) -> TargetState {
        match self.op(action).state() {
            TargetState::Group => self
                .group()
                .map(|g| g.state(action))
                .unwrap_or(TargetState::Unknown),
            state => state,
        }
    }

    // ---- path target protocol ----

    /// The assigned path, if any. An empty path means "location unknown"
    /// (paired with an explicitly assigned mtime).
    pub fn path(&self) -> Option<PathBuf> {
        match &*self.path.read().unwrap_or_else(|e| e.into_inner()) {
            PathState::Unset => None,
            PathState::Set(p) => Some(p.clone()),
        }
    }

    /// Assign the path; transitions exactly once, later assignments must
    /// agree.
    pub fn set_path(&self, path: impl Into<PathBuf>) -> Result<PathBuf, Error> {
        let path = path.into();
        let mut state = self.path.write().unwrap_or_else(|e| e.into_inner());

        match &*state {
            PathState::Unset => {
                *state = PathState::Set(path.clone());
                Ok(path)
            }
            PathState::Set(existing) if *existing == path => Ok(path),
            PathState::Set(existing) => Err(Error::PathConflict {
                target: self.to_string(),
                existing: existing.clone(),
                requested: path,
            }),
        }
    }

    /// Derive and assign the default path `dir/name[.ext]`, fixing the
    /// extension from the target type if still unset.
    pub fn derive_path(&self) -> Result<PathBuf, Error> {
        if let Some(existing) = self.path() {
            return Ok(existing);
        }

        let ext = match self.ext() {
            Some(e) => e.map(str::to_owned),
            None => {
                let default = self
                    .ttype
                    .default_ext
                    .filter(|e| !e.is_empty())
                    .map(str::to_owned);
                self.upgrade_ext(default.clone());
                default
            }
        };

        let leaf = match &ext {
            Some(e) if !e.is_empty() => format!("{}.{e}", self.name),
            _ => self.name.clone(),
        };

        self.set_path(self.dir.join(leaf))
    }

    // ---- mtime target protocol ----

    /// Cached mtime (release/acquire over the raw representation)
    pub fn mtime(&self) -> Timestamp {
        Timestamp::from_raw(self.mtime.load(Ordering::Acquire))
    }

    pub fn set_mtime(&self, ts: Timestamp) {
        self.mtime.store(ts.raw(), Ordering::Release);
    }

    /// Query the filesystem on first use and cache the result
    pub fn load_mtime(&self) -> Timestamp {
        let cached = self.mtime();
        if cached != Timestamp::UNKNOWN {
            return cached;
        }

        let loaded = match self.path() {
            Some(p) if !p.as_os_str().is_empty() => Timestamp::of(&p),
            _ if self.ttype.dir_based => Timestamp::of(&self.dir),
            _ => Timestamp::NONEXISTENT,
        };

        self.set_mtime(loaded);
        loaded
    }

    /// Group/member resolved mtime
    pub fn effective_mtime(&self, action: Action) -> Timestamp {
        match self.op(action).state() {
            TargetState::Group => self
                .group()
                .map(|g| g.effective_mtime(action))
                .unwrap_or(Timestamp::UNKNOWN),
            _ => self.mtime(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.dir.display())?;
        match self.ext().flatten() {
            Some(e) if !e.is_empty() => write!(f, "{}{{{}.{e}}}", self.ttype.name, self.name),
            _ => write!(f, "{}{{{}}}", self.ttype.name, self.name),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("target {target} path already set to {}, refusing {}", existing.display(), requested.display())]
    PathConflict {
        target: String,
        existing: PathBuf,
        requested: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::perform_update;

    fn target(ttype: &'static TargetType, name: &str) -> Target {
        Target::new(ttype, PathBuf::from("/out"), PathBuf::new(), name.to_owned(), None, false)
    }

    #[test]
    fn ext_upgrade_once() {
        let t = target(&types::FILE, "hello");
        assert_eq!(t.ext(), None);

        assert!(t.upgrade_ext(Some("txt".into())));
        assert_eq!(t.ext(), Some(Some("txt")));

        // Same value is idempotent, different is refused
        assert!(t.upgrade_ext(Some("txt".into())));
        assert!(!t.upgrade_ext(Some("bin".into())));
    }

    #[test]
    fn path_set_once_and_agree() {
        let t = target(&types::FILE, "hello");
        t.set_path("/out/hello.o").unwrap();
        assert!(t.set_path("/out/hello.o").is_ok());
        assert!(t.set_path("/out/other.o").is_err());
    }

    #[test]
    fn derive_path_uses_type_ext() {
        let t = target(&types::CXX, "driver");
        assert_eq!(t.derive_path().unwrap(), PathBuf::from("/out/driver.cxx"));
        assert_eq!(t.ext(), Some(Some("cxx")));
    }

    #[test]
    fn derive_path_honours_explicit_ext() {
        let t = Target::new(
            &types::OBJE,
            PathBuf::from("/out"),
            PathBuf::new(),
            "driver".to_owned(),
            Some(Some("o".to_owned())),
            false,
        );
        assert_eq!(t.derive_path().unwrap(), PathBuf::from("/out/driver.o"));
    }

    #[test]
    fn prerequisites_first_writer_wins() {
        let t = target(&types::FILE, "hello");
        assert!(t.set_prerequisites(vec![Prerequisite::new(&types::CXX, "hello")]));
        assert!(!t.set_prerequisites(vec![]));
        assert_eq!(t.prerequisites().len(), 1);
    }

    #[test]
    fn group_state_sentinel() {
        let a = perform_update();

        let group = Arc::new(target(&types::OBJ, "hello"));
        let member = target(&types::OBJE, "hello");

        member.set_group(&group);
        member.op(a).set_state(TargetState::Group);
        group.op(a).set_state(TargetState::Changed);

        assert_eq!(member.state(a), TargetState::Changed);
    }

    #[test]
    fn mtime_defaults_unknown() {
        let t = target(&types::FILE, "hello");
        assert_eq!(t.mtime(), Timestamp::UNKNOWN);
        t.set_mtime(Timestamp::NONEXISTENT);
        assert_eq!(t.mtime(), Timestamp::NONEXISTENT);
    }
}
