// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The concurrent interned target table.
//!
//! Keys hash over `(type, dir, out, name)`; the extension is excluded so
//! that the absent-to-present extension upgrade keeps the bucket stable.
//! A bucket holds one entry per distinct present extension (almost always
//! exactly one); an absent-extension entry unifies with the first present
//! lookup and is upgraded in place.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use super::{Target, TargetType};

#[derive(Clone, PartialEq, Eq, Hash)]
struct StoreKey {
    // Identity is the descriptor address
    ttype: usize,
    dir: PathBuf,
    out: PathBuf,
    name: String,
}

impl StoreKey {
    fn new(ttype: &'static TargetType, dir: &PathBuf, out: &PathBuf, name: &str) -> Self {
        Self {
            ttype: std::ptr::from_ref(ttype) as usize,
            dir: dir.clone(),
            out: out.clone(),
            name: name.to_owned(),
        }
    }
}

/// Interned target storage; the sole owner of target identity for the
/// lifetime of the build context.
#[derive(Default)]
pub struct TargetStore {
    map: RwLock<HashMap<StoreKey, Vec<Arc<Target>>>>,
}

/// Does an entry unify with a lookup extension, and does it need the
/// in-place upgrade to do so?
fn unifies(entry: &Target, ext: Option<Option<&str>>) -> bool {
    match (entry.ext(), ext) {
        // Absent on either side is a wildcard
        (None, _) | (_, None) => true,
        (Some(a), Some(b)) => a == b,
    }
}

impl TargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared-lock lookup.
    ///
    /// A present lookup extension against an absent-extension entry
    /// upgrades the entry (the first such lookup fixes the extension).
    pub fn find(
        &self,
        ttype: &'static TargetType,
        dir: &PathBuf,
        out: &PathBuf,
        name: &str,
        ext: Option<Option<&str>>,
    ) -> Option<Arc<Target>> {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());

        let bucket = map.get(&StoreKey::new(ttype, dir, out, name))?;
        for entry in bucket {
            if unifies(entry, ext) {
                if let Some(e) = ext {
                    if !entry.upgrade_ext(e.map(str::to_owned)) {
                        // Raced with a different upgrade; not this entry
                        continue;
                    }
                }
                return Some(Arc::clone(entry));
            }
        }
        None
    }

    /// Find-or-insert under the exclusive lock.
    ///
    /// Returns the target and whether it was created. Insertion never
    /// fails for reasons other than allocation.
    pub fn insert(
        &self,
        ttype: &'static TargetType,
        dir: PathBuf,
        out: PathBuf,
        name: String,
        ext: Option<Option<String>>,
        implied: bool,
    ) -> (Arc<Target>, bool) {
        if let Some(found) = self.find(ttype, &dir, &out, &name, ext.as_ref().map(|e| e.as_deref())) {
            if !implied && found.implied() {
                found.clear_implied();
            }
            return (found, false);
        }

        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        let bucket = map.entry(StoreKey::new(ttype, &dir, &out, &name)).or_default();

        // Re-check under the exclusive lock
        for entry in bucket.iter() {
            if unifies(entry, ext.as_ref().map(|e| e.as_deref())) {
                if let Some(e) = &ext {
                    if !entry.upgrade_ext(e.clone()) {
                        continue;
                    }
                }
                let found = Arc::clone(entry);
                if !implied && found.implied() {
                    found.clear_implied();
                }
                return (found, false);
            }
        }

        let target = Arc::new(Target::new(ttype, dir, out, name, ext, implied));
        bucket.push(Arc::clone(&target));
        (target, true)
    }

    /// Snapshot of all targets; only meaningful during serial phases
    pub fn iter(&self) -> Vec<Arc<Target>> {
        self.map
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(|e| e.into_inner()).values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::types;

    fn dir() -> PathBuf {
        PathBuf::from("/out")
    }

    #[test]
    fn intern_is_stable() {
        let store = TargetStore::new();
        let (a, inserted) = store.insert(&types::FILE, dir(), PathBuf::new(), "x".into(), None, false);
        assert!(inserted);
        let (b, inserted) = store.insert(&types::FILE, dir(), PathBuf::new(), "x".into(), None, false);
        assert!(!inserted);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn ext_wildcard_unifies_and_upgrades() {
        let store = TargetStore::new();
        // Entered without an extension first
        let (a, _) = store.insert(&types::H, dir(), PathBuf::new(), "config".into(), None, true);
        assert_eq!(a.ext(), None);

        // Present-extension lookup unifies with and upgrades the entry
        let found = store
            .find(&types::H, &dir(), &PathBuf::new(), "config", Some(Some("h")))
            .expect("unified");
        assert!(Arc::ptr_eq(&a, &found));
        assert_eq!(a.ext(), Some(Some("h")));
    }

    #[test]
    fn distinct_present_exts_are_distinct_targets() {
        let store = TargetStore::new();
        let (a, _) = store.insert(
            &types::FILE,
            dir(),
            PathBuf::new(),
            "lib".into(),
            Some(Some("so".into())),
            false,
        );
        let (b, inserted) = store.insert(
            &types::FILE,
            dir(),
            PathBuf::new(),
            "lib".into(),
            Some(Some("a".into())),
            false,
        );
        assert!(inserted);
        assert!(!Arc::ptr_eq(&a, &b));

        // But the absent-ext lookup sees the first entry
        assert!(store.find(&types::FILE, &dir(), &PathBuf::new(), "lib", None).is_some());
    }

    #[test]
    fn types_partition_the_table() {
        let store = TargetStore::new();
        store.insert(&types::C, dir(), PathBuf::new(), "x".into(), None, false);
        assert!(store.find(&types::CXX, &dir(), &PathBuf::new(), "x", None).is_none());
    }

    #[test]
    fn implied_cleared_by_real_declaration() {
        let store = TargetStore::new();
        let (a, _) = store.insert(&types::FILE, dir(), PathBuf::new(), "gen".into(), None, true);
        assert!(a.implied());

        store.insert(&types::FILE, dir(), PathBuf::new(), "gen".into(), None, false);
        assert!(!a.implied());
    }
}
