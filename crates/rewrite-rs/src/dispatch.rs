//! Backend-aware resolution shared by the function, module and symbolic registries.
//!
//! A [`RewriteTable`] maps an identity to the rewrites registered for it, one per backend.
//! Resolution for a requested backend prefers the exact backend, then the `"default"` backend,
//! and otherwise reports no override so the original behavior is kept.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

use crate::backend::Backend;

/// A rewrite registered for one backend.
#[derive(Clone, Debug)]
pub struct RewriteEntry<T> {
    pub backend: Backend,
    pub implementation: T,
}

/// How a resolved entry matched the requested backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resolution {
    Exact,
    Default,
}

/// Entry selected for an identity under a requested backend.
#[derive(Debug)]
pub struct Resolved<'a, K, T> {
    pub identity: &'a K,
    pub entry: &'a RewriteEntry<T>,
    pub resolution: Resolution,
}

/// Identity → backend-tagged entries, kept in registration order.
#[derive(Debug)]
pub struct RewriteTable<K, T> {
    entries: HashMap<K, Vec<RewriteEntry<T>>>,
    order: Vec<K>,
}

impl<K, T> RewriteTable<K, T>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Records `implementation` for `(identity, backend)`, returning the entry it replaced.
    ///
    /// A replaced entry keeps its original position so default selection stays stable.
    pub fn insert(&mut self, identity: K, backend: Backend, implementation: T) -> Option<T> {
        if !self.entries.contains_key(&identity) {
            self.order.push(identity.clone());
        }
        let slot = self.entries.entry(identity).or_default();

        if let Some(existing) = slot.iter_mut().find(|entry| entry.backend == backend) {
            return Some(std::mem::replace(
                &mut existing.implementation,
                implementation,
            ));
        }
        slot.push(RewriteEntry {
            backend,
            implementation,
        });
        None
    }

    pub fn remove(&mut self, identity: &K, backend: &Backend) -> Option<T> {
        let slot = self.entries.get_mut(identity)?;
        let pos = slot.iter().position(|entry| &entry.backend == backend)?;
        let removed = slot.remove(pos);
        if slot.is_empty() {
            self.entries.remove(identity);
            self.order.retain(|candidate| candidate != identity);
        }
        Some(removed.implementation)
    }

    /// Picks the entry for `identity`: exact backend, then default, then none.
    pub fn resolve<'a>(&'a self, identity: &K, backend: &Backend) -> Option<Resolved<'a, K, T>> {
        let (identity, slot) = self.entries.get_key_value(identity)?;
        resolve_slot(identity, slot, backend)
    }

    /// Resolves every identity for `backend`, in registration order, skipping identities with
    /// neither an exact nor a default entry.
    pub fn resolve_all<'a>(&'a self, backend: &Backend) -> Vec<Resolved<'a, K, T>> {
        self.order
            .iter()
            .filter_map(|identity| {
                let (identity, slot) = self.entries.get_key_value(identity)?;
                resolve_slot(identity, slot, backend)
            })
            .collect()
    }

    pub fn entries(&self, identity: &K) -> &[RewriteEntry<T>] {
        self.entries
            .get(identity)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn identities(&self) -> impl Iterator<Item = &K> {
        self.order.iter()
    }

    /// Every backend named by at least one entry.
    pub fn backends(&self) -> BTreeSet<Backend> {
        self.entries
            .values()
            .flatten()
            .map(|entry| entry.backend.clone())
            .collect()
    }

    pub fn has_backend(&self, backend: &Backend) -> bool {
        self.entries
            .values()
            .flatten()
            .any(|entry| &entry.backend == backend)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, T> Default for RewriteTable<K, T>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_slot<'a, K, T>(
    identity: &'a K,
    slot: &'a [RewriteEntry<T>],
    backend: &Backend,
) -> Option<Resolved<'a, K, T>> {
    if let Some(entry) = slot.iter().find(|entry| &entry.backend == backend) {
        let resolution = if backend.is_default() {
            Resolution::Default
        } else {
            Resolution::Exact
        };
        return Some(Resolved {
            identity,
            entry,
            resolution,
        });
    }
    slot.iter()
        .find(|entry| entry.backend.is_default())
        .map(|entry| Resolved {
            identity,
            entry,
            resolution: Resolution::Default,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RewriteTable<String, &'static str> {
        let mut table = RewriteTable::new();
        table.insert("torch.add".into(), Backend::new("tensorrt"), "add_trt");
        table.insert("torch.add".into(), Backend::default(), "add_default");
        table.insert("torch.mul".into(), Backend::new("ncnn"), "mul_ncnn");
        table
    }

    #[test]
    fn exact_backend_wins_over_default() {
        let table = table();
        let resolved = table
            .resolve(&"torch.add".to_string(), &Backend::new("tensorrt"))
            .unwrap();
        assert_eq!(resolved.entry.implementation, "add_trt");
        assert_eq!(resolved.resolution, Resolution::Exact);
    }

    #[test]
    fn unknown_backend_falls_back_to_default() {
        let table = table();
        let resolved = table
            .resolve(&"torch.add".to_string(), &Backend::new("openvino"))
            .unwrap();
        assert_eq!(resolved.entry.implementation, "add_default");
        assert_eq!(resolved.resolution, Resolution::Default);
    }

    #[test]
    fn no_exact_and_no_default_resolves_to_none() {
        let table = table();
        assert!(table
            .resolve(&"torch.mul".to_string(), &Backend::new("tensorrt"))
            .is_none());
        assert!(table
            .resolve(&"torch.sub".to_string(), &Backend::default())
            .is_none());
    }

    #[test]
    fn reregistration_replaces_in_place() {
        let mut table = table();
        let previous = table.insert("torch.add".into(), Backend::new("tensorrt"), "add_trt_v2");
        assert_eq!(previous, Some("add_trt"));
        assert_eq!(table.entries(&"torch.add".to_string()).len(), 2);
        assert_eq!(
            table.entries(&"torch.add".to_string())[0].implementation,
            "add_trt_v2"
        );
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn resolve_all_keeps_registration_order() {
        let table = table();
        let names: Vec<_> = table
            .resolve_all(&Backend::new("ncnn"))
            .into_iter()
            .map(|resolved| resolved.entry.implementation)
            .collect();
        assert_eq!(names, vec!["add_default", "mul_ncnn"]);
    }

    #[test]
    fn remove_drops_empty_identities() {
        let mut table = table();
        assert_eq!(
            table.remove(&"torch.mul".to_string(), &Backend::new("ncnn")),
            Some("mul_ncnn")
        );
        assert_eq!(table.identities().count(), 1);
        assert!(!table.has_backend(&Backend::new("ncnn")));
        assert_eq!(
            table.backends().into_iter().collect::<Vec<_>>(),
            vec![Backend::default(), Backend::new("tensorrt")]
        );
    }
}
