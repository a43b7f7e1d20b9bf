// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Locator selection for outgoing messages.
//!
//! A [`LocatorSelector`] holds one [`LocatorSelectorEntry`] per remote
//! endpoint a message is addressed to. Before each send every transport
//! runs [`select_locators`] over the selector, choosing which of each
//! entry's locators it will actually write to.
//!
//! # Selection rules (per transport pass)
//!
//! 1. Entries not flagged `transport_should_process` are skipped.
//! 2. A supported multicast locator also listed by a later entry is chosen
//!    once and those later entries are dropped from the pass. A multicast
//!    locator is also chosen when the entry has no unicast locators.
//! 3. Otherwise every supported unicast locator not already chosen by
//!    another selected entry is chosen.
//! 4. The entry is selected iff something was chosen.
//!
//! # Example
//!
//! ```
//! use hdds_transport::selector::{select_locators, LocatorSelector, LocatorSelectorEntry};
//! use hdds_transport::{Locator, LocatorKind};
//!
//! let group = Locator::shm_multicast(7401);
//! let mut selector = LocatorSelector::new();
//! selector.add_entry(LocatorSelectorEntry::new([1; 16], vec![Locator::shm(7411)], vec![group]));
//! selector.add_entry(LocatorSelectorEntry::new([2; 16], vec![Locator::shm(7413)], vec![group]));
//!
//! selector.reset(true);
//! selector.selection_start();
//! select_locators(&mut selector, |l| l.kind == LocatorKind::Shm);
//!
//! assert_eq!(selector.selected_locators(), vec![group]);
//! ```

use crate::locator::Locator;

/// Globally unique identifier of a remote endpoint (prefix + entity id).
pub type Guid = [u8; 16];

/// Locators chosen for one entry, as indices into its lists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryState {
    /// Chosen positions in `multicast`
    pub multicast: Vec<usize>,
    /// Chosen positions in `unicast`
    pub unicast: Vec<usize>,
}

impl EntryState {
    fn clear(&mut self) {
        self.multicast.clear();
        self.unicast.clear();
    }
}

/// Candidate locators of one remote endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocatorSelectorEntry {
    /// Remote endpoint
    pub remote_guid: Guid,
    /// Unicast candidates
    pub unicast: Vec<Locator>,
    /// Multicast candidates
    pub multicast: Vec<Locator>,
    /// Choices of the current pass
    pub state: EntryState,
    /// Whether the message is addressed to this endpoint
    pub enabled: bool,
    /// Still to be handled by the running transport pass
    pub transport_should_process: bool,
}

impl LocatorSelectorEntry {
    /// Entry with nothing chosen, disabled.
    #[must_use]
    pub fn new(remote_guid: Guid, unicast: Vec<Locator>, multicast: Vec<Locator>) -> Self {
        Self {
            remote_guid,
            unicast,
            multicast,
            state: EntryState::default(),
            enabled: false,
            transport_should_process: false,
        }
    }

    /// Forget choices of a previous pass.
    pub fn reset(&mut self) {
        self.state.clear();
    }

    fn chosen(&self) -> impl Iterator<Item = &Locator> + '_ {
        let mc = self.state.multicast.iter().filter_map(|&i| self.multicast.get(i));
        let uc = self.state.unicast.iter().filter_map(|&i| self.unicast.get(i));
        mc.chain(uc)
    }
}

/// Per-message selection over a set of remote endpoints.
#[derive(Clone, Debug, Default)]
pub struct LocatorSelector {
    entries: Vec<LocatorSelectorEntry>,
    /// Indices of selected entries, in selection order
    selections: Vec<usize>,
    /// `enabled` flags captured by the last `reset`
    last_state: Vec<bool>,
}

impl LocatorSelector {
    /// Empty selector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint. Returns `false` if its GUID is already present.
    pub fn add_entry(&mut self, entry: LocatorSelectorEntry) -> bool {
        if self.entries.iter().any(|e| e.remote_guid == entry.remote_guid) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Remove an endpoint. Returns `false` if unknown.
    pub fn remove_entry(&mut self, guid: &Guid) -> bool {
        let Some(pos) = self.entries.iter().position(|e| &e.remote_guid == guid) else {
            return false;
        };
        self.entries.remove(pos);
        self.selections.clear();
        true
    }

    /// Remember current `enabled` flags, then set every entry to `enable_all`.
    pub fn reset(&mut self, enable_all: bool) {
        self.last_state = self.entries.iter().map(|e| e.enabled).collect();
        for entry in &mut self.entries {
            entry.enabled = enable_all;
        }
    }

    /// Enable the entry of `guid`. Returns `false` if unknown.
    pub fn enable(&mut self, guid: &Guid) -> bool {
        match self.entries.iter_mut().find(|e| &e.remote_guid == guid) {
            Some(entry) => {
                entry.enabled = true;
                true
            }
            None => false,
        }
    }

    /// True if entries were added/removed or enabled flags differ from the
    /// last `reset`; a cached selection must then be recomputed.
    #[must_use]
    pub fn state_has_changed(&self) -> bool {
        self.entries.len() != self.last_state.len()
            || self
                .entries
                .iter()
                .zip(&self.last_state)
                .any(|(e, &was)| e.enabled != was)
    }

    /// Clear previous choices before the transports run.
    pub fn selection_start(&mut self) {
        self.selections.clear();
        for entry in &mut self.entries {
            entry.reset();
            entry.transport_should_process = entry.enabled;
        }
    }

    /// Begin one transport's pass: every enabled entry is processable again.
    pub fn transport_starts(&mut self) -> &mut [LocatorSelectorEntry] {
        for entry in &mut self.entries {
            entry.transport_should_process = entry.enabled;
        }
        &mut self.entries
    }

    /// Mark entry `index` selected (idempotent, ignores bad indices).
    pub fn select(&mut self, index: usize) {
        if index < self.entries.len() && !self.selections.contains(&index) {
            self.selections.push(index);
        }
    }

    /// Number of chosen locators across selected entries.
    #[must_use]
    pub fn selected_size(&self) -> usize {
        self.selected_entries()
            .map(|e| e.state.multicast.len() + e.state.unicast.len())
            .sum()
    }

    /// True if a selected entry chose `locator` (looked up in its multicast
    /// or unicast choices according to `locator.is_multicast()`).
    #[must_use]
    pub fn is_selected(&self, locator: &Locator) -> bool {
        is_selected_in(&self.entries, &self.selections, locator)
    }

    /// True if entry `index` is selected.
    #[must_use]
    pub fn is_entry_selected(&self, index: usize) -> bool {
        self.selections.contains(&index)
    }

    /// Chosen locators, in selection order.
    #[must_use]
    pub fn selected_locators(&self) -> Vec<Locator> {
        let mut out = Vec::with_capacity(self.selected_size());
        self.for_each(|l| out.push(*l));
        out
    }

    /// Visit every chosen locator.
    pub fn for_each(&self, mut action: impl FnMut(&Locator)) {
        for entry in self.selected_entries() {
            entry.chosen().for_each(&mut action);
        }
    }

    /// All entries.
    #[must_use]
    pub fn entries(&self) -> &[LocatorSelectorEntry] {
        &self.entries
    }

    fn selected_entries(&self) -> impl Iterator<Item = &LocatorSelectorEntry> + '_ {
        self.selections.iter().filter_map(|&i| self.entries.get(i))
    }
}

fn is_selected_in(entries: &[LocatorSelectorEntry], selections: &[usize], locator: &Locator) -> bool {
    selections.iter().filter_map(|&i| entries.get(i)).any(|e| {
        if locator.is_multicast() {
            e.state.multicast.iter().any(|&j| e.multicast.get(j) == Some(locator))
        } else {
            e.state.unicast.iter().any(|&j| e.unicast.get(j) == Some(locator))
        }
    })
}

/// Drop every later processable entry that lists `locator` as multicast.
/// Returns `true` if at least one did.
fn check_and_invalidate(later: &mut [LocatorSelectorEntry], locator: &Locator) -> bool {
    let mut found = false;
    for entry in later.iter_mut().filter(|e| e.transport_should_process) {
        if entry.multicast.contains(locator) {
            entry.transport_should_process = false;
            found = true;
        }
    }
    found
}

/// Run one transport's selection pass.
///
/// `is_supported` tells which locators the running transport can reach.
pub fn select_locators(selector: &mut LocatorSelector, is_supported: impl Fn(&Locator) -> bool) {
    selector.transport_starts();

    for i in 0..selector.entries.len() {
        if !selector.entries[i].transport_should_process {
            continue;
        }

        let mut selected = false;
        let (head, later) = selector.entries.split_at_mut(i + 1);
        let entry = &mut head[i];

        for (j, locator) in entry.multicast.iter().enumerate() {
            if !is_supported(locator) {
                continue;
            }
            if check_and_invalidate(later, locator) || entry.unicast.is_empty() {
                entry.state.multicast.push(j);
                selected = true;
                break;
            }
        }

        if !selected {
            let picks: Vec<usize> = selector.entries[i]
                .unicast
                .iter()
                .enumerate()
                .filter(|&(_, l)| {
                    is_supported(l)
                        && !is_selected_in(&selector.entries, &selector.selections, l)
                })
                .map(|(j, _)| j)
                .collect();
            selected = !picks.is_empty();
            selector.entries[i].state.unicast.extend(picks);
        }

        if selected {
            selector.select(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::LocatorKind;
    use std::net::Ipv4Addr;

    fn shm_only(l: &Locator) -> bool {
        l.kind == LocatorKind::Shm
    }

    fn run(selector: &mut LocatorSelector) {
        selector.reset(true);
        selector.selection_start();
        select_locators(selector, shm_only);
    }

    #[test]
    fn test_shared_multicast_chosen_once() {
        let group = Locator::shm_multicast(7401);
        let mut selector = LocatorSelector::new();
        selector.add_entry(LocatorSelectorEntry::new([1; 16], vec![Locator::shm(7411)], vec![group]));
        selector.add_entry(LocatorSelectorEntry::new([2; 16], vec![Locator::shm(7413)], vec![group]));
        selector.add_entry(LocatorSelectorEntry::new([3; 16], vec![Locator::shm(7415)], vec![]));
        run(&mut selector);

        assert!(selector.is_entry_selected(0));
        assert!(!selector.is_entry_selected(1));
        assert!(selector.is_entry_selected(2));
        assert_eq!(selector.selected_size(), 2);
        assert_eq!(
            selector.selected_locators(),
            vec![group, Locator::shm(7415)]
        );
        assert!(!selector.entries()[1].transport_should_process);
    }

    #[test]
    fn test_unshared_multicast_prefers_unicast() {
        let mut selector = LocatorSelector::new();
        selector.add_entry(LocatorSelectorEntry::new(
            [1; 16],
            vec![Locator::shm(7411)],
            vec![Locator::shm_multicast(7401)],
        ));
        run(&mut selector);
        assert_eq!(selector.selected_locators(), vec![Locator::shm(7411)]);
    }

    #[test]
    fn test_multicast_only_entry() {
        let mut selector = LocatorSelector::new();
        selector.add_entry(LocatorSelectorEntry::new([1; 16], vec![], vec![Locator::shm_multicast(7401)]));
        run(&mut selector);
        assert_eq!(selector.selected_locators(), vec![Locator::shm_multicast(7401)]);
    }

    #[test]
    fn test_unicast_not_duplicated_across_entries() {
        let shared = Locator::shm(7411);
        let mut selector = LocatorSelector::new();
        selector.add_entry(LocatorSelectorEntry::new([1; 16], vec![shared], vec![]));
        selector.add_entry(LocatorSelectorEntry::new([2; 16], vec![shared], vec![]));
        run(&mut selector);
        assert!(selector.is_entry_selected(0));
        assert!(!selector.is_entry_selected(1));
        assert_eq!(selector.selected_size(), 1);
    }

    #[test]
    fn test_unsupported_and_disabled_ignored() {
        let udp = Locator::udp_v4(Ipv4Addr::LOCALHOST, 7411);
        let mut selector = LocatorSelector::new();
        selector.add_entry(LocatorSelectorEntry::new([1; 16], vec![udp], vec![]));
        selector.add_entry(LocatorSelectorEntry::new([2; 16], vec![Locator::shm(7413)], vec![]));

        selector.reset(false);
        selector.enable(&[1; 16]);
        selector.selection_start();
        select_locators(&mut selector, shm_only);

        assert_eq!(selector.selected_size(), 0);
        assert!(!selector.is_selected(&udp));
    }

    #[test]
    fn test_state_has_changed() {
        let mut selector = LocatorSelector::new();
        selector.add_entry(LocatorSelectorEntry::new([1; 16], vec![], vec![]));
        assert!(selector.state_has_changed());

        selector.reset(false);
        assert!(!selector.state_has_changed());
        selector.enable(&[1; 16]);
        assert!(selector.state_has_changed());

        selector.reset(true);
        assert!(!selector.state_has_changed());
        assert!(selector.add_entry(LocatorSelectorEntry::new([2; 16], vec![], vec![])));
        assert!(selector.state_has_changed());
    }

    #[test]
    fn test_add_remove_entries() {
        let mut selector = LocatorSelector::new();
        assert!(selector.add_entry(LocatorSelectorEntry::new([1; 16], vec![], vec![])));
        assert!(!selector.add_entry(LocatorSelectorEntry::new([1; 16], vec![], vec![])));
        assert!(selector.remove_entry(&[1; 16]));
        assert!(!selector.remove_entry(&[1; 16]));
        assert!(selector.entries().is_empty());
    }

    #[test]
    fn test_second_transport_pass_sees_all_entries() {
        let udp = Locator::udp_v4(Ipv4Addr::new(10, 0, 0, 2), 7411);
        let group = Locator::shm_multicast(7401);
        let mut selector = LocatorSelector::new();
        selector.add_entry(LocatorSelectorEntry::new([1; 16], vec![], vec![group]));
        selector.add_entry(LocatorSelectorEntry::new([2; 16], vec![udp], vec![group]));

        selector.reset(true);
        selector.selection_start();
        select_locators(&mut selector, shm_only);
        // SHM pass invalidated entry 1; the UDP pass starts fresh
        select_locators(&mut selector, |l| l.kind == LocatorKind::UdpV4);

        assert!(selector.is_entry_selected(0));
        assert!(selector.is_entry_selected(1));
        assert!(selector.is_selected(&udp));
        assert!(selector.is_selected(&group));
    }
}
