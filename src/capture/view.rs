//! Boundary consumed by the TUI capture tab.
//!
//! The view owns display-side state (filters and selection) and turns key
//! presses into commands for the host event loop. Rendering lives elsewhere.

use super::entry::CaptureEntry;
use super::filter::FilterState;
use super::store::CaptureStore;
use crate::state::ProxyState;
use std::sync::Arc;

/// Actions the view cannot perform itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureCommand {
    ToggleProxy,
    ClearCaptures,
    Refresh,
    None,
}

#[derive(Debug, Default)]
pub struct CaptureView {
    filter: FilterState,
    selected: usize,
    pending_g: bool,
}

impl CaptureView {
    pub fn new(filter: FilterState) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn filter(&self) -> &FilterState {
        &self.filter
    }

    pub fn selected(&self) -> usize {
        self.selected
    }

    /// `Capture [ON] (42)`
    pub fn header(state: &ProxyState, count: usize) -> String {
        let flag = if state.running { "ON" } else { "OFF" };
        format!("Capture [{flag}] ({count})")
    }

    /// Filter label shown next to the header when a filter is active.
    pub fn filter_label(&self) -> Option<String> {
        self.filter.is_active().then(|| {
            format!(
                "method:{} status:{}",
                self.filter.method.label(),
                self.filter.status.label()
            )
        })
    }

    pub fn rows(&self, store: &CaptureStore) -> Vec<Arc<CaptureEntry>> {
        store.list(&self.filter)
    }

    pub fn selected_entry<'a>(&self, rows: &'a [Arc<CaptureEntry>]) -> Option<&'a Arc<CaptureEntry>> {
        rows.get(self.selected)
    }

    /// Apply one key press. `rows` is the number of currently visible rows.
    pub fn handle_key(&mut self, key: char, rows: usize) -> CaptureCommand {
        let pending_g = std::mem::take(&mut self.pending_g);

        let command = match key {
            'p' => CaptureCommand::ToggleProxy,
            'X' => {
                self.selected = 0;
                CaptureCommand::ClearCaptures
            }
            'r' => CaptureCommand::Refresh,
            'm' => {
                self.filter.cycle_method();
                self.selected = 0;
                CaptureCommand::Refresh
            }
            's' => {
                self.filter.cycle_status();
                self.selected = 0;
                CaptureCommand::Refresh
            }
            'x' => {
                self.filter.clear();
                self.selected = 0;
                CaptureCommand::Refresh
            }
            'j' => {
                self.selected = self.selected.saturating_add(1);
                CaptureCommand::None
            }
            'k' => {
                self.selected = self.selected.saturating_sub(1);
                CaptureCommand::None
            }
            'G' => {
                self.selected = rows.saturating_sub(1);
                CaptureCommand::None
            }
            'g' if pending_g => {
                self.selected = 0;
                CaptureCommand::None
            }
            'g' => {
                self.pending_g = true;
                CaptureCommand::None
            }
            _ => CaptureCommand::None,
        };

        self.clamp(rows);
        command
    }

    /// Keep the selection inside `rows` after the list changes underneath.
    pub fn clamp(&mut self, rows: usize) {
        self.selected = self.selected.min(rows.saturating_sub(1));
    }
}
