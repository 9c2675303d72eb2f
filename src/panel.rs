//! Minimal panel table for the dispatch core.
//!
//! Rendering lives elsewhere; the core only needs to know which path each
//! panel shows (for change-notification overlap) and whether a refresh is
//! pending.

/// Identifies one panel of the dual-pane UI.
pub type PanelId = u32;

#[derive(Debug, Clone)]
pub struct PanelState {
    pub id: PanelId,
    /// Full path the panel currently shows, `namespace:rest` for virtual
    /// namespaces or a plain local path.
    pub path: String,
    /// Set by notification fan-out, cleared when the owner redraws.
    pub needs_refresh: bool,
}

/// All panels known to the host.
#[derive(Debug, Default)]
pub struct PanelTable {
    panels: Vec<PanelState>,
}

impl PanelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a panel or update its shown path.
    pub fn set_path(&mut self, id: PanelId, path: impl Into<String>) {
        let path = path.into();
        match self.panels.iter_mut().find(|p| p.id == id) {
            Some(panel) => panel.path = path,
            None => self.panels.push(PanelState {
                id,
                path,
                needs_refresh: false,
            }),
        }
    }

    pub fn path_of(&self, id: PanelId) -> Option<&str> {
        self.panels
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.path.as_str())
    }

    /// Clear and return the panel's pending-refresh flag.
    pub fn take_refresh(&mut self, id: PanelId) -> bool {
        match self.panels.iter_mut().find(|p| p.id == id) {
            Some(panel) => std::mem::take(&mut panel.needs_refresh),
            None => false,
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PanelState> {
        self.panels.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.panels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.panels.is_empty()
    }
}
