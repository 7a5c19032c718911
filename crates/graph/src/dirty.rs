use roiflow_core::Roi;
use serde::Serialize;

/// Regions of a slot that are stale since it was last configured.
///
/// Kept as a list of boxes; a region already covered by another one is not
/// stored twice.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DirtySet {
    regions: Vec<Roi>,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_clean(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn regions(&self) -> &[Roi] {
        &self.regions
    }

    /// Union `roi` into the set.
    pub fn insert(&mut self, roi: Roi) {
        if self.regions.iter().any(|r| r.contains(&roi)) {
            return;
        }
        self.regions.retain(|r| !roi.contains(r));
        self.regions.push(roi);
    }

    /// Does any stale region overlap `roi`?
    pub fn intersects(&self, roi: &Roi) -> bool {
        self.regions.iter().any(|r| r.intersection(roi).is_some())
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }

    pub fn take(&mut self) -> Vec<Roi> {
        std::mem::take(&mut self.regions)
    }
}
