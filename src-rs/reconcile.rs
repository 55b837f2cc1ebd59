use crate::canvas::{ObservedWall, TargetImage};
use crate::diff::{compute_diff, DiffEntry};
use crate::state::{PersistentState, StateStore};
use crate::tag::WallUpdate;
use anyhow::Result;
use tracing::info;

/// Owns the observed wall, the slot watermark and the target image, and
/// folds block tags into them. Every `apply` is persisted before it returns.
pub struct Reconciler<S: StateStore> {
    state: PersistentState,
    target: TargetImage,
    store: S,
}

impl<S: StateStore> Reconciler<S> {
    pub fn open(target: TargetImage, store: S) -> Result<Self> {
        let state = store.load()?;
        Ok(Self {
            state,
            target,
            store,
        })
    }

    /// Folds one block into the wall. Returns whether the write landed inside
    /// the target placement.
    ///
    /// Re-applying the same block is a no-op and the watermark never moves
    /// backwards, so duplicate or out-of-order delivery is safe.
    pub fn apply(&mut self, slot: u64, update: Option<&WallUpdate>) -> Result<bool> {
        let mut changed = false;
        if let Some(update) = update {
            info!(
                slot,
                "pixel change {} #{}", update.position, update.color
            );
            self.state.wall.set(update.position, update.color.clone());
            changed = self.target.contains(update.position);
        }

        if slot > self.state.last_slot {
            self.state.last_slot = slot;
        }

        self.store.save(&self.state)?;
        Ok(changed)
    }

    pub fn diff(&self) -> Vec<DiffEntry> {
        compute_diff(&self.state.wall, &self.target)
    }

    pub fn watermark(&self) -> u64 {
        self.state.last_slot
    }

    pub fn wall(&self) -> &ObservedWall {
        &self.state.wall
    }
}
