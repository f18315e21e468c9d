//! Versioned data objects.
//!
//! A [`DataObject`] sits in exactly one stage output slot. It records what
//! its producer could ever hold (the largest possible region), what a
//! consumer asked for (the requested region), what is actually materialized
//! (the buffered region) and two logical timestamps that drive staleness.

use crate::core::error::{PipelineError, PipelineResult};
use crate::core::region::{contains, crop_to_largest, Region};
use crate::core::time::TimeStamp;
use crate::core::types::{DataValue, ImageInformation};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::Arc;

#[derive(Debug, Default)]
struct DataState {
    information: Option<ImageInformation>,
    information_time: TimeStamp,
    requested_region: Option<Region>,
    buffered_region: Option<Region>,
    value: Option<Arc<DataValue>>,
    modified: TimeStamp,
    pipeline_modified: TimeStamp,
}

/// The output of one stage.
///
/// All accessors take `&self`; state sits behind a lock so that updates on
/// separate threads can share the pipeline. Execution into a data object is
/// serialized by its update lock.
#[derive(Debug)]
pub struct DataObject {
    state: RwLock<DataState>,
    update_lock: Mutex<()>,
}

impl DataObject {
    /// Create an empty data object.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(DataState {
                modified: TimeStamp::tick(),
                ..DataState::default()
            }),
            update_lock: Mutex::new(()),
        }
    }

    // ========================================================================
    // Regions
    // ========================================================================

    /// The maximal extent this object could hold, once information is known.
    pub fn largest_possible_region(&self) -> Option<Region> {
        self.state
            .read()
            .information
            .as_ref()
            .map(|info| info.largest_possible_region.clone())
    }

    /// The region a consumer asked for.
    pub fn requested_region(&self) -> Option<Region> {
        self.state.read().requested_region.clone()
    }

    /// The region currently materialized.
    pub fn buffered_region(&self) -> Option<Region> {
        self.state.read().buffered_region.clone()
    }

    /// Output information, once the producer has described it.
    pub fn information(&self) -> Option<ImageInformation> {
        self.state.read().information.clone()
    }

    /// Ask for `region` on the next update.
    ///
    /// The region is cropped to the largest possible region when that is
    /// already known. Otherwise it is stored as given and checked against the
    /// largest region when the update runs. A region lying entirely outside
    /// the largest region is kept as given so the update reports it.
    pub fn set_requested_region(&self, region: Region) -> PipelineResult<()> {
        region.validate()?;
        let mut state = self.state.write();
        let stored = match &state.information {
            Some(info) => {
                let largest = &info.largest_possible_region;
                if largest.dimension() != region.dimension() {
                    return Err(PipelineError::InvalidRegion {
                        reason: format!(
                            "region {} has {} axes but the output has {}",
                            region,
                            region.dimension(),
                            largest.dimension()
                        ),
                    });
                }
                if region.is_empty() && !largest.is_empty() {
                    return Err(PipelineError::InvalidRegion {
                        reason: format!("empty region {} requested", region),
                    });
                }
                let cropped = crop_to_largest(&region, largest);
                if cropped.is_empty() {
                    region
                } else {
                    cropped
                }
            }
            None => region,
        };
        state.requested_region = Some(stored);
        Ok(())
    }

    /// Ask for the whole output on the next update.
    pub fn set_requested_region_to_largest_possible_region(&self) {
        let mut state = self.state.write();
        state.requested_region = state
            .information
            .as_ref()
            .map(|info| info.largest_possible_region.clone());
    }

    // ========================================================================
    // Timestamps
    // ========================================================================

    /// Signal a change made outside the pipeline's own bookkeeping.
    pub fn mark_modified(&self) {
        self.state.write().modified = TimeStamp::tick();
    }

    /// Time of the last external modification.
    pub fn modified_time(&self) -> TimeStamp {
        self.state.read().modified
    }

    /// Pipeline time recorded by the last successful execution.
    pub fn pipeline_modified_time(&self) -> TimeStamp {
        self.state.read().pipeline_modified
    }

    /// Time the information last changed.
    pub fn information_time(&self) -> TimeStamp {
        self.state.read().information_time
    }

    /// Whether the buffer covers `region` and is no older than `upstream_time`.
    ///
    /// `upstream_time` is the newest modification anywhere upstream of this
    /// object, including its own producer; see
    /// `Pipeline::is_up_to_date_for`.
    pub fn is_up_to_date_for(&self, region: &Region, upstream_time: TimeStamp) -> bool {
        let state = self.state.read();
        Self::current(&state, region, upstream_time).is_some()
    }

    /// The published value, if any.
    pub fn value(&self) -> Option<Arc<DataValue>> {
        self.state.read().value.clone()
    }

    // ========================================================================
    // Pipeline bookkeeping
    // ========================================================================

    /// Store new information. Returns true when it differs from the old one.
    ///
    /// When information changes, a requested region covering the whole of
    /// the old largest region follows the new one. Any other request is
    /// cropped to the new largest region and dropped when nothing of it
    /// remains.
    pub(crate) fn set_information(&self, information: ImageInformation) -> bool {
        let mut state = self.state.write();
        if state.information.as_ref() == Some(&information) {
            return false;
        }
        let old_largest = state
            .information
            .as_ref()
            .map(|info| info.largest_possible_region.clone());
        let largest = &information.largest_possible_region;
        if let Some(requested) = state.requested_region.take() {
            state.requested_region = if requested.dimension() != largest.dimension() {
                None
            } else {
                match old_largest {
                    // Set before anything was known: checked at update time
                    None => Some(requested),
                    Some(old) if old == requested => None,
                    Some(_) if contains(largest, &requested) => Some(requested),
                    Some(_) => Some(crop_to_largest(&requested, largest)).filter(|r| !r.is_empty()),
                }
            };
        }
        state.information = Some(information);
        state.information_time = TimeStamp::tick();
        true
    }

    pub(crate) fn set_requested_region_unchecked(&self, region: Region) {
        self.state.write().requested_region = Some(region);
    }

    /// The published value when it satisfies `region` at `upstream_time`.
    pub(crate) fn current_value_for(
        &self,
        region: &Region,
        upstream_time: TimeStamp,
    ) -> Option<Arc<DataValue>> {
        let state = self.state.read();
        Self::current(&state, region, upstream_time)
    }

    /// Hold this while re-checking staleness, executing and publishing.
    pub(crate) fn lock_update(&self) -> MutexGuard<'_, ()> {
        self.update_lock.lock()
    }

    /// Publish a freshly produced value.
    pub(crate) fn publish(&self, value: Arc<DataValue>, pipeline_time: TimeStamp) {
        let mut state = self.state.write();
        state.buffered_region = Some(value.region());
        state.value = Some(value);
        state.pipeline_modified = pipeline_time;
    }

    fn current(
        state: &DataState,
        region: &Region,
        upstream_time: TimeStamp,
    ) -> Option<Arc<DataValue>> {
        let buffered = state.buffered_region.as_ref()?;
        if state.pipeline_modified < upstream_time || !contains(buffered, region) {
            return None;
        }
        state.value.clone()
    }
}

impl Default for DataObject {
    fn default() -> Self {
        Self::new()
    }
}
