//! Demand-driven update engine.
//!
//! An update runs in three passes over the stages upstream of the requested
//! output. Information propagates downstream from the sources, region
//! requests propagate upstream from the requested output, and execution
//! then runs depth-first so a stage only executes once every input it needs
//! has been published. Staleness is decided per output by comparing logical
//! timestamps, so unchanged work is never repeated.

use crate::core::context::{ExecutionContext, InformationContext};
use crate::core::error::{NodeId, PipelineError, PipelineResult, StrataResult};
use crate::core::region::{bounding_union, contains, Region};
use crate::core::time::TimeStamp;
use crate::core::types::DataValue;
use crate::execution::events::{Event, EventPayload};
use crate::graph::structure::{Pipeline, StageNode};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Execution options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Whether stages may split their work across rayon workers.
    pub parallel: bool,
    /// Size of a dedicated worker pool (0 = use the global rayon pool).
    pub max_threads: usize,
    /// Number of chunks a stage's lines are split into. Abort is checked and
    /// progress reported between chunks.
    pub progress_chunks: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            max_threads: 0, // Use all available
            progress_chunks: 8,
        }
    }
}

impl ExecutionOptions {
    /// Create a new options builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable/disable parallel execution.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Set maximum threads.
    pub fn with_max_threads(mut self, max: usize) -> Self {
        self.max_threads = max;
        self
    }

    /// Set the number of progress chunks (at least 1).
    pub fn with_progress_chunks(mut self, chunks: usize) -> Self {
        self.progress_chunks = chunks.max(1);
        self
    }

    /// Parse options from TOML. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> StrataResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load options from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> StrataResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

/// Update statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateStats {
    /// Number of outputs computed. A stage with several outputs counts once
    /// per output it computed.
    pub outputs_executed: usize,
    /// Number of outputs found up to date and reused.
    pub outputs_reused: usize,
    /// Total update time.
    pub duration: Duration,
}

/// Result of an update.
#[derive(Debug, Clone)]
pub struct UpdateReport {
    /// The value of the requested output.
    pub output: Arc<DataValue>,
    /// Update statistics.
    pub stats: UpdateStats,
}

type OutputKey = (NodeId, usize);

/// State of one update call.
///
/// Upstream times are memoized and requests reaching the same output from
/// several consumers are merged, so within one sweep every output is
/// negotiated to a single region and computed at most once.
struct UpdateSweep<'p> {
    pipeline: &'p Pipeline,
    informed: HashSet<NodeId>,
    node_times: HashMap<NodeId, TimeStamp>,
    requested: HashMap<OutputKey, Region>,
    produced: HashMap<OutputKey, Arc<DataValue>>,
    stats: UpdateStats,
}

impl<'p> UpdateSweep<'p> {
    fn new(pipeline: &'p Pipeline) -> Self {
        Self {
            pipeline,
            informed: HashSet::new(),
            node_times: HashMap::new(),
            requested: HashMap::new(),
            produced: HashMap::new(),
            stats: UpdateStats::default(),
        }
    }

    fn node(&self, id: NodeId) -> PipelineResult<&'p StageNode> {
        Ok(self.pipeline.node(id)?)
    }

    /// Resolve the producer endpoint of input `index` to a node and output index.
    fn producer(&self, node: &StageNode, index: usize) -> PipelineResult<Option<(&'p StageNode, usize)>> {
        match &node.inputs[index].source {
            Some(endpoint) => {
                let producer = self.node(endpoint.node_id)?;
                let output = producer.output_index(&endpoint.port)?;
                Ok(Some((producer, output)))
            }
            None => Ok(None),
        }
    }

    fn information_context(&self, node: &StageNode) -> PipelineResult<InformationContext> {
        let mut inputs = Vec::with_capacity(node.inputs.len());
        for index in 0..node.inputs.len() {
            let info = self
                .producer(node, index)?
                .and_then(|(producer, output)| producer.outputs[output].data.information());
            inputs.push(info);
        }
        let names = node.inputs.iter().map(|slot| slot.name.clone()).collect();
        Ok(InformationContext::new(node.id, names, inputs))
    }

    // ========================================================================
    // Upstream Time
    // ========================================================================

    /// Newest modification of the stage or anything upstream of it.
    fn node_time(&mut self, id: NodeId) -> PipelineResult<TimeStamp> {
        if let Some(time) = self.node_times.get(&id) {
            return Ok(*time);
        }
        let node = self.node(id)?;
        let mut time = node.modified;
        for index in 0..node.inputs.len() {
            if let Some((producer, output)) = self.producer(node, index)? {
                time = time.max(self.pipeline_time(producer.id, output)?);
            }
        }
        self.node_times.insert(id, time);
        Ok(time)
    }

    /// The time an output must have been computed at to be current.
    fn pipeline_time(&mut self, id: NodeId, output: usize) -> PipelineResult<TimeStamp> {
        let node_time = self.node_time(id)?;
        let data_time = self.node(id)?.outputs[output].data.modified_time();
        Ok(node_time.max(data_time))
    }

    // ========================================================================
    // Information Propagation
    // ========================================================================

    fn propagate_information(&mut self, id: NodeId) -> PipelineResult<()> {
        if self.informed.contains(&id) {
            return Ok(());
        }
        let node = self.node(id)?;

        let mut newest_input = TimeStamp::ZERO;
        for (index, slot) in node.inputs.iter().enumerate() {
            match self.producer(node, index)? {
                Some((producer, output)) => {
                    self.propagate_information(producer.id)?;
                    newest_input = newest_input.max(producer.outputs[output].data.information_time());
                }
                None if slot.optional => {}
                None => {
                    return Err(PipelineError::MissingInput {
                        node_id: id,
                        port: slot.name.clone(),
                    })
                }
            }
        }

        let mut information_time = node.information_time.lock();
        if *information_time < node.modified || *information_time < newest_input {
            let ctx = self.information_context(node)?;
            let infos = node.stage.generate_output_information(&ctx)?;
            if infos.len() != node.outputs.len() {
                return Err(PipelineError::Execution {
                    node_id: id,
                    error: format!(
                        "Stage described {} outputs but has {}",
                        infos.len(),
                        node.outputs.len()
                    ),
                });
            }
            for (slot, info) in node.outputs.iter().zip(infos) {
                let largest = info.largest_possible_region.clone();
                if slot.data.set_information(info) {
                    trace!("Node {} output '{}' now spans {}", id, slot.name, largest);
                }
            }
            *information_time = TimeStamp::tick();
        }
        drop(information_time);

        self.informed.insert(id);
        Ok(())
    }

    // ========================================================================
    // Region Propagation
    // ========================================================================

    fn propagate_region(&mut self, id: NodeId, output: usize, region: Region) -> PipelineResult<()> {
        let node = self.node(id)?;
        let slot = &node.outputs[output];
        let key = (id, output);

        let merged = match self.requested.get(&key) {
            Some(previous) => {
                let merged = bounding_union(previous, &region);
                if &merged == previous {
                    return Ok(());
                }
                merged
            }
            None => region,
        };

        let largest = slot.data.largest_possible_region().unwrap_or_default();
        if !contains(&largest, &merged) {
            return Err(PipelineError::RegionOutsideBounds {
                node_id: id,
                port: slot.name.clone(),
                requested: merged,
                largest,
            });
        }

        trace!("Node {} output '{}' requested {}", id, slot.name, merged);
        slot.data.set_requested_region_unchecked(merged.clone());
        self.requested.insert(key, merged.clone());

        let ctx = self.information_context(node)?;
        let required = node.stage.required_input_regions(output, &merged, &ctx)?;

        for (index, region) in required.into_iter().enumerate().take(node.inputs.len()) {
            let (Some(region), Some((producer, producer_output))) = (region, self.producer(node, index)?)
            else {
                continue;
            };
            let input_largest = producer.outputs[producer_output]
                .data
                .largest_possible_region()
                .unwrap_or_default();
            if !contains(&input_largest, &region) {
                return Err(PipelineError::RegionOutsideBounds {
                    node_id: id,
                    port: node.inputs[index].name.clone(),
                    requested: region,
                    largest: input_largest,
                });
            }
            self.propagate_region(producer.id, producer_output, region)?;
        }
        Ok(())
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Make output `output` of `id` current for its negotiated region.
    fn ensure(&mut self, id: NodeId, output: usize) -> PipelineResult<Arc<DataValue>> {
        let key = (id, output);
        if let Some(value) = self.produced.get(&key) {
            return Ok(value.clone());
        }

        let node = self.node(id)?;
        let slot = &node.outputs[output];
        let region = self
            .requested
            .get(&key)
            .cloned()
            .ok_or_else(|| PipelineError::Execution {
                node_id: id,
                error: format!("No region was negotiated for output '{}'", slot.name),
            })?;
        let upstream_time = self.pipeline_time(id, output)?;

        if let Some(value) = slot.data.current_value_for(&region, upstream_time) {
            debug!("Node {} output '{}' is up to date for {}", id, slot.name, region);
            return Ok(self.reuse(key, value));
        }

        // Inputs first; each snapshot stays valid even if another thread
        // republishes the producer while this stage runs.
        let mut inputs = Vec::with_capacity(node.inputs.len());
        for index in 0..node.inputs.len() {
            let value = match self.producer(node, index)? {
                Some((producer, producer_output)) if self.requested.contains_key(&(producer.id, producer_output)) => {
                    Some(self.ensure(producer.id, producer_output)?)
                }
                _ => None,
            };
            inputs.push(value);
        }

        let _guard = slot.data.lock_update();
        if let Some(value) = slot.data.current_value_for(&region, upstream_time) {
            debug!("Node {} output '{}' was produced concurrently", id, slot.name);
            return Ok(self.reuse(key, value));
        }

        let value = Arc::new(self.execute(node, output, region, inputs)?);
        slot.data.publish(value.clone(), upstream_time);
        self.stats.outputs_executed += 1;
        self.produced.insert(key, value.clone());
        Ok(value)
    }

    fn reuse(&mut self, key: OutputKey, value: Arc<DataValue>) -> Arc<DataValue> {
        self.stats.outputs_reused += 1;
        self.produced.insert(key, value.clone());
        value
    }

    fn execute(
        &self,
        node: &StageNode,
        output: usize,
        region: Region,
        inputs: Vec<Option<Arc<DataValue>>>,
    ) -> PipelineResult<DataValue> {
        let slot = &node.outputs[output];
        let emit = |payload: EventPayload| {
            node.events.notify(&Event {
                node_id: node.id,
                output: slot.name.clone(),
                payload,
            })
        };

        debug!(
            "Executing node {} ('{}') output '{}' over {}",
            node.id,
            node.display_name(),
            slot.name,
            region
        );
        node.abort.clear();
        emit(EventPayload::Start)?;
        emit(EventPayload::Progress { fraction: 0.0 })?;

        let information = slot.data.information().ok_or_else(|| PipelineError::Execution {
            node_id: node.id,
            error: format!("Output '{}' has no information", slot.name),
        })?;
        let mut ctx = ExecutionContext::new(
            self.information_context(node)?,
            inputs,
            output,
            slot.name.clone(),
            region.clone(),
            information,
            &node.events,
            &node.abort,
            self.pipeline.options(),
        )
        .with_pool(self.pipeline.pool.as_deref());

        let value = match node.stage.generate_data(&mut ctx) {
            Ok(value) => value,
            Err(error @ PipelineError::Aborted { .. }) => {
                warn!("Node {} output '{}' aborted", node.id, slot.name);
                emit(EventPayload::Abort)?;
                return Err(error);
            }
            Err(error) => return Err(error),
        };

        let produced = value.region();
        if !contains(&produced, &region) {
            return Err(PipelineError::Execution {
                node_id: node.id,
                error: format!(
                    "Output '{}' produced {} but {} was requested",
                    slot.name, produced, region
                ),
            });
        }

        emit(EventPayload::Progress { fraction: 1.0 })?;
        emit(EventPayload::End)?;
        Ok(value)
    }
}

// ============================================================================
// Pipeline Update API
// ============================================================================

impl Pipeline {
    /// Bring an output up to date for its requested region.
    ///
    /// The output's stored requested region is used, or the whole output
    /// when none was set. A repeated call with nothing modified executes
    /// nothing.
    pub fn request_update(&self, id: NodeId, port: &str) -> PipelineResult<UpdateReport> {
        let start = Instant::now();
        let mut sweep = UpdateSweep::new(self);

        let node = self.node(id)?;
        let output = node.output_index(port)?;
        let data = &node.outputs[output].data;

        sweep.propagate_information(id)?;

        let largest = data.largest_possible_region().unwrap_or_default();
        let region = data.requested_region().unwrap_or_else(|| largest.clone());
        if region.is_empty() && !largest.is_empty() {
            return Err(PipelineError::InvalidRegion {
                reason: format!("empty region {} requested on output '{}'", region, port),
            });
        }
        if !contains(&largest, &region) {
            return Err(PipelineError::RegionOutsideBounds {
                node_id: id,
                port: port.to_string(),
                requested: region,
                largest,
            });
        }

        sweep.propagate_region(id, output, region)?;
        let value = sweep.ensure(id, output)?;

        let mut stats = sweep.stats;
        stats.duration = start.elapsed();
        debug!(
            "Updated node {} output '{}': {} executed, {} reused in {:?}",
            id, port, stats.outputs_executed, stats.outputs_reused, stats.duration
        );
        Ok(UpdateReport { output: value, stats })
    }

    /// Set an output's requested region, then update it.
    pub fn update_region(&self, id: NodeId, port: &str, region: Region) -> PipelineResult<UpdateReport> {
        self.data(id, port)?.set_requested_region(region)?;
        self.request_update(id, port)
    }

    /// Set an output's requested region to everything it can hold, then update it.
    pub fn update_largest_possible_region(&self, id: NodeId, port: &str) -> PipelineResult<UpdateReport> {
        self.update_output_information(id)?;
        self.data(id, port)?.set_requested_region_to_largest_possible_region();
        self.request_update(id, port)
    }

    /// Propagate output information up to and including `id`, without
    /// negotiating regions or executing anything.
    pub fn update_output_information(&self, id: NodeId) -> PipelineResult<()> {
        UpdateSweep::new(self).propagate_information(id)
    }

    /// Whether an output currently holds `region` computed from the current
    /// state of everything upstream.
    pub fn is_up_to_date_for(&self, id: NodeId, port: &str, region: &Region) -> PipelineResult<bool> {
        let node = self.node(id)?;
        let output = node.output_index(port)?;
        let upstream_time = UpdateSweep::new(self).pipeline_time(id, output)?;
        Ok(node.outputs[output].data.is_up_to_date_for(region, upstream_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::{execution_error, PortDefinition, ProcessObject, StageMetadata};
    use crate::core::types::{ArrayBuffer, ImageInformation};
    use crate::execution::events::EventKind;
    use crate::filters::builtin::{
        ArraySource, CombineStage, FunctionSource, MeanSmoothing, PointwiseStage,
    };
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ramp(size: [i64; 2]) -> ArrayBuffer {
        ArrayBuffer::from_fn(Region::from_size(size), |idx| (idx[0] + 10 * idx[1]) as f32).unwrap()
    }

    fn counting_source(size: [i64; 2], counter: Arc<AtomicUsize>) -> FunctionSource {
        FunctionSource::new(ImageInformation::new(Region::from_size(size)), move |idx| {
            counter.fetch_add(1, Ordering::Relaxed);
            (idx[0] + idx[1]) as f32
        })
    }

    #[test]
    fn test_options_from_toml() {
        let options = ExecutionOptions::from_toml_str("parallel = false\nprogress_chunks = 2\n").unwrap();
        assert!(!options.parallel);
        assert_eq!(options.progress_chunks, 2);
        assert_eq!(options.max_threads, 0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.toml");
        std::fs::write(&path, "max_threads = 3").unwrap();
        let options = ExecutionOptions::from_toml_file(&path).unwrap();
        assert_eq!(options.max_threads, 3);
        assert!(options.parallel);

        assert!(ExecutionOptions::from_toml_str("parallel = 7").is_err());
    }

    #[test]
    fn test_identity_pipeline() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(ramp([5, 4])));
        let identity = pipeline.add_stage(PointwiseStage::identity());
        pipeline.connect(src, "output", identity, "input").unwrap();

        let report = pipeline.request_update(identity, "output").unwrap();
        assert_eq!(report.stats.outputs_executed, 2);
        assert_eq!(report.output.as_array(), Some(&ramp([5, 4])));

        let data = pipeline.data(identity, "output").unwrap();
        assert_eq!(data.buffered_region(), data.largest_possible_region());
        let source_data = pipeline.data(src, "output").unwrap();
        assert!(data.pipeline_modified_time() >= source_data.pipeline_modified_time());
    }

    #[test]
    fn test_repeat_update_is_noop() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(ramp([6, 6])));
        let identity = pipeline.add_stage(PointwiseStage::identity());
        pipeline.connect(src, "output", identity, "input").unwrap();

        pipeline.update_region(identity, "output", Region::from_size([6, 6])).unwrap();
        let before = pipeline.data(identity, "output").unwrap().pipeline_modified_time();

        // A sub-region of what is buffered needs nothing new
        let report = pipeline
            .update_region(identity, "output", Region::new([1, 2], [3, 3]))
            .unwrap();
        assert_eq!(report.stats.outputs_executed, 0);
        assert_eq!(report.stats.outputs_reused, 1);
        assert_eq!(pipeline.data(identity, "output").unwrap().pipeline_modified_time(), before);
    }

    #[test]
    fn test_larger_region_reexecutes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(counting_source([8, 8], counter.clone()));

        pipeline.update_region(src, "output", Region::new([0, 0], [2, 2])).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 4);

        let report = pipeline.update_region(src, "output", Region::new([0, 0], [4, 2])).unwrap();
        assert_eq!(report.stats.outputs_executed, 1);
        assert_eq!(counter.load(Ordering::Relaxed), 12);
        assert_eq!(
            pipeline.data(src, "output").unwrap().buffered_region(),
            Some(Region::new([0, 0], [4, 2]))
        );
    }

    #[test]
    fn test_mark_modified_makes_stale() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(ramp([4, 4])));
        let identity = pipeline.add_stage(PointwiseStage::identity());
        pipeline.connect(src, "output", identity, "input").unwrap();
        let full = Region::from_size([4, 4]);

        pipeline.request_update(identity, "output").unwrap();
        assert!(pipeline.is_up_to_date_for(identity, "output", &full).unwrap());

        pipeline.mark_modified(src).unwrap();
        assert!(!pipeline.is_up_to_date_for(identity, "output", &full).unwrap());

        let report = pipeline.request_update(identity, "output").unwrap();
        assert_eq!(report.stats.outputs_executed, 2);
        assert!(pipeline.is_up_to_date_for(identity, "output", &full).unwrap());

        // Marking the data object itself works the same way
        pipeline.data(src, "output").unwrap().mark_modified();
        assert!(!pipeline.is_up_to_date_for(identity, "output", &full).unwrap());
    }

    #[test]
    fn test_missing_input_keeps_prior_output() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(ramp([3, 3])));
        let identity = pipeline.add_stage(PointwiseStage::identity());
        pipeline.connect(src, "output", identity, "input").unwrap();
        pipeline.request_update(identity, "output").unwrap();

        let data = pipeline.data(identity, "output").unwrap();
        let buffered = data.buffered_region();
        let time = data.pipeline_modified_time();

        pipeline.disconnect_input(identity, "input").unwrap();
        let result = pipeline.request_update(identity, "output");
        match result {
            Err(PipelineError::MissingInput { node_id, port }) => {
                assert_eq!(node_id, identity);
                assert_eq!(port, "input");
            }
            other => panic!("expected missing input, got {:?}", other),
        }

        let data = pipeline.data(identity, "output").unwrap();
        assert_eq!(data.buffered_region(), buffered);
        assert_eq!(data.pipeline_modified_time(), time);
    }

    #[test]
    fn test_region_outside_bounds() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(ramp([4, 4])));
        pipeline.update_output_information(src).unwrap();

        // Cropped to nothing: the request lies entirely outside
        let result = pipeline.update_region(src, "output", Region::new([10, 10], [2, 2]));
        assert!(matches!(result, Err(PipelineError::RegionOutsideBounds { .. })));

        let result = pipeline.update_region(src, "output", Region::new([0, 0], [2, 2, 2]));
        assert!(matches!(result, Err(PipelineError::InvalidRegion { .. })));
        assert_eq!(pipeline.data(src, "output").unwrap().buffered_region(), None);
    }

    #[test]
    fn test_request_before_information_is_checked() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(ramp([4, 4])));
        pipeline
            .data(src, "output")
            .unwrap()
            .set_requested_region(Region::new([2, 2], [4, 4]))
            .unwrap();

        let result = pipeline.request_update(src, "output");
        assert!(matches!(result, Err(PipelineError::RegionOutsideBounds { .. })));
    }

    #[test]
    fn test_diamond_executes_shared_ancestor_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(counting_source([4, 4], counter.clone()));
        let left = pipeline.add_stage(PointwiseStage::new("double", |v| v * 2.0));
        let right = pipeline.add_stage(PointwiseStage::new("negate", |v| -v));
        let join = pipeline.add_stage(CombineStage::add());
        pipeline.connect(src, "output", left, "input").unwrap();
        pipeline.connect(src, "output", right, "input").unwrap();
        pipeline.connect(left, "output", join, "left").unwrap();
        pipeline.connect(right, "output", join, "right").unwrap();

        let report = pipeline.request_update(join, "output").unwrap();
        assert_eq!(report.stats.outputs_executed, 4);
        assert_eq!(counter.load(Ordering::Relaxed), 16);

        let buffer = report.output.as_array().unwrap();
        assert_eq!(buffer.get(&[3, 2]), Some(5.0));
    }

    #[test]
    fn test_diamond_merges_requests() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(counting_source([10, 10], counter.clone()));
        let smooth = pipeline.add_stage(MeanSmoothing::new(vec![1, 1]));
        let identity = pipeline.add_stage(PointwiseStage::identity());
        let join = pipeline.add_stage(CombineStage::add());
        pipeline.connect(src, "output", smooth, "input").unwrap();
        pipeline.connect(src, "output", identity, "input").unwrap();
        pipeline.connect(smooth, "output", join, "left").unwrap();
        pipeline.connect(identity, "output", join, "right").unwrap();

        pipeline.update_region(join, "output", Region::new([4, 4], [2, 2])).unwrap();
        // One execution over the union of [3,3]+4x4 and [4,4]+2x2
        assert_eq!(counter.load(Ordering::Relaxed), 16);
        assert_eq!(
            pipeline.data(src, "output").unwrap().buffered_region(),
            Some(Region::new([3, 3], [4, 4]))
        );
    }

    #[test]
    fn test_concurrent_branches_share_ancestor() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(counting_source([32, 32], counter.clone()));
        let left = pipeline.add_stage(PointwiseStage::new("double", |v| v * 2.0));
        let right = pipeline.add_stage(PointwiseStage::new("square", |v| v * v));
        pipeline.connect(src, "output", left, "input").unwrap();
        pipeline.connect(src, "output", right, "input").unwrap();

        let pipeline = &pipeline;
        std::thread::scope(|scope| {
            let a = scope.spawn(move || pipeline.request_update(left, "output").unwrap());
            let b = scope.spawn(move || pipeline.request_update(right, "output").unwrap());
            a.join().unwrap();
            b.join().unwrap();
        });

        assert_eq!(counter.load(Ordering::Relaxed), 32 * 32);
    }

    #[test]
    fn test_events_around_execution() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(ramp([4, 4])));
        let identity = pipeline.add_stage(PointwiseStage::identity());
        pipeline.connect(src, "output", identity, "input").unwrap();

        let kinds = Arc::new(Mutex::new(Vec::new()));
        let seen = kinds.clone();
        pipeline
            .add_observer(identity, EventKind::Any, move |event| {
                seen.lock().push(event.kind());
                Ok(())
            })
            .unwrap();

        pipeline.request_update(identity, "output").unwrap();
        let kinds = kinds.lock();
        assert_eq!(kinds.first(), Some(&EventKind::Start));
        assert_eq!(kinds.last(), Some(&EventKind::End));
        assert!(kinds.iter().filter(|k| **k == EventKind::Progress).count() >= 2);
    }

    #[test]
    fn test_listener_failure_leaves_output_untouched() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(ramp([4, 4])));
        let identity = pipeline.add_stage(PointwiseStage::identity());
        pipeline.connect(src, "output", identity, "input").unwrap();

        let listener = pipeline
            .add_observer(identity, EventKind::End, |_| anyhow::bail!("disk full"))
            .unwrap();

        let result = pipeline.request_update(identity, "output");
        match result {
            Err(PipelineError::ListenerFailure { node_id, kind, .. }) => {
                assert_eq!(node_id, identity);
                assert_eq!(kind, EventKind::End);
            }
            other => panic!("expected listener failure, got {:?}", other),
        }
        let data = pipeline.data(identity, "output").unwrap();
        assert_eq!(data.buffered_region(), None);
        assert!(data.value().is_none());

        // Retry after removing the cause
        assert!(pipeline.remove_observer(identity, listener).unwrap());
        let report = pipeline.request_update(identity, "output").unwrap();
        assert_eq!(report.stats.outputs_executed, 1);
        assert_eq!(report.stats.outputs_reused, 1);
    }

    #[test]
    fn test_abort_leaves_output_untouched() {
        let options = ExecutionOptions::new().with_progress_chunks(4).with_parallel(false);
        let mut pipeline = Pipeline::with_options(options).unwrap();
        let src = pipeline.add_stage(ArraySource::new(ramp([8, 8])));
        let identity = pipeline.add_stage(PointwiseStage::identity());
        pipeline.connect(src, "output", identity, "input").unwrap();

        let abort = pipeline.abort_handle(identity).unwrap();
        let trigger = abort.clone();
        pipeline
            .add_observer(identity, EventKind::Progress, move |event| {
                if let EventPayload::Progress { fraction } = event.payload {
                    if fraction > 0.0 && fraction < 1.0 {
                        trigger.raise();
                    }
                }
                Ok(())
            })
            .unwrap();
        let aborts = Arc::new(AtomicUsize::new(0));
        let counter = aborts.clone();
        pipeline
            .add_observer(identity, EventKind::Abort, move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .unwrap();

        let result = pipeline.request_update(identity, "output");
        assert!(matches!(result, Err(PipelineError::Aborted { node_id }) if node_id == identity));
        assert!(result.as_ref().err().is_some_and(PipelineError::is_retryable));
        assert_eq!(aborts.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.data(identity, "output").unwrap().buffered_region(), None);
    }

    #[test]
    fn test_configure_reexecutes() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(ramp([3, 3])));
        let scale = pipeline.add_stage(PointwiseStage::new("scale", |v| v * 2.0));
        pipeline.connect(src, "output", scale, "input").unwrap();
        pipeline.request_update(scale, "output").unwrap();

        pipeline
            .configure::<PointwiseStage, _, _>(scale, |stage| stage.set_function(|v| v * 3.0))
            .unwrap();
        let report = pipeline.request_update(scale, "output").unwrap();
        assert_eq!(report.stats.outputs_executed, 1);
        assert_eq!(report.output.as_array().unwrap().get(&[1, 1]), Some(33.0));
    }

    /// Repeats a copy of its input, reporting each pass.
    struct Relaxation {
        passes: usize,
    }

    impl ProcessObject for Relaxation {
        fn metadata(&self) -> StageMetadata {
            StageMetadata::builder("relaxation", "Relaxation")
                .input(PortDefinition::new("input"))
                .output(PortDefinition::new("output"))
                .build()
        }

        fn generate_data(&self, ctx: &mut ExecutionContext<'_>) -> PipelineResult<DataValue> {
            let input = ctx.input_array(0)?;
            let mut buffer = None;
            for pass in 0..self.passes {
                buffer = Some(ctx.generate_buffer(|idx| input.get(idx).unwrap_or(0.0))?);
                ctx.notify_iteration(pass)?;
            }
            buffer
                .map(DataValue::from)
                .ok_or_else(|| execution_error(ctx, "no passes configured"))
        }
    }

    fn relaxation_pipeline(passes: usize) -> (Pipeline, NodeId) {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(ramp([4, 4])));
        let relax = pipeline.add_stage(Relaxation { passes });
        pipeline.connect(src, "output", relax, "input").unwrap();
        (pipeline, relax)
    }

    #[test]
    fn test_iteration_events_in_order() {
        let (pipeline, relax) = relaxation_pipeline(3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        pipeline
            .add_observer(relax, EventKind::Iteration, move |event| {
                if let EventPayload::Iteration { index } = event.payload {
                    record.lock().push(index);
                }
                Ok(())
            })
            .unwrap();

        let report = pipeline.request_update(relax, "output").unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(report.output.as_array().unwrap().get(&[2, 1]), Some(12.0));

        // Up to date: no further passes
        pipeline.request_update(relax, "output").unwrap();
        assert_eq!(seen.lock().len(), 3);
    }

    #[test]
    fn test_iteration_listener_failure() {
        let (pipeline, relax) = relaxation_pipeline(3);
        pipeline
            .add_observer(relax, EventKind::Iteration, |event| match event.payload {
                EventPayload::Iteration { index: 1 } => anyhow::bail!("diverged"),
                _ => Ok(()),
            })
            .unwrap();

        match pipeline.request_update(relax, "output") {
            Err(PipelineError::ListenerFailure { node_id, kind, .. }) => {
                assert_eq!(node_id, relax);
                assert_eq!(kind, EventKind::Iteration);
            }
            other => panic!("expected listener failure, got {:?}", other),
        }
        let data = pipeline.data(relax, "output").unwrap();
        assert_eq!(data.buffered_region(), None);
        assert!(data.value().is_none());
    }

    #[test]
    fn test_default_region_follows_resized_source() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(ramp([8, 8])));
        pipeline.request_update(src, "output").unwrap();

        pipeline
            .configure::<ArraySource, _, _>(src, |stage| stage.set_buffer(ramp([4, 4])))
            .unwrap();
        let report = pipeline.request_update(src, "output").unwrap();
        assert_eq!(report.output.region(), Region::from_size([4, 4]));

        // Growing again follows the new extent too
        pipeline
            .configure::<ArraySource, _, _>(src, |stage| stage.set_buffer(ramp([6, 6])))
            .unwrap();
        let report = pipeline.request_update(src, "output").unwrap();
        assert_eq!(report.output.region(), Region::from_size([6, 6]));
    }

    #[test]
    fn test_partial_request_cropped_after_shrink() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(ramp([8, 8])));
        pipeline
            .update_region(src, "output", Region::new([2, 2], [6, 6]))
            .unwrap();

        pipeline
            .configure::<ArraySource, _, _>(src, |stage| stage.set_buffer(ramp([4, 4])))
            .unwrap();
        let report = pipeline.request_update(src, "output").unwrap();
        assert_eq!(report.output.region(), Region::new([2, 2], [2, 2]));
    }

    #[test]
    fn test_empty_request_is_invalid() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(ramp([8, 8])));
        pipeline.update_output_information(src).unwrap();

        let result = pipeline.update_region(src, "output", Region::new([0, 0], [0, 4]));
        assert!(matches!(result, Err(PipelineError::InvalidRegion { .. })));
        assert_eq!(pipeline.data(src, "output").unwrap().buffered_region(), None);

        // Stored before the information is known, rejected at update time
        let other = pipeline.add_stage(ArraySource::new(ramp([8, 8])));
        let data = pipeline.data(other, "output").unwrap();
        data.set_requested_region(Region::new([0, 0], [0, 4])).unwrap();
        assert!(matches!(
            pipeline.request_update(other, "output"),
            Err(PipelineError::InvalidRegion { .. })
        ));
    }

    #[test]
    fn test_update_largest_possible_region() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(ramp([4, 4])));
        pipeline.update_region(src, "output", Region::new([0, 0], [1, 1])).unwrap();

        let report = pipeline.update_largest_possible_region(src, "output").unwrap();
        assert_eq!(report.output.region(), Region::from_size([4, 4]));
    }
}
