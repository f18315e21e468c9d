//! Information and execution contexts.
//!
//! Contexts give a stage access to its inputs while the pipeline drives it.
//! An [`InformationContext`] carries input information only; an
//! [`ExecutionContext`] additionally carries input values, the region to
//! produce, and the stage's event channel and abort flag.

use crate::core::error::{NodeId, PipelineError, PipelineResult};
use crate::core::region::Region;
use crate::core::types::{ArrayBuffer, DataValue, ImageInformation};
use crate::execution::engine::ExecutionOptions;
use crate::execution::events::{AbortFlag, Event, EventChannel, EventPayload};
use rayon::prelude::*;
use std::sync::Arc;

/// Context provided while information and regions propagate.
#[derive(Debug, Clone)]
pub struct InformationContext {
    node_id: NodeId,
    input_names: Vec<String>,
    inputs: Vec<Option<ImageInformation>>,
}

impl InformationContext {
    /// Create a context. `inputs[i]` is `None` when input `i` is unbound.
    pub fn new(node_id: NodeId, input_names: Vec<String>, inputs: Vec<Option<ImageInformation>>) -> Self {
        Self {
            node_id,
            input_names,
            inputs,
        }
    }

    /// The node being driven.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Number of input slots.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Whether input `index` is bound to an upstream output.
    pub fn is_bound(&self, index: usize) -> bool {
        matches!(self.inputs.get(index), Some(Some(_)))
    }

    /// Name of input `index`.
    pub fn input_name(&self, index: usize) -> &str {
        self.input_names.get(index).map(String::as_str).unwrap_or("input")
    }

    /// Information of input `index`; `MissingInput` when unbound.
    pub fn input_information(&self, index: usize) -> PipelineResult<&ImageInformation> {
        self.inputs
            .get(index)
            .and_then(Option::as_ref)
            .ok_or_else(|| PipelineError::MissingInput {
                node_id: self.node_id,
                port: self.input_name(index).to_string(),
            })
    }
}

/// Context provided while a stage computes one output.
pub struct ExecutionContext<'a> {
    node_id: NodeId,
    output_index: usize,
    output_name: String,
    output_region: Region,
    output_information: ImageInformation,
    information: InformationContext,
    inputs: Vec<Option<Arc<DataValue>>>,
    events: &'a EventChannel,
    abort: &'a AbortFlag,
    options: &'a ExecutionOptions,
    pool: Option<&'a rayon::ThreadPool>,
}

impl<'a> ExecutionContext<'a> {
    /// Create a context for computing `region` on output `output_index`.
    ///
    /// `inputs[i]` holds the value published by the producer bound to
    /// input `i`, or `None` when the input is unbound.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        information: InformationContext,
        inputs: Vec<Option<Arc<DataValue>>>,
        output_index: usize,
        output_name: impl Into<String>,
        output_region: Region,
        output_information: ImageInformation,
        events: &'a EventChannel,
        abort: &'a AbortFlag,
        options: &'a ExecutionOptions,
    ) -> Self {
        Self {
            node_id: information.node_id(),
            output_index,
            output_name: output_name.into(),
            output_region,
            output_information,
            information,
            inputs,
            events,
            abort,
            options,
            pool: None,
        }
    }

    /// Run parallel work inside `pool` instead of the global rayon pool.
    pub fn with_pool(mut self, pool: Option<&'a rayon::ThreadPool>) -> Self {
        self.pool = pool;
        self
    }

    /// The node being executed.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Index of the output being computed.
    pub fn output_index(&self) -> usize {
        self.output_index
    }

    /// Name of the output being computed.
    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    /// The region the produced value must cover.
    pub fn output_region(&self) -> &Region {
        &self.output_region
    }

    /// Information of the output being computed.
    pub fn output_information(&self) -> &ImageInformation {
        &self.output_information
    }

    /// Input information, as seen during propagation.
    pub fn information(&self) -> &InformationContext {
        &self.information
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    /// Number of input slots.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Whether input `index` holds a value.
    pub fn is_bound(&self, index: usize) -> bool {
        matches!(self.inputs.get(index), Some(Some(_)))
    }

    /// Value of input `index`.
    pub fn input(&self, index: usize) -> PipelineResult<&DataValue> {
        self.inputs
            .get(index)
            .and_then(Option::as_deref)
            .ok_or_else(|| PipelineError::MissingInput {
                node_id: self.node_id,
                port: self.information.input_name(index).to_string(),
            })
    }

    /// Value of input `index` as a sample buffer.
    pub fn input_array(&self, index: usize) -> PipelineResult<&ArrayBuffer> {
        let value = self.input(index)?;
        value.as_array().ok_or_else(|| PipelineError::Execution {
            node_id: self.node_id,
            error: format!(
                "Input '{}' holds a {} value, expected an array",
                self.information.input_name(index),
                value.type_name()
            ),
        })
    }

    /// Information of input `index`.
    pub fn input_information(&self, index: usize) -> PipelineResult<&ImageInformation> {
        self.information.input_information(index)
    }

    // ========================================================================
    // Progress and Abort
    // ========================================================================

    /// Fail with `Aborted` if the stage's abort flag is raised.
    pub fn check_abort(&self) -> PipelineResult<()> {
        if self.abort.is_raised() {
            Err(PipelineError::Aborted {
                node_id: self.node_id,
            })
        } else {
            Ok(())
        }
    }

    /// Tell listeners how much of the output is done (0.0 to 1.0).
    pub fn report_progress(&self, fraction: f32) -> PipelineResult<()> {
        self.emit(EventPayload::Progress {
            fraction: fraction.clamp(0.0, 1.0),
        })
    }

    /// Tell listeners an internal iteration finished.
    pub fn notify_iteration(&self, index: usize) -> PipelineResult<()> {
        self.emit(EventPayload::Iteration { index })
    }

    fn emit(&self, payload: EventPayload) -> PipelineResult<()> {
        self.events.notify(&Event {
            node_id: self.node_id,
            output: self.output_name.clone(),
            payload,
        })
    }

    // ========================================================================
    // Parallel Work
    // ========================================================================

    /// Compute `count` output lines with `line`, returning them in order.
    ///
    /// Lines are processed in chunks. Within a chunk they run on rayon when
    /// parallel execution is enabled; between chunks the abort flag is
    /// checked and progress is reported on the calling thread.
    pub fn map_lines<F>(&self, count: usize, line: F) -> PipelineResult<Vec<Vec<f32>>>
    where
        F: Fn(usize) -> Vec<f32> + Send + Sync,
    {
        let chunks = self.options.progress_chunks.clamp(1, count.max(1));
        let chunk_len = count.div_ceil(chunks).max(1);
        let mut lines = Vec::with_capacity(count);
        let mut done = 0;

        while done < count {
            self.check_abort()?;
            let end = (done + chunk_len).min(count);
            let chunk: Vec<Vec<f32>> = if self.options.parallel {
                let run = || -> Vec<Vec<f32>> { (done..end).into_par_iter().map(&line).collect() };
                match self.pool {
                    Some(pool) => pool.install(run),
                    None => run(),
                }
            } else {
                (done..end).map(&line).collect()
            };
            lines.extend(chunk);
            done = end;
            if done < count {
                self.report_progress(done as f32 / count as f32)?;
            }
        }

        self.check_abort()?;
        Ok(lines)
    }

    /// Build a buffer over the output region, one axis-0 line at a time.
    ///
    /// `sample` receives the output index of each sample.
    pub fn generate_buffer<F>(&self, sample: F) -> PipelineResult<ArrayBuffer>
    where
        F: Fn(&[i64]) -> f32 + Send + Sync,
    {
        let region = self.output_region.clone();
        let lines = self.map_lines(region.line_count(), |l| {
            let mut idx = region.line_start(l);
            let mut out = Vec::with_capacity(region.line_length());
            for _ in 0..region.line_length() {
                out.push(sample(&idx));
                if let Some(first) = idx.first_mut() {
                    *first += 1;
                }
            }
            out
        })?;
        ArrayBuffer::from_lines(region, lines)
    }
}

impl std::fmt::Debug for ExecutionContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("node_id", &self.node_id)
            .field("output", &self.output_name)
            .field("output_region", &self.output_region)
            .field("inputs", &self.inputs.len())
            .finish()
    }
}
