//! Pipeline structure and stage node management.
//!
//! The [`Pipeline`] is an arena that owns every stage node. Each node owns
//! its output [`DataObject`]s; consumers refer to a producer's output through
//! an [`Endpoint`] rather than holding the data object itself, so there is a
//! single owner for every output and no reference cycles.

use crate::core::data::DataObject;
use crate::core::error::{GraphError, GraphResult, NodeId, StrataError, StrataResult};
use crate::core::node::{ProcessObject, StageMetadata};
use crate::core::time::TimeStamp;
use crate::core::types::DataValue;
use crate::execution::engine::ExecutionOptions;
use crate::execution::events::{AbortFlag, Event, EventChannel, EventKind, ListenerId};
use crate::graph::connection::{Connection, Endpoint};
use indexmap::IndexMap;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// An input slot of a stage node.
#[derive(Debug, Clone)]
pub struct InputSlot {
    /// Port name
    pub name: String,
    /// Whether the slot may stay unbound
    pub optional: bool,
    /// Producer output bound to this slot
    pub source: Option<Endpoint>,
}

/// An output slot of a stage node. Owns its data object.
#[derive(Debug)]
pub struct OutputSlot {
    /// Port name
    pub name: String,
    /// The data object this slot produces into
    pub data: DataObject,
}

/// A stage instance in the pipeline.
pub struct StageNode {
    /// Unique identifier
    pub id: NodeId,
    /// Optional display name override
    pub label: Option<String>,
    pub(crate) stage: Box<dyn ProcessObject>,
    pub(crate) metadata: StageMetadata,
    pub(crate) modified: TimeStamp,
    pub(crate) information_time: Mutex<TimeStamp>,
    pub(crate) inputs: Vec<InputSlot>,
    pub(crate) outputs: Vec<OutputSlot>,
    pub(crate) events: EventChannel,
    pub(crate) abort: AbortFlag,
}

impl std::fmt::Debug for StageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageNode")
            .field("id", &self.id)
            .field("stage", &self.metadata.name)
            .field("label", &self.label)
            .field("modified", &self.modified)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl StageNode {
    fn new(stage: Box<dyn ProcessObject>) -> Self {
        let metadata = stage.metadata();
        let inputs = metadata
            .inputs
            .iter()
            .map(|p| InputSlot {
                name: p.name.clone(),
                optional: p.optional,
                source: None,
            })
            .collect();
        let outputs = metadata
            .outputs
            .iter()
            .map(|p| OutputSlot {
                name: p.name.clone(),
                data: DataObject::new(),
            })
            .collect();
        Self {
            id: NodeId::new(),
            label: None,
            stage,
            metadata,
            modified: TimeStamp::tick(),
            information_time: Mutex::new(TimeStamp::ZERO),
            inputs,
            outputs,
            events: EventChannel::new(),
            abort: AbortFlag::new(),
        }
    }

    /// Get the display name (label or stage name).
    pub fn display_name(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.metadata.name.clone())
    }

    /// Metadata of the stage, as of the last configuration.
    pub fn metadata(&self) -> &StageMetadata {
        &self.metadata
    }

    /// The stage implementation.
    pub fn stage(&self) -> &dyn ProcessObject {
        &*self.stage
    }

    /// Time of the last configuration change.
    pub fn modified_time(&self) -> TimeStamp {
        self.modified
    }

    /// Input slots, in port order.
    pub fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    /// Output slots, in port order.
    pub fn outputs(&self) -> &[OutputSlot] {
        &self.outputs
    }

    /// Event channel of this stage.
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Position of the output named `port`.
    pub fn output_index(&self, port: &str) -> GraphResult<usize> {
        self.outputs
            .iter()
            .position(|o| o.name == port)
            .ok_or_else(|| GraphError::PortNotFound {
                node_id: self.id,
                port: port.to_string(),
            })
    }

    /// Position of the input named `port`.
    pub fn input_index(&self, port: &str) -> GraphResult<usize> {
        self.inputs
            .iter()
            .position(|i| i.name == port)
            .ok_or_else(|| GraphError::PortNotFound {
                node_id: self.id,
                port: port.to_string(),
            })
    }

    /// Data object of the output named `port`.
    pub fn data(&self, port: &str) -> GraphResult<&DataObject> {
        let index = self.output_index(port)?;
        Ok(&self.outputs[index].data)
    }

    fn touch(&mut self) {
        self.modified = TimeStamp::tick();
    }

    /// Rebuild the slots after the stage's ports changed.
    ///
    /// Slots whose names survive keep their bindings and data objects.
    /// Returns the names of outputs that went away.
    fn sync_ports(&mut self) -> Vec<String> {
        let metadata = self.stage.metadata();

        let mut old_inputs = std::mem::take(&mut self.inputs);
        self.inputs = metadata
            .inputs
            .iter()
            .map(|p| {
                let source = old_inputs
                    .iter_mut()
                    .find(|slot| slot.name == p.name)
                    .and_then(|slot| slot.source.take());
                InputSlot {
                    name: p.name.clone(),
                    optional: p.optional,
                    source,
                }
            })
            .collect();
        for dropped in old_inputs.iter().filter(|slot| slot.source.is_some()) {
            warn!(
                "Input '{}' of node {} no longer exists; its binding was dropped",
                dropped.name, self.id
            );
        }

        let mut old_outputs: Vec<Option<OutputSlot>> =
            std::mem::take(&mut self.outputs).into_iter().map(Some).collect();
        self.outputs = metadata
            .outputs
            .iter()
            .map(|p| {
                old_outputs
                    .iter_mut()
                    .find(|slot| matches!(slot, Some(s) if s.name == p.name))
                    .and_then(Option::take)
                    .unwrap_or_else(|| OutputSlot {
                        name: p.name.clone(),
                        data: DataObject::new(),
                    })
            })
            .collect();

        self.metadata = metadata;
        old_outputs.into_iter().flatten().map(|slot| slot.name).collect()
    }
}

/// The demand-driven pipeline.
///
/// Uses IndexMap to maintain insertion order for consistent iteration.
/// Structural changes (adding, connecting, configuring stages) take `&mut
/// self`; updates take `&self` and may run from several threads at once.
pub struct Pipeline {
    nodes: IndexMap<NodeId, StageNode>,
    options: ExecutionOptions,
    pub(crate) pool: Option<Arc<rayon::ThreadPool>>,
    /// Optional name for this pipeline.
    pub name: Option<String>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("nodes", &self.nodes.len())
            .field("options", &self.options)
            .finish()
    }
}

impl Pipeline {
    /// Create a new empty pipeline with default options.
    pub fn new() -> Self {
        Self {
            nodes: IndexMap::new(),
            options: ExecutionOptions::default(),
            pool: None,
            name: None,
        }
    }

    /// Create an empty pipeline with the given options.
    ///
    /// A dedicated thread pool is built when `options.max_threads > 0`.
    pub fn with_options(options: ExecutionOptions) -> StrataResult<Self> {
        let mut pipeline = Self::new();
        pipeline.set_options(options)?;
        Ok(pipeline)
    }

    /// Set the name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Current execution options.
    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Replace the execution options.
    pub fn set_options(&mut self, options: ExecutionOptions) -> StrataResult<()> {
        self.pool = if options.max_threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(options.max_threads)
                .build()
                .map_err(|e| StrataError::Other(format!("Failed to build thread pool: {}", e)))?;
            Some(Arc::new(pool))
        } else {
            None
        };
        self.options = options;
        Ok(())
    }

    // ========================================================================
    // Node Management
    // ========================================================================

    /// Add a stage and return its node ID.
    pub fn add_stage(&mut self, stage: impl ProcessObject) -> NodeId {
        self.add_boxed(Box::new(stage))
    }

    /// Add an already boxed stage.
    pub fn add_boxed(&mut self, stage: Box<dyn ProcessObject>) -> NodeId {
        let node = StageNode::new(stage);
        let id = node.id;
        debug!("Added stage '{}' as node {}", node.metadata.name, id);
        self.nodes.insert(id, node);
        id
    }

    /// Set the display label of a node.
    pub fn set_label(&mut self, id: NodeId, label: impl Into<String>) -> GraphResult<()> {
        self.node_mut(id)?.label = Some(label.into());
        Ok(())
    }

    /// Remove a node from the pipeline.
    ///
    /// Consumers bound to any of its outputs become unbound and are marked
    /// modified.
    pub fn remove_stage(&mut self, id: NodeId) -> GraphResult<Box<dyn ProcessObject>> {
        let node = self
            .nodes
            .shift_remove(&id)
            .ok_or(GraphError::NodeNotFound(id))?;
        self.unbind_consumers(|endpoint| endpoint.node_id == id);
        Ok(node.stage)
    }

    /// Get a reference to a node.
    pub fn node(&self, id: NodeId) -> GraphResult<&StageNode> {
        self.nodes.get(&id).ok_or(GraphError::NodeNotFound(id))
    }

    fn node_mut(&mut self, id: NodeId) -> GraphResult<&mut StageNode> {
        self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))
    }

    /// Check if a node exists.
    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Get all nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &StageNode> {
        self.nodes.values()
    }

    /// Get all node IDs.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Get the number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the pipeline is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ========================================================================
    // Stage Access
    // ========================================================================

    /// Typed read access to a stage.
    pub fn stage<T: ProcessObject>(&self, id: NodeId) -> GraphResult<&T> {
        let node = self.node(id)?;
        (*node.stage)
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| GraphError::StageTypeMismatch {
                node_id: id,
                expected: std::any::type_name::<T>().to_string(),
            })
    }

    /// Change a stage's configuration.
    ///
    /// The stage is marked modified, its ports are re-read from its metadata
    /// and consumers bound to outputs that no longer exist are unbound.
    pub fn configure<T, R, F>(&mut self, id: NodeId, f: F) -> GraphResult<R>
    where
        T: ProcessObject,
        F: FnOnce(&mut T) -> R,
    {
        let node = self.node_mut(id)?;
        let stage = (*node.stage)
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| GraphError::StageTypeMismatch {
                node_id: id,
                expected: std::any::type_name::<T>().to_string(),
            })?;
        let result = f(stage);
        node.touch();
        let removed = node.sync_ports();

        if !removed.is_empty() {
            self.unbind_consumers(|endpoint| {
                endpoint.node_id == id && removed.iter().any(|name| *name == endpoint.port)
            });
        }
        Ok(result)
    }

    /// Mark a stage modified so the next update re-executes it.
    pub fn mark_modified(&mut self, id: NodeId) -> GraphResult<()> {
        self.node_mut(id)?.touch();
        Ok(())
    }

    /// Data object behind an output.
    pub fn data(&self, id: NodeId, port: &str) -> GraphResult<&DataObject> {
        self.node(id)?.data(port)
    }

    /// Last published value of an output, without updating.
    pub fn output(&self, id: NodeId, port: &str) -> GraphResult<Option<Arc<DataValue>>> {
        Ok(self.data(id, port)?.value())
    }

    // ========================================================================
    // Connection Management
    // ========================================================================

    /// Bind `to_node.to_port` to the output `from_node.from_port`.
    pub fn connect(
        &mut self,
        from_node: NodeId,
        from_port: impl Into<String>,
        to_node: NodeId,
        to_port: impl Into<String>,
    ) -> GraphResult<()> {
        let from_port = from_port.into();
        let to_port = to_port.into();

        self.node(from_node)?.output_index(&from_port)?;
        let consumer = self.node(to_node)?;
        let input = consumer.input_index(&to_port)?;

        if consumer.inputs[input].source.is_some() {
            return Err(GraphError::PortAlreadyConnected {
                node_id: to_node,
                port: to_port,
            });
        }

        // If from_node is reachable from to_node, this edge closes a cycle
        if self.is_reachable(to_node, from_node) {
            return Err(GraphError::CycleDetected {
                nodes: vec![from_node, to_node],
            });
        }

        let node = self.node_mut(to_node)?;
        node.inputs[input].source = Some(Endpoint::new(from_node, from_port));
        node.touch();
        Ok(())
    }

    /// Unbind an input. Returns the endpoint it was bound to.
    pub fn disconnect_input(&mut self, id: NodeId, port: &str) -> GraphResult<Option<Endpoint>> {
        let node = self.node_mut(id)?;
        let input = node.input_index(port)?;
        let previous = node.inputs[input].source.take();
        if previous.is_some() {
            node.touch();
        }
        Ok(previous)
    }

    /// The producer bound to an input.
    pub fn input_source(&self, id: NodeId, port: &str) -> GraphResult<Option<&Endpoint>> {
        let node = self.node(id)?;
        let input = node.input_index(port)?;
        Ok(node.inputs[input].source.as_ref())
    }

    /// All bindings, in node insertion order.
    pub fn connections(&self) -> Vec<Connection> {
        self.nodes
            .values()
            .flat_map(|node| {
                node.inputs.iter().filter_map(move |slot| {
                    slot.source
                        .clone()
                        .map(|from| Connection::new(from, Endpoint::new(node.id, slot.name.clone())))
                })
            })
            .collect()
    }

    fn unbind_consumers(&mut self, predicate: impl Fn(&Endpoint) -> bool) {
        for node in self.nodes.values_mut() {
            let mut changed = false;
            for slot in &mut node.inputs {
                if slot.source.as_ref().is_some_and(&predicate) {
                    warn!(
                        "Input '{}' of node {} lost its producer and was unbound",
                        slot.name, node.id
                    );
                    slot.source = None;
                    changed = true;
                }
            }
            if changed {
                node.touch();
            }
        }
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Register a listener on a stage's event channel.
    pub fn add_observer<F>(&self, id: NodeId, kind: EventKind, listener: F) -> GraphResult<ListenerId>
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Ok(self.node(id)?.events.add_listener(kind, listener))
    }

    /// Remove a listener from a stage's event channel.
    pub fn remove_observer(&self, id: NodeId, listener: ListenerId) -> GraphResult<bool> {
        Ok(self.node(id)?.events.remove_listener(listener))
    }

    /// Handle to raise a stage's abort flag from elsewhere.
    pub fn abort_handle(&self, id: NodeId) -> GraphResult<AbortFlag> {
        Ok(self.node(id)?.abort.clone())
    }

    // ========================================================================
    // Graph Analysis
    // ========================================================================

    /// Check if `target` is reachable from `start` following bindings downstream.
    pub fn is_reachable(&self, start: NodeId, target: NodeId) -> bool {
        if start == target {
            return true;
        }

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            if current == target {
                return true;
            }
            if visited.insert(current) {
                queue.extend(self.consumers_of(current));
            }
        }

        false
    }

    /// Nodes with an input bound to any output of `id`.
    pub fn consumers_of(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| {
                node.inputs
                    .iter()
                    .any(|slot| slot.source.as_ref().is_some_and(|s| s.node_id == id))
            })
            .map(|node| node.id)
            .collect()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
