//! Pipeline snapshots for inspection and logging.
//!
//! A snapshot records the structure of a pipeline together with the state of
//! every output data object: its information, regions and timestamps. Stages
//! themselves hold closures and buffers, so snapshots describe a pipeline
//! but cannot rebuild one.

use crate::core::error::NodeId;
use crate::core::node::StageKind;
use crate::core::region::Region;
use crate::core::time::TimeStamp;
use crate::core::types::ImageInformation;
use crate::execution::engine::ExecutionOptions;
use crate::graph::connection::{Connection, Endpoint};
use crate::graph::structure::{OutputSlot, Pipeline};
use serde::{Deserialize, Serialize};

/// State of one output data object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSnapshot {
    /// Port name
    pub name: String,
    /// Output information, once propagated
    pub information: Option<ImageInformation>,
    /// Region last asked for
    pub requested_region: Option<Region>,
    /// Region currently materialized
    pub buffered_region: Option<Region>,
    /// Last external modification
    pub modified_time: TimeStamp,
    /// Upstream time of the last successful execution
    pub pipeline_modified_time: TimeStamp,
}

impl From<&OutputSlot> for OutputSnapshot {
    fn from(slot: &OutputSlot) -> Self {
        Self {
            name: slot.name.clone(),
            information: slot.data.information(),
            requested_region: slot.data.requested_region(),
            buffered_region: slot.data.buffered_region(),
            modified_time: slot.data.modified_time(),
            pipeline_modified_time: slot.data.pipeline_modified_time(),
        }
    }
}

/// One input slot and its binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSnapshot {
    /// Port name
    pub name: String,
    /// Whether the slot may stay unbound
    pub optional: bool,
    /// Bound producer output
    pub source: Option<Endpoint>,
}

/// One stage node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    /// Node ID
    pub id: NodeId,
    /// Stage type identifier
    pub stage_id: String,
    /// Stage display name
    pub name: String,
    /// Capability set
    pub kind: StageKind,
    /// Optional label
    pub label: Option<String>,
    /// Stage modification time
    pub modified_time: TimeStamp,
    /// Inputs, in order
    pub inputs: Vec<InputSnapshot>,
    /// Outputs, in order
    pub outputs: Vec<OutputSnapshot>,
}

/// Serializable description of a whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    /// Snapshot format version
    pub version: String,
    /// Pipeline name
    pub name: Option<String>,
    /// Execution options in effect
    pub options: ExecutionOptions,
    /// Stages, in insertion order
    pub stages: Vec<StageSnapshot>,
    /// All bindings
    pub connections: Vec<Connection>,
}

impl PipelineSnapshot {
    /// Current format version.
    pub const VERSION: &'static str = "1.0.0";

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Find a stage by ID.
    pub fn stage(&self, id: NodeId) -> Option<&StageSnapshot> {
        self.stages.iter().find(|s| s.id == id)
    }
}

impl Pipeline {
    /// Capture the current structure and data object state.
    pub fn snapshot(&self) -> PipelineSnapshot {
        let stages = self
            .nodes()
            .map(|node| {
                let metadata = node.metadata();
                StageSnapshot {
                    id: node.id,
                    stage_id: metadata.id.clone(),
                    name: metadata.name.clone(),
                    kind: metadata.kind,
                    label: node.label.clone(),
                    modified_time: node.modified_time(),
                    inputs: node
                        .inputs()
                        .iter()
                        .map(|slot| InputSnapshot {
                            name: slot.name.clone(),
                            optional: slot.optional,
                            source: slot.source.clone(),
                        })
                        .collect(),
                    outputs: node.outputs().iter().map(OutputSnapshot::from).collect(),
                }
            })
            .collect();

        PipelineSnapshot {
            version: PipelineSnapshot::VERSION.to_string(),
            name: self.name.clone(),
            options: self.options().clone(),
            stages,
            connections: self.connections(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ArrayBuffer;
    use crate::filters::builtin::{ArraySource, PointwiseStage};

    #[test]
    fn test_snapshot_round_trip() {
        let mut pipeline = Pipeline::new().with_name("snapshot");
        let src = pipeline.add_stage(ArraySource::new(
            ArrayBuffer::new(Region::from_size([4, 2]), 1.0).unwrap(),
        ));
        let id = pipeline.add_stage(PointwiseStage::identity());
        pipeline.connect(src, "output", id, "input").unwrap();
        pipeline.set_label(id, "copy").unwrap();
        pipeline
            .update_region(id, "output", Region::new([1, 0], [2, 2]))
            .unwrap();

        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.stages.len(), 2);
        assert_eq!(snapshot.connections.len(), 1);

        let stage = snapshot.stage(id).unwrap();
        assert_eq!(stage.stage_id, "pointwise");
        assert_eq!(stage.label.as_deref(), Some("copy"));
        assert_eq!(stage.inputs[0].source, Some(Endpoint::new(src, "output")));
        assert_eq!(
            stage.outputs[0].buffered_region,
            Some(Region::new([1, 0], [2, 2]))
        );

        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"snapshot\""));
        let restored = PipelineSnapshot::from_json(&json).unwrap();
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn test_snapshot_before_update() {
        let mut pipeline = Pipeline::new();
        let id = pipeline.add_stage(PointwiseStage::identity());
        let snapshot = pipeline.snapshot();
        let stage = snapshot.stage(id).unwrap();
        assert_eq!(stage.inputs[0].source, None);
        assert_eq!(stage.outputs[0].information, None);
        assert_eq!(stage.outputs[0].pipeline_modified_time, TimeStamp::ZERO);
    }
}
