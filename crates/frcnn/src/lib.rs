#![recursion_limit = "256"]

//! Faster R-CNN: anchor generation, stage orchestration and weighted
//! multi-task loss on top of the `models` sub-networks.

pub mod anchors;
pub mod cli;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod network;
pub mod prediction;

pub use anchors::{expand_grid, generate_reference_anchors, AnchorGenerator};
pub use error::{AnchorError, FrcnnError, Result};
pub use loss::{LossAggregator, LossReport, LossWeights};
pub use metrics::{JsonlSink, Metric, MetricTag, MetricsSink, TracingSink};
pub use network::FasterRcnn;
pub use prediction::{DebugOutputs, PredictionBundle};

/// Backend alias for the binaries (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type FrcnnBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type FrcnnBackend = burn_ndarray::NdArray<f32>;

pub mod prelude {
    pub use crate::{
        AnchorGenerator, FasterRcnn, FrcnnBackend, LossAggregator, LossWeights, Metric,
        MetricTag, MetricsSink, PredictionBundle,
    };
    pub use data_contracts::{BackboneKind, FasterRcnnConfig, GroundTruthBox};
}
