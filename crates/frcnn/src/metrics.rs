//! Named scalar metrics produced by the detector and the sinks that export
//! them. The network only returns values; sinks decide where they go.

use burn::tensor::{backend::Backend, Tensor};
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricTag {
    Rpn,
    Rcnn,
    Losses,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub tag: MetricTag,
    pub name: String,
    pub value: f32,
}

impl Metric {
    pub fn new(tag: MetricTag, name: impl Into<String>, value: f32) -> Self {
        Self {
            tag,
            name: name.into(),
            value,
        }
    }
}

pub trait MetricsSink {
    fn record(&mut self, metrics: &[Metric]) -> std::io::Result<()>;
}

/// Emits each metric as a `tracing` event at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&mut self, metrics: &[Metric]) -> std::io::Result<()> {
        for m in metrics {
            tracing::info!(tag = ?m.tag, name = %m.name, value = m.value, "metric");
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonlRow<'a> {
    step: u64,
    #[serde(flatten)]
    metric: &'a Metric,
}

/// One JSON object per metric per line; `step` advances on every `record`.
pub struct JsonlSink<W: Write> {
    writer: W,
    step: u64,
}

impl<W: Write> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, step: 0 }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> MetricsSink for JsonlSink<W> {
    fn record(&mut self, metrics: &[Metric]) -> std::io::Result<()> {
        for metric in metrics {
            let row = JsonlRow {
                step: self.step,
                metric,
            };
            serde_json::to_writer(&mut self.writer, &row)?;
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()?;
        self.step += 1;
        Ok(())
    }
}

/// Mean, standard deviation, min and max of a tensor, named `<prefix>/<stat>`.
pub fn tensor_stats<B: Backend, const D: usize>(
    tag: MetricTag,
    prefix: &str,
    tensor: &Tensor<B, D>,
) -> Vec<Metric> {
    let values = tensor
        .clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default();
    if values.is_empty() {
        return Vec::new();
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    vec![
        Metric::new(tag, format!("{prefix}/mean"), mean),
        Metric::new(tag, format!("{prefix}/stddev"), var.sqrt()),
        Metric::new(tag, format!("{prefix}/min"), min),
        Metric::new(tag, format!("{prefix}/max"), max),
    ]
}
