use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use roiflow_core::{Buffer, NdArray, Roi, Value};
use roiflow_graph::{Graph, GraphStats, OperatorHandle};
use roiflow_operators::{OpArrayPiper, OpResize, OpTrackSlotVersion};
use roiflow_request::RequestPool;
use roiflow_scheduler::{Scheduler, SchedulerMetrics};
use serde::Serialize;
use tracing::{debug, info};

/// Source → resize → version tracker.
pub struct DemoPipeline {
    graph: Graph,
    source: OperatorHandle,
    tracker: OperatorHandle,
    progress_events: Arc<Mutex<usize>>,
}

#[derive(Debug, Serialize)]
pub struct TileReport {
    pub roi: String,
    pub checksum: f64,
}

#[derive(Debug, Serialize)]
pub struct DirtyReport {
    pub source_roi: String,
    pub propagated: Vec<String>,
    pub version: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub source_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub elapsed_ms: u128,
    pub tiles: Vec<TileReport>,
    pub total_checksum: f64,
    pub progress_events: usize,
    pub dirty: DirtyReport,
    pub graph: GraphStats,
    pub metrics: SchedulerMetrics,
}

/// Diagonal ramp, brighter towards the bottom right.
pub fn gradient(size: usize) -> Buffer {
    NdArray::<f32>::from_fn(&[size, size], |i| (i[0] + i[1]) as f32).into()
}

/// Cut a `shape` into tiles of at most `tile` along each axis, row-major.
pub fn tiles(shape: &[usize], tile: usize) -> Result<Vec<Roi>> {
    ensure!(tile > 0, "tile size must be positive");
    ensure!(shape.len() == 2, "expected a 2-d output, got {shape:?}");
    let mut out = Vec::new();
    for y in (0..shape[0]).step_by(tile) {
        for x in (0..shape[1]).step_by(tile) {
            let stop = vec![(y + tile).min(shape[0]), (x + tile).min(shape[1])];
            out.push(Roi::new(vec![y, x], stop)?);
        }
    }
    Ok(out)
}

impl DemoPipeline {
    pub fn build(scheduler: &Scheduler, size: usize, scale: usize) -> Result<Self> {
        ensure!(scale > 0, "scale must be positive");
        ensure!(size >= scale, "size {size} is smaller than the scale {scale}");

        let graph = Graph::new(scheduler);
        let resize = OpResize::new().with_parallelism(scheduler.worker_count());
        let progress_events = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&progress_events);
        resize.progress().subscribe(move |percent| {
            debug!(percent, "resize progress");
            *counter.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        });

        let source = graph.add_operator(OpArrayPiper);
        let resize = graph.add_operator(resize);
        let tracker = graph.add_operator(OpTrackSlotVersion);

        source
            .input("Input")?
            .set_value(gradient(size))
            .context("failed to set the source image")?;
        resize.input("Input")?.connect(&source.output("Output")?)?;
        resize
            .input("ResizedShape")?
            .set_value(Value::Shape(vec![size / scale, size / scale]))
            .context("failed to configure the resize")?;
        tracker.input("Input")?.connect(&resize.output("Output")?)?;

        info!(size, scale, "pipeline built");
        Ok(Self {
            graph,
            source,
            tracker,
            progress_events,
        })
    }

    pub fn output_shape(&self) -> Result<Vec<usize>> {
        let meta = self
            .tracker
            .output("Output")?
            .meta()
            .context("pipeline output is not configured")?;
        Ok(meta.shape)
    }

    /// Request every tile concurrently and wait for all of them.
    pub fn pull_tiles(&self, tile: usize) -> Result<Vec<(Roi, Buffer)>> {
        let output = self.tracker.output("Output")?;
        let rois = tiles(&self.output_shape()?, tile)?;
        let pool: RequestPool<Buffer> = rois.iter().map(|roi| output.get(roi.clone())).collect();
        info!(tiles = pool.len(), "pulling tiles");
        let data = pool.wait().context("tile requests failed")?;
        Ok(rois.into_iter().zip(data).collect())
    }

    /// Mark `roi` of the source stale and collect the regions reported on
    /// the pipeline output.
    pub fn dirty_source(&self, roi: Roi) -> Result<DirtyReport> {
        let output = self.tracker.output("Output")?;
        output.take_dirty_regions()?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = output.subscribe_dirty(move |_, roi| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(roi.to_string());
        })?;

        self.source.input("Input")?.set_dirty(roi.clone())?;
        output.unsubscribe(listener)?;

        let propagated = seen.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let version = self
            .tracker
            .output("Version")?
            .value()
            .and_then(|v| v.as_int());
        Ok(DirtyReport {
            source_roi: roi.to_string(),
            propagated,
            version,
        })
    }

    pub fn progress_events(&self) -> usize {
        *self.progress_events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> GraphStats {
        self.graph.stats()
    }
}

/// Build the pipeline, pull it tile by tile, dirty a quarter of the source.
pub fn run(scheduler: &Scheduler, size: usize, scale: usize, tile: usize) -> Result<RunReport> {
    let pipeline = DemoPipeline::build(scheduler, size, scale)?;
    let output_shape = pipeline.output_shape()?;

    let started = Instant::now();
    let pulled = pipeline.pull_tiles(tile)?;
    let elapsed_ms = started.elapsed().as_millis();

    let tiles: Vec<TileReport> = pulled
        .iter()
        .map(|(roi, data)| TileReport {
            roi: roi.to_string(),
            checksum: data.sum(),
        })
        .collect();
    let total_checksum: f64 = tiles.iter().map(|t| t.checksum).sum();

    let quarter = Roi::new(vec![size / 4, size / 4], vec![size / 2, size / 2])?;
    let dirty = pipeline.dirty_source(quarter)?;

    Ok(RunReport {
        generated_at: Utc::now(),
        source_shape: vec![size, size],
        output_shape,
        elapsed_ms,
        tiles,
        total_checksum,
        progress_events: pipeline.progress_events(),
        dirty,
        graph: pipeline.stats(),
        metrics: scheduler.metrics(),
    })
}
