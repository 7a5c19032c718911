use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::oneshot;
use roiflow_core::{Buffer, ConfigurationError, NdArray, Roi, Value};
use roiflow_graph::{
    ComputeContext, ConfigureContext, DirtyContext, Graph, GraphError, InputSpec, Operator, OperatorHandle,
    OutputSpec,
};
use roiflow_operators::OpResize;
use roiflow_request::RequestError;
use roiflow_scheduler::Scheduler;

fn roi(start: &[usize], stop: &[usize]) -> Roi {
    Roi::new(start.to_vec(), stop.to_vec()).unwrap()
}

/// Row-index image: every element holds its row number.
fn rows(shape: &[usize]) -> Buffer {
    NdArray::<f32>::from_fn(shape, |i| i[0] as f32).into()
}

/// Pass-through that records every region it is asked for.
#[derive(Default)]
struct Recorder {
    asked: Arc<Mutex<Vec<Roi>>>,
}

#[async_trait]
impl Operator for Recorder {
    fn name(&self) -> &str {
        "Recorder"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![InputSpec::array("Input")]
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::array("Output")]
    }

    fn configure(&self, cx: &mut ConfigureContext) -> Result<(), ConfigurationError> {
        let meta = cx.input_meta(0)?.clone();
        cx.set_output_meta(0, meta);
        Ok(())
    }

    async fn compute(
        &self,
        cx: &ComputeContext,
        _output: usize,
        roi: &Roi,
        dest: &mut Buffer,
    ) -> Result<(), RequestError> {
        self.asked.lock().unwrap().push(roi.clone());
        *dest = cx.request_input(0, roi.clone()).await?;
        Ok(())
    }

    fn notify_dirty(&self, cx: &mut DirtyContext, _input: usize, roi: &Roi) {
        cx.set_output_dirty(0, roi.clone());
    }
}

struct Pipeline {
    scheduler: Scheduler,
    source: OperatorHandle,
    resize: OperatorHandle,
    asked: Arc<Mutex<Vec<Roi>>>,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

fn pipeline(data: Buffer, resized: &[usize], resize: OpResize) -> (Pipeline, Result<(), GraphError>) {
    let scheduler = Scheduler::with_workers(4).unwrap();
    let graph = Graph::new(&scheduler);
    let asked = Arc::new(Mutex::new(Vec::new()));
    let source = graph.add_operator(Recorder {
        asked: Arc::clone(&asked),
    });
    let resize = graph.add_operator(resize);
    source.input("Input").unwrap().set_value(data).unwrap();
    resize
        .input("Input")
        .unwrap()
        .connect(&source.output("Output").unwrap())
        .unwrap();
    let configured = resize
        .input("ResizedShape")
        .unwrap()
        .set_value(Value::Shape(resized.to_vec()));
    (
        Pipeline {
            scheduler,
            source,
            resize,
            asked,
        },
        configured,
    )
}

#[test]
fn downscale_requests_the_minimal_input_region() {
    let (p, configured) = pipeline(rows(&[128, 128]), &[64, 64], OpResize::new().with_parallelism(1));
    configured.unwrap();
    let out = p.resize.output("Output").unwrap();
    assert_eq!(out.meta().unwrap().shape, vec![64, 64]);

    let data = out.get(roi(&[0, 0], &[32, 32])).wait().unwrap();
    assert_eq!(data.shape(), &[32, 32]);
    assert_eq!(*p.asked.lock().unwrap(), vec![roi(&[0, 0], &[64, 64])]);

    // Rows 2y and 2y+1 average to 2y + 0.5.
    assert_eq!(data.get_f64(&[0, 0]), Some(0.5));
    assert_eq!(data.get_f64(&[31, 17]), Some(62.5));
}

#[test]
fn parts_split_the_input_along_the_leading_axis() {
    let (p, configured) = pipeline(rows(&[128, 128]), &[64, 64], OpResize::new().with_parallelism(4));
    configured.unwrap();
    let out = p.resize.output("Output").unwrap();
    let data = out.get(roi(&[0, 0], &[32, 32])).wait().unwrap();
    assert_eq!(data.get_f64(&[9, 3]), Some(18.5));

    let mut asked = p.asked.lock().unwrap().clone();
    asked.sort_by_key(|r| r.start()[0]);
    assert_eq!(
        asked,
        vec![
            roi(&[0, 0], &[16, 64]),
            roi(&[16, 0], &[32, 64]),
            roi(&[32, 0], &[48, 64]),
            roi(&[48, 0], &[64, 64]),
        ]
    );
}

#[test]
fn dirty_rows_map_through_the_downscale() {
    let (p, configured) = pipeline(rows(&[128, 128]), &[64, 64], OpResize::new());
    configured.unwrap();
    let out = p.resize.output("Output").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    out.subscribe_dirty(move |_, roi| sink.lock().unwrap().push(roi.clone()))
        .unwrap();

    let input = p.source.input("Input").unwrap();
    input.set_dirty(roi(&[10, 0], &[20, 128])).unwrap();
    input.set_dirty(roi(&[10, 5], &[20, 21])).unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![roi(&[5, 0], &[10, 64]), roi(&[5, 2], &[10, 11])]
    );
}

#[test]
fn dirty_region_of_the_wrong_rank_is_refused() {
    let (p, configured) = pipeline(rows(&[16, 16]), &[8, 8], OpResize::new());
    configured.unwrap();
    let out = p.resize.output("Output").unwrap();
    out.take_dirty_regions().unwrap();

    let result = p
        .resize
        .input("Input")
        .unwrap()
        .set_dirty(roi(&[0, 0, 0], &[1, 1, 1]));
    assert!(matches!(result, Err(GraphError::InvalidRoi { .. })));
    assert!(out.dirty_regions().is_empty());
}

#[test]
fn new_target_shape_dirties_everything() {
    let (p, configured) = pipeline(rows(&[16, 16]), &[8, 8], OpResize::new());
    configured.unwrap();
    let out = p.resize.output("Output").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    out.subscribe_dirty(move |_, roi| sink.lock().unwrap().push(roi.clone()))
        .unwrap();

    p.resize
        .input("ResizedShape")
        .unwrap()
        .set_value(Value::Shape(vec![4, 4]))
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![roi(&[0, 0], &[4, 4])]);
}

#[test]
fn matching_shapes_take_the_fast_path() {
    let data: Buffer = NdArray::<f32>::from_fn(&[32, 32], |i| ((i[0] * 7919 + i[1] * 104_729) % 1000) as f32 / 1000.0).into();
    let (p, configured) = pipeline(data.clone(), &[32, 32], OpResize::new());
    configured.unwrap();
    let out = p.resize.output("Output").unwrap();
    let region = roi(&[3, 4], &[20, 30]);
    let resized = out.get(region.clone()).wait().unwrap();
    assert_eq!(resized, data.region(&region).unwrap());
    assert_eq!(*p.asked.lock().unwrap(), vec![region]);
}

#[test]
fn integer_data_is_rounded() {
    let data: Buffer = NdArray::<u8>::from_fn(&[4, 4], |i| (i[0] * 4 + i[1]) as u8).into();
    let (p, configured) = pipeline(data, &[2, 2], OpResize::new());
    configured.unwrap();
    let out = p.resize.output("Output").unwrap();
    let resized = out.get(roi(&[0, 0], &[2, 2])).wait().unwrap();
    // Means 2.5, 4.5, 10.5, 12.5 round away from zero.
    assert_eq!(
        resized,
        Buffer::from(NdArray::<u8>::from_vec(&[2, 2], vec![3, 5, 11, 13]).unwrap())
    );
}

#[test]
fn channel_and_time_axes_cannot_be_resized() {
    let (p, configured) = pipeline(rows(&[8, 8, 3]), &[4, 4, 2], OpResize::new());
    assert!(matches!(
        configured,
        Err(GraphError::Configuration {
            source: ConfigurationError::UnsupportedResize { axis: 'c', .. },
            ..
        })
    ));
    assert!(!p.resize.output("Output").unwrap().is_ready());

    // Fixing the shape recovers.
    p.resize
        .input("ResizedShape")
        .unwrap()
        .set_value(Value::Shape(vec![4, 4, 3]))
        .unwrap();
    assert!(p.resize.output("Output").unwrap().is_ready());

    let (_p, configured) = pipeline(rows(&[2, 4, 8, 8, 1]), &[1, 4, 8, 8, 1], OpResize::new());
    assert!(matches!(
        configured,
        Err(GraphError::Configuration {
            source: ConfigurationError::UnsupportedResize { axis: 't', .. },
            ..
        })
    ));
}

#[test]
fn target_rank_must_match() {
    let (_p, configured) = pipeline(rows(&[8, 8]), &[4], OpResize::new());
    assert!(matches!(
        configured,
        Err(GraphError::Configuration {
            source: ConfigurationError::RankMismatch { expected: 2, actual: 1, .. },
            ..
        })
    ));
}

#[test]
fn progress_runs_from_zero_to_one_hundred() {
    let resize = OpResize::new().with_parallelism(4);
    let progress = resize.progress();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    progress.subscribe(move |p| sink.lock().unwrap().push(p));

    let (p, configured) = pipeline(rows(&[64, 64]), &[32, 32], resize);
    configured.unwrap();
    p.resize
        .output("Output")
        .unwrap()
        .get(roi(&[0, 0], &[32, 32]))
        .wait()
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 5);
    assert_eq!(seen.first(), Some(&0));
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.iter().all(|&p| p <= 100));
}

/// Source that holds its compute until released.
struct Gate {
    started: Mutex<mpsc::Sender<()>>,
    release: Mutex<Option<oneshot::Receiver<()>>>,
}

#[async_trait]
impl Operator for Gate {
    fn name(&self) -> &str {
        "Gate"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![InputSpec::array("Input")]
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::array("Output")]
    }

    fn configure(&self, cx: &mut ConfigureContext) -> Result<(), ConfigurationError> {
        let meta = cx.input_meta(0)?.clone();
        cx.set_output_meta(0, meta);
        Ok(())
    }

    async fn compute(
        &self,
        cx: &ComputeContext,
        _output: usize,
        roi: &Roi,
        dest: &mut Buffer,
    ) -> Result<(), RequestError> {
        let release = self.release.lock().unwrap().take();
        let _ = self.started.lock().unwrap().send(());
        if let Some(release) = release {
            let _ = release.await;
        }
        *dest = cx.request_input(0, roi.clone()).await?;
        Ok(())
    }
}

#[test]
fn cancelled_resize_never_commits_results() {
    let scheduler = Scheduler::with_workers(2).unwrap();
    let graph = Graph::new(&scheduler);
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = oneshot::channel();
    let gate = graph.add_operator(Gate {
        started: Mutex::new(started_tx),
        release: Mutex::new(Some(release_rx)),
    });
    gate.input("Input").unwrap().set_value(rows(&[16, 16])).unwrap();
    let resize = graph.add_operator(OpResize::new().with_parallelism(1));
    resize
        .input("Input")
        .unwrap()
        .connect(&gate.output("Output").unwrap())
        .unwrap();
    resize
        .input("ResizedShape")
        .unwrap()
        .set_value(Value::Shape(vec![8, 8]))
        .unwrap();

    let request = resize.output("Output").unwrap().get(roi(&[0, 0], &[8, 8]));
    request.submit().unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    request.cancel();
    let _ = release_tx.send(());
    assert_eq!(request.wait(), Err(RequestError::Cancelled));
    scheduler.stop();
}
