use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use roiflow_core::{Buffer, ConfigurationError, NdArray, Roi, Value};
use roiflow_graph::{
    ComputeContext, ConfigureContext, DirtyContext, Graph, GraphError, InputSpec, Operator, OperatorHandle,
    OutputSpec,
};
use roiflow_request::RequestError;
use roiflow_scheduler::Scheduler;

fn roi(start: &[usize], stop: &[usize]) -> Roi {
    Roi::new(start.to_vec(), stop.to_vec()).unwrap()
}

fn ramp(shape: &[usize]) -> Buffer {
    NdArray::<f64>::from_fn(shape, |i| (i[0] * 10 + i[1]) as f64).into()
}

/// Forwards its input region by region and records what it was asked for.
#[derive(Default)]
struct Pipe {
    asked: Arc<Mutex<Vec<Roi>>>,
}

#[async_trait]
impl Operator for Pipe {
    fn name(&self) -> &str {
        "Pipe"
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

/// Multiplies by a non-negative factor.
struct Scale;

#[async_trait]
impl Operator for Scale {
    fn name(&self) -> &str {
        "Scale"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![
            InputSpec::array("Input"),
            InputSpec::value("Factor").with_default(1.0),
        ]
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::array("Output")]
    }

    fn configure(&self, cx: &mut ConfigureContext) -> Result<(), ConfigurationError> {
        let factor = cx.require_value(1)?.as_float().unwrap_or(f64::NAN);
        if factor.is_nan() || factor < 0.0 {
            return Err(ConfigurationError::InvalidValue {
                operator: "Scale".into(),
                slot: "Factor".into(),
                reason: format!("{factor} is negative"),
            });
        }
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
        let factor = cx.input_value(1).and_then(Value::as_float).unwrap_or(1.0);
        let mut data = cx.request_input(0, roi.clone()).await?;
        if let Some(a) = data.typed_mut::<f64>() {
            a.as_mut_slice().iter_mut().for_each(|v| *v *= factor);
        }
        *dest = data;
        Ok(())
    }
}

struct Fixture {
    scheduler: Scheduler,
    graph: Graph,
    first: OperatorHandle,
    second: OperatorHandle,
    first_asked: Arc<Mutex<Vec<Roi>>>,
    second_asked: Arc<Mutex<Vec<Roi>>>,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

fn chain() -> Fixture {
    let scheduler = Scheduler::with_workers(2).unwrap();
    let graph = Graph::new(&scheduler);
    let first_asked = Arc::default();
    let second_asked = Arc::default();
    let first = graph.add_operator(Pipe {
        asked: Arc::clone(&first_asked),
    });
    let second = graph.add_operator(Pipe {
        asked: Arc::clone(&second_asked),
    });
    second
        .input("Input")
        .unwrap()
        .connect(&first.output("Output").unwrap())
        .unwrap();
    first.input("Input").unwrap().set_value(ramp(&[8, 6])).unwrap();
    Fixture {
        scheduler,
        graph,
        first,
        second,
        first_asked,
        second_asked,
    }
}

#[test]
fn unconfigured_output_is_not_ready() {
    let scheduler = Scheduler::with_workers(1).unwrap();
    let graph = Graph::new(&scheduler);
    let pipe = graph.add_operator(Pipe::default());
    let out = pipe.output("Output").unwrap();

    assert!(!out.is_ready());
    assert!(!pipe.is_configured());
    assert!(pipe.configuration_error().is_none());
    assert!(matches!(out.get(roi(&[0], &[1])).wait(), Err(RequestError::NotReady(_))));
    scheduler.stop();
}

#[test]
fn requests_pull_only_the_requested_region() {
    let fx = chain();
    let out = fx.second.output("Output").unwrap();
    assert_eq!(out.meta().unwrap().shape, vec![8, 6]);

    let region = roi(&[2, 1], &[4, 3]);
    let data = out.get(region.clone()).wait().unwrap();
    assert_eq!(data.shape(), &[2, 2]);
    assert_eq!(data.get_f64(&[0, 0]), Some(21.0));
    assert_eq!(data.get_f64(&[1, 1]), Some(32.0));

    assert_eq!(*fx.second_asked.lock().unwrap(), vec![region.clone()]);
    assert_eq!(*fx.first_asked.lock().unwrap(), vec![region]);
}

#[test]
fn out_of_bounds_request_is_rejected() {
    let fx = chain();
    let out = fx.second.output("Output").unwrap();
    let err = out.get(roi(&[0, 0], &[9, 6])).wait().unwrap_err();
    assert!(matches!(err, RequestError::InvalidRoi(_)));
    assert!(fx.second_asked.lock().unwrap().is_empty());
}

#[test]
fn value_held_input_is_served_directly() {
    let fx = chain();
    let data = fx.first.input("Input").unwrap().get(roi(&[7, 5], &[8, 6])).wait().unwrap();
    assert_eq!(data.get_f64(&[0, 0]), Some(75.0));
    assert!(fx.first_asked.lock().unwrap().is_empty());
}

#[test]
fn get_into_copies_only_on_success() {
    let fx = chain();
    let out = fx.second.output("Output").unwrap();

    let mut wrong = Buffer::zeros(roiflow_core::DType::F64, &[3, 3]);
    assert!(out.get_into(roi(&[0, 0], &[2, 2]), &mut wrong).is_err());

    let mut dest = Buffer::zeros(roiflow_core::DType::F64, &[2, 2]);
    fx.first.remove().unwrap();
    assert!(out.get_into(roi(&[0, 0], &[2, 2]), &mut dest).is_err());
    assert_eq!(dest.sum(), 0.0);
}

#[test]
fn connection_errors() {
    let fx = chain();
    let first_out = fx.first.output("Output").unwrap();
    let second_in = fx.second.input("Input").unwrap();
    let second_out = fx.second.output("Output").unwrap();

    // Reconnecting to the same output is a no-op.
    second_in.connect(&first_out).unwrap();

    let third = fx.graph.add_operator(Pipe::default());
    let err = second_in.connect(&third.output("Output").unwrap()).unwrap_err();
    assert!(matches!(err, GraphError::AlreadyConnected(_)));

    let err = fx.first.input("Input").unwrap().connect(&second_out).unwrap_err();
    assert!(matches!(err, GraphError::Cycle { .. }));

    let err = third.input("Input").unwrap().connect(&third.output("Output").unwrap()).unwrap_err();
    assert!(matches!(err, GraphError::Cycle { .. }));

    let scale = fx.graph.add_operator(Scale);
    let err = scale.input("Factor").unwrap().connect(&second_out).unwrap_err();
    assert!(matches!(err, GraphError::Incompatible { .. }));

    assert!(matches!(
        fx.first.input("Nope"),
        Err(GraphError::UnknownSlot { .. })
    ));
}

#[test]
fn configuration_errors_surface_and_recover() {
    let fx = chain();
    let scale = fx.graph.add_operator(Scale);
    scale
        .input("Input")
        .unwrap()
        .connect(&fx.second.output("Output").unwrap())
        .unwrap();
    let out = scale.output("Output").unwrap();
    assert!(out.is_ready());

    let err = scale.input("Factor").unwrap().set_value(-1.0).unwrap_err();
    assert!(matches!(
        err,
        GraphError::Configuration {
            source: ConfigurationError::InvalidValue { .. },
            ..
        }
    ));
    assert!(!out.is_ready());
    assert!(matches!(
        scale.configuration_error(),
        Some(ConfigurationError::InvalidValue { .. })
    ));

    scale.input("Factor").unwrap().set_value(2.0).unwrap();
    assert!(scale.configuration_error().is_none());
    let data = out.get(roi(&[1, 1], &[2, 2])).wait().unwrap();
    assert_eq!(data.get_f64(&[0, 0]), Some(22.0));
}

#[test]
fn dirty_regions_flow_downstream() {
    let fx = chain();
    let out = fx.second.output("Output").unwrap();
    // Setting the source array left everything dirty in full.
    assert_eq!(out.take_dirty_regions().unwrap(), vec![roi(&[0, 0], &[8, 6])]);
    fx.first.output("Output").unwrap().take_dirty_regions().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    out.subscribe_dirty(move |_, roi| sink.lock().unwrap().push(roi.clone()))
        .unwrap();

    let stale = roi(&[1, 0], &[3, 2]);
    fx.first.input("Input").unwrap().set_dirty(stale.clone()).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![stale.clone()]);
    assert_eq!(out.dirty_regions(), vec![stale.clone()]);
    assert_eq!(fx.first.output("Output").unwrap().dirty_regions(), vec![stale]);

    // A new array replaces everything.
    let mut changed = ramp(&[8, 6]);
    changed.typed_mut::<f64>().unwrap().set(&[0, 0], -1.0);
    fx.first.input("Input").unwrap().set_value(changed).unwrap();
    assert_eq!(seen.lock().unwrap().last(), Some(&roi(&[0, 0], &[8, 6])));
    assert_eq!(out.take_dirty_regions().unwrap(), vec![roi(&[0, 0], &[8, 6])]);
    assert!(out.dirty_regions().is_empty());
}

#[test]
fn dirty_regions_outside_the_data_are_rejected() {
    let fx = chain();
    let input = fx.first.input("Input").unwrap();
    let out = fx.second.output("Output").unwrap();
    out.take_dirty_regions().unwrap();

    let wrong_rank = Roi::new(vec![0, 0, 0], vec![1, 1, 1]).unwrap();
    assert!(matches!(input.set_dirty(wrong_rank), Err(GraphError::InvalidRoi { .. })));
    let too_far = roi(&[4, 0], &[9, 6]);
    assert!(matches!(input.set_dirty(too_far.clone()), Err(GraphError::InvalidRoi { .. })));
    assert!(matches!(
        fx.first.output("Output").unwrap().set_dirty(too_far),
        Err(GraphError::InvalidRoi { .. })
    ));
    assert!(out.dirty_regions().is_empty());
}

#[test]
fn setting_the_same_value_does_nothing() {
    let fx = chain();
    let out = fx.second.output("Output").unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    out.subscribe_dirty(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    fx.first.input("Input").unwrap().set_value(ramp(&[8, 6])).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn meta_listeners_fire_on_change_only() {
    let fx = chain();
    let out = fx.second.output("Output").unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let id = out
        .subscribe_meta_changed(move |slot| {
            assert!(slot.meta().is_some_and(|m| m.shape == vec![4, 4]));
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let input = fx.first.input("Input").unwrap();
    input.set_value(ramp(&[4, 4])).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let mut other = ramp(&[4, 4]);
    other.typed_mut::<f64>().unwrap().set(&[3, 3], 0.5);
    input.set_value(other).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert!(out.unsubscribe(id).unwrap());
    assert!(!out.unsubscribe(id).unwrap());
}

#[test]
fn listeners_may_edit_the_graph() {
    let fx = chain();
    let scale = fx.graph.add_operator(Scale);
    scale.input("Input").unwrap().set_value(ramp(&[2, 2])).unwrap();
    let factor = scale.input("Factor").unwrap();

    let out = fx.second.output("Output").unwrap();
    out.subscribe_meta_changed(move |_| {
        factor.set_value(3.0).unwrap();
    })
    .unwrap();
    fx.first.input("Input").unwrap().set_value(ramp(&[3, 3])).unwrap();

    let data = scale.output("Output").unwrap().get(roi(&[1, 1], &[2, 2])).wait().unwrap();
    assert_eq!(data.get_f64(&[0, 0]), Some(33.0));
}

#[test]
fn removing_an_operator_unconfigures_consumers() {
    let fx = chain();
    let out = fx.second.output("Output").unwrap();
    let first_out = fx.first.output("Output").unwrap();

    fx.first.remove().unwrap();
    assert!(!fx.first.is_alive());
    assert!(matches!(fx.first.name(), Err(GraphError::StaleHandle(_))));
    assert!(matches!(first_out.name(), Err(GraphError::StaleHandle(_))));
    assert!(!out.is_ready());
    assert!(!fx.second.input("Input").unwrap().is_connected());
    assert!(matches!(
        out.get(roi(&[0, 0], &[1, 1])).wait(),
        Err(RequestError::NotReady(_))
    ));

    // The freed slot index is reused without reviving the old handle.
    let replacement = fx.graph.add_operator(Pipe::default());
    assert!(replacement.is_alive());
    assert!(!fx.first.is_alive());
}

#[test]
fn disconnect_falls_back_and_reconfigures() {
    let fx = chain();
    let input = fx.second.input("Input").unwrap();
    assert!(input.upstream().is_some());
    input.disconnect().unwrap();
    assert!(input.upstream().is_none());
    assert!(!fx.second.output("Output").unwrap().is_ready());
    // Disconnecting twice is harmless.
    input.disconnect().unwrap();
}

#[test]
fn stats_count_the_graph() {
    let fx = chain();
    fx.graph.add_operator(Scale);
    let stats = fx.graph.stats();
    assert_eq!(stats.operator_count, 3);
    assert_eq!(stats.slot_count, 7);
    assert_eq!(stats.connection_count, 1);
    assert_eq!(stats.operators_by_name.get("Pipe"), Some(&2));

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["unready_outputs"], 1);
}

#[test]
fn requests_can_be_awaited_from_a_future() {
    let fx = chain();
    let out = fx.second.output("Output").unwrap();
    let data = futures::executor::block_on(out.get(roi(&[0, 0], &[1, 6]))).unwrap();
    assert_eq!(data.sum(), 15.0);
}
