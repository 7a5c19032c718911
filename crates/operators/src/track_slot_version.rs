use async_trait::async_trait;
use roiflow_core::{Buffer, ConfigurationError, Roi, Value};
use roiflow_graph::{ComputeContext, ConfigureContext, DirtyContext, InputSpec, Operator, OutputSpec};
use roiflow_request::RequestError;

/// Pass-through that counts dirty notifications on its input.
///
/// `Version` is reset to 0 whenever the operator is configured and goes up
/// by one for every dirty region reported on `Input`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpTrackSlotVersion;

impl OpTrackSlotVersion {
    pub const INPUT: usize = 0;
    pub const OUTPUT: usize = 0;
    pub const VERSION: usize = 1;
}

#[async_trait]
impl Operator for OpTrackSlotVersion {
    fn name(&self) -> &str {
        "OpTrackSlotVersion"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![InputSpec::array("Input")]
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::array("Output"), OutputSpec::value("Version")]
    }

    fn configure(&self, cx: &mut ConfigureContext) -> Result<(), ConfigurationError> {
        let meta = cx.input_meta(Self::INPUT)?.clone();
        cx.set_output_meta(Self::OUTPUT, meta);
        cx.set_output_value(Self::VERSION, Value::Int(0));
        Ok(())
    }

    async fn compute(
        &self,
        cx: &ComputeContext,
        _output: usize,
        roi: &Roi,
        dest: &mut Buffer,
    ) -> Result<(), RequestError> {
        *dest = cx.request_input(Self::INPUT, roi.clone()).await?;
        Ok(())
    }

    fn notify_dirty(&self, cx: &mut DirtyContext, _input: usize, roi: &Roi) {
        let version = cx
            .output_value(Self::VERSION)
            .and_then(Value::as_int)
            .unwrap_or(0);
        cx.set_output_value(Self::VERSION, Value::Int(version + 1));
        cx.set_output_dirty(Self::OUTPUT, roi.clone());
    }
}
