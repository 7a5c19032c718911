use async_trait::async_trait;
use roiflow_core::{Buffer, ConfigurationError, Roi};
use roiflow_graph::{ComputeContext, ConfigureContext, DirtyContext, InputSpec, Operator, OutputSpec};
use roiflow_request::RequestError;

/// Hands its input through unchanged: metadata, data and dirty regions.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpArrayPiper;

impl OpArrayPiper {
    pub const INPUT: usize = 0;
    pub const OUTPUT: usize = 0;
}

#[async_trait]
impl Operator for OpArrayPiper {
    fn name(&self) -> &str {
        "OpArrayPiper"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        vec![InputSpec::array("Input")]
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::array("Output")]
    }

    fn configure(&self, cx: &mut ConfigureContext) -> Result<(), ConfigurationError> {
        let meta = cx.input_meta(Self::INPUT)?.clone();
        cx.set_output_meta(Self::OUTPUT, meta);
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
        cx.set_output_dirty(Self::OUTPUT, roi.clone());
    }
}
