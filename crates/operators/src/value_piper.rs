use roiflow_core::{ConfigurationError, Roi};
use roiflow_graph::{ConfigureContext, DirtyContext, InputSpec, Operator, OutputSpec};

/// Publishes its value-type `Input` on a value-type `Output`.
///
/// Extra value inputs (parameters of a derived operator) can be declared;
/// they are not read here, but any of them going dirty marks the whole
/// output dirty.
#[derive(Debug, Default, Clone)]
pub struct OpValuePiper {
    extra: Vec<String>,
}

impl OpValuePiper {
    pub const INPUT: usize = 0;
    pub const OUTPUT: usize = 0;

    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an additional optional value input.
    pub fn with_extra_input(mut self, name: impl Into<String>) -> Self {
        self.extra.push(name.into());
        self
    }
}

impl Operator for OpValuePiper {
    fn name(&self) -> &str {
        "OpValuePiper"
    }

    fn inputs(&self) -> Vec<InputSpec> {
        std::iter::once(InputSpec::value("Input"))
            .chain(self.extra.iter().map(|n| InputSpec::value(n.as_str()).optional()))
            .collect()
    }

    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::value("Output")]
    }

    fn configure(&self, cx: &mut ConfigureContext) -> Result<(), ConfigurationError> {
        let value = cx.require_value(Self::INPUT)?.clone();
        cx.set_output_value(Self::OUTPUT, value);
        Ok(())
    }

    fn notify_dirty(&self, cx: &mut DirtyContext, input: usize, _roi: &Roi) {
        // A new `Input` value reaches the output through reconfiguration.
        if input != Self::INPUT {
            cx.set_output_dirty_all(Self::OUTPUT);
        }
    }
}
