use candle::{Result, Tensor};
use candle_nn::{Init, VarBuilder};
use serde::Deserialize;

#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "lowercase")]
pub enum HiddenAct {
    Gelu,
    #[serde(rename = "gelu_new", alias = "gelu_pytorch_tanh")]
    GeluApproximate,
    Relu,
}

impl HiddenAct {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            HiddenAct::Gelu => x.gelu_erf(),
            HiddenAct::GeluApproximate => x.gelu(),
            HiddenAct::Relu => x.relu(),
        }
    }
}

#[derive(Debug)]
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
    act: Option<HiddenAct>,
    span: tracing::Span,
}

impl Linear {
    pub fn new(weight: Tensor, bias: Option<Tensor>, act: Option<HiddenAct>) -> Self {
        let span = tracing::span!(tracing::Level::TRACE, "linear");

        Self {
            weight,
            bias,
            act,
            span,
        }
    }

    /// Load `weight` and `bias` from `vb`.
    ///
    /// Backends that create missing variables (e.g. a `VarMap`) initialise them the way
    /// `torch.nn.Linear` does: weight and bias both uniform in `[-1/sqrt(in), 1/sqrt(in)]`,
    /// which is what Kaiming uniform with `a = sqrt(5)` reduces to.
    pub fn load(vb: VarBuilder, in_features: usize, out_features: usize) -> Result<Self> {
        let bound = 1. / (in_features as f64).sqrt();
        let weight = vb.get_with_hints(
            (out_features, in_features),
            "weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let bias = vb.get_with_hints(
            out_features,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;

        Ok(Self::new(weight, Some(bias), None))
    }

    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();

        let w = match x.dims() {
            &[bsize, _, _] => self.weight.broadcast_left(bsize)?.t()?,
            _ => self.weight.t()?,
        };
        let x = x.matmul(&w)?;
        let x = match &self.bias {
            None => Ok(x),
            Some(bias) => x.broadcast_add(bias),
        }?;
        if let Some(act) = &self.act {
            act.forward(&x)
        } else {
            Ok(x)
        }
    }
}
