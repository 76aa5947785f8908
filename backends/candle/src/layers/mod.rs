mod layer_norm;
mod linear;

pub use layer_norm::LayerNorm;
pub use linear::{HiddenAct, Linear};
