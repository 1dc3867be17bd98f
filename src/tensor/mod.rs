use ndarray::{Array, ArrayView, Ix1};

pub type Tensor1 = Array<f32, Ix1>;
pub type TensorView1<'a> = ArrayView<'a, f32, Ix1>;
