//! Input model description.
//!
//! A [`Model`] is a sequential stack of layers with concrete (already
//! trained) weights. Shapes are per-sample: the batch dimension is elided,
//! so a 28x28 single-channel image input is `[28, 28, 1]`.

use crate::error::CompileError;

/// Per-sample tensor shape, batch dimension elided.
pub type Shape = Vec<usize>;

/// Number of elements in a shape.
#[must_use]
pub fn shape_elts(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Render a shape as `[a,b,c]` for comments and stats.
#[must_use]
pub fn shape_to_string(shape: &[usize]) -> String {
    let parts: Vec<String> = shape.iter().map(|x| x.to_string()).collect();
    format!("[{}]", parts.join(","))
}

/// Activation applied after a dense or convolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Softmax,
}

impl Activation {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::Softmax => "softmax",
        }
    }
}

/// Convolution / pooling padding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Padding {
    /// No padding; the kernel never leaves the input.
    #[default]
    Valid,
    /// Zero-pad so the output covers every input position.
    Same,
}

/// One layer of the stack.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Layer {
    /// User-visible layer name, used in error messages and stats.
    pub name: String,
    pub kind: LayerKind,
}

impl Layer {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Layer {
            name: name.into(),
            kind,
        }
    }
}

/// Layer kind with its configuration and weights.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LayerKind {
    /// Fully connected layer. `weights[i][u]` is the weight from input `i`
    /// to unit `u`; `bias[u]` is used when `use_bias` is set.
    Dense {
        units: usize,
        use_bias: bool,
        activation: Activation,
        weights: Vec<Vec<f32>>,
        bias: Vec<f32>,
    },
    /// 1-D convolution over `[width, channels]` input.
    /// `weights[x][c][f]` indexed by kernel position, input channel, filter.
    Conv1D {
        filters: usize,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
        use_bias: bool,
        activation: Activation,
        weights: Vec<Vec<Vec<f32>>>,
        bias: Vec<f32>,
    },
    /// 2-D convolution over `[height, width, channels]` input
    /// (channels-last). `weights[y][x][c][f]`.
    Conv2D {
        filters: usize,
        kernel_size: [usize; 2],
        strides: [usize; 2],
        padding: Padding,
        use_bias: bool,
        activation: Activation,
        weights: Vec<Vec<Vec<Vec<f32>>>>,
        bias: Vec<f32>,
    },
    /// 1-D max pooling over `[width, channels]` input.
    MaxPool1D {
        pool_size: usize,
        stride: usize,
        padding: Padding,
    },
    /// 2-D max pooling over `[height, width, channels]` input.
    MaxPool2D {
        pool_size: [usize; 2],
        strides: [usize; 2],
        padding: Padding,
    },
    /// Collapse to a single dimension; identity on memory.
    Flatten,
    /// Reinterpret the element block with a new shape; identity on memory.
    Reshape { shape: Shape },
    /// Identity at inference time.
    Dropout,
    /// Explicit input marker; identity.
    Input,
}

impl LayerKind {
    /// Class name used in generated-code comments and stats.
    #[must_use]
    pub fn class_name(&self) -> &'static str {
        match self {
            LayerKind::Dense { .. } => "Dense",
            LayerKind::Conv1D { .. } => "Conv1D",
            LayerKind::Conv2D { .. } => "Conv2D",
            LayerKind::MaxPool1D { .. } => "MaxPooling1D",
            LayerKind::MaxPool2D { .. } => "MaxPooling2D",
            LayerKind::Flatten => "Flatten",
            LayerKind::Reshape { .. } => "Reshape",
            LayerKind::Dropout => "Dropout",
            LayerKind::Input => "InputLayer",
        }
    }

    /// Layers that do not move data can share their input buffer.
    #[must_use]
    pub fn is_in_place(&self) -> bool {
        matches!(
            self,
            LayerKind::Flatten | LayerKind::Reshape { .. } | LayerKind::Dropout | LayerKind::Input
        )
    }
}

fn conv_out(input: usize, kernel: usize, stride: usize, padding: Padding) -> usize {
    match padding {
        Padding::Valid => (input - kernel) / stride + 1,
        Padding::Same => input.div_ceil(stride),
    }
}

/// Sequential model: an input shape and a stack of layers.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Model {
    pub input_shape: Shape,
    pub layers: Vec<Layer>,
}

impl Model {
    #[must_use]
    pub fn new(input_shape: Shape, layers: Vec<Layer>) -> Self {
        Model {
            input_shape,
            layers,
        }
    }
}

/// Compute a layer's output shape from its input shape.
pub fn output_shape(layer: &Layer, input: &Shape) -> Result<Shape, CompileError> {
    let unsupported = |detail: String| CompileError::UnsupportedLayer {
        layer: layer.name.clone(),
        detail,
    };
    let want_dims = |n: usize| {
        if input.len() == n {
            Ok(())
        } else {
            Err(unsupported(format!(
                "inputShape: {}",
                shape_to_string(input)
            )))
        }
    };
    match &layer.kind {
        LayerKind::Dense { units, .. } => {
            want_dims(1)?;
            Ok(vec![*units])
        }
        LayerKind::Conv1D {
            filters,
            kernel_size,
            stride,
            padding,
            ..
        } => {
            want_dims(2)?;
            Ok(vec![
                conv_out(input[0], *kernel_size, *stride, *padding),
                *filters,
            ])
        }
        LayerKind::Conv2D {
            filters,
            kernel_size,
            strides,
            padding,
            ..
        } => {
            want_dims(3)?;
            Ok(vec![
                conv_out(input[0], kernel_size[0], strides[0], *padding),
                conv_out(input[1], kernel_size[1], strides[1], *padding),
                *filters,
            ])
        }
        LayerKind::MaxPool1D {
            pool_size,
            stride,
            padding,
        } => {
            want_dims(2)?;
            Ok(vec![
                conv_out(input[0], *pool_size, *stride, *padding),
                input[1],
            ])
        }
        LayerKind::MaxPool2D {
            pool_size,
            strides,
            padding,
        } => {
            want_dims(3)?;
            Ok(vec![
                conv_out(input[0], pool_size[0], strides[0], *padding),
                conv_out(input[1], pool_size[1], strides[1], *padding),
                input[2],
            ])
        }
        LayerKind::Flatten => Ok(vec![shape_elts(input)]),
        LayerKind::Reshape { shape } => {
            if shape_elts(shape) != shape_elts(input) {
                return Err(unsupported(format!(
                    "reshape {} from {}",
                    shape_to_string(shape),
                    shape_to_string(input)
                )));
            }
            Ok(shape.clone())
        }
        LayerKind::Dropout | LayerKind::Input => Ok(input.clone()),
    }
}

/// Compilation options.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CompileOptions {
    /// Run the IR optimizer (loop unrolling, strip-mining, dead pointer
    /// arithmetic removal).
    pub optimize: bool,
    /// Store weights as IEEE binary16 halving the weight pool size.
    pub float16_weights: bool,
    /// Embed `test_input`/`test_output` vectors in the binary image.
    pub include_test: bool,
    pub test_input: Option<Vec<f32>>,
    pub test_output: Option<Vec<f32>>,
    /// Take the embedded reference output from the crate's own simulator
    /// rather than `test_output`. With half-precision weights the simulator
    /// matches the generated code bit-for-bit while an external float32
    /// reference may not.
    pub test_output_from_sim: bool,
    /// Flash budget in bytes; compilation fails when the image is larger.
    pub flash_size: Option<u32>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            optimize: true,
            float16_weights: false,
            include_test: false,
            test_input: None,
            test_output: None,
            test_output_from_sim: false,
            flash_size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_output_shape() {
        let l = Layer::new(
            "d",
            LayerKind::Dense {
                units: 10,
                use_bias: false,
                activation: Activation::Linear,
                weights: vec![],
                bias: vec![],
            },
        );
        assert_eq!(output_shape(&l, &vec![33]).unwrap(), vec![10]);
        assert!(output_shape(&l, &vec![3, 11]).is_err());
    }

    #[test]
    fn conv2d_valid_and_same() {
        let mk = |padding| {
            Layer::new(
                "c",
                LayerKind::Conv2D {
                    filters: 16,
                    kernel_size: [4, 4],
                    strides: [1, 1],
                    padding,
                    use_bias: false,
                    activation: Activation::Linear,
                    weights: vec![],
                    bias: vec![],
                },
            )
        };
        let input = vec![50, 3, 1];
        assert_eq!(
            output_shape(&mk(Padding::Valid), &input).unwrap(),
            vec![47, 1, 16]
        );
        // 'same' keeps every stride-1 position
        assert_eq!(
            output_shape(&mk(Padding::Same), &input).unwrap(),
            vec![50, 3, 16]
        );
    }

    #[test]
    fn pool_output_shape() {
        let l = Layer::new(
            "p",
            LayerKind::MaxPool2D {
                pool_size: [2, 2],
                strides: [2, 2],
                padding: Padding::Valid,
            },
        );
        assert_eq!(output_shape(&l, &vec![24, 4, 16]).unwrap(), vec![12, 2, 16]);
    }

    #[test]
    fn flatten_and_reshape() {
        let f = Layer::new("f", LayerKind::Flatten);
        assert_eq!(output_shape(&f, &vec![12, 2, 16]).unwrap(), vec![384]);
        let r = Layer::new(
            "r",
            LayerKind::Reshape {
                shape: vec![24, 16],
            },
        );
        assert_eq!(output_shape(&r, &vec![384]).unwrap(), vec![24, 16]);
        let bad = Layer::new("r", LayerKind::Reshape { shape: vec![7] });
        assert!(output_shape(&bad, &vec![384]).is_err());
    }

    #[test]
    fn options_default_to_optimizing() {
        let opts = CompileOptions::default();
        assert!(opts.optimize);
        assert!(!opts.float16_weights);
    }
}
