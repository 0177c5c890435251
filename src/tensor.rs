//! Wire-format dense tensors.
//!
//! The wire is deliberately narrow: only `int64` and `float32` cross it.
//! Wider local types are accepted through the lossy constructors, which
//! always log what was narrowed. [`TensorAdapter`] is the seam to a local
//! gradient-capable tensor library for the custom-loss pipeline.

use crate::error::{Result, TinkerError};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The two permitted wire dtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorDtype {
    /// Signed 64-bit integers (token ids, masks, counts).
    Int64,
    /// 32-bit floats (logprobs, advantages, gradients).
    Float32,
}

impl TensorDtype {
    /// Size of one element in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            TensorDtype::Int64 => 8,
            TensorDtype::Float32 => 4,
        }
    }
}

/// Flat element storage, typed by dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorElems {
    Int64(Vec<i64>),
    Float32(Vec<f32>),
}

impl TensorElems {
    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            TensorElems::Int64(v) => v.len(),
            TensorElems::Float32(v) => v.len(),
        }
    }

    /// Whether the storage is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A dense tensor in wire format: dtype, optional shape (`None` = scalar),
/// and a flat data list.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    pub dtype: TensorDtype,
    pub shape: Option<Vec<u64>>,
    pub data: TensorElems,
}

impl TensorData {
    /// Build a float32 tensor, checking that the shape matches the data.
    pub fn from_f32(data: Vec<f32>, shape: Option<Vec<u64>>) -> Result<Self> {
        check_shape(data.len(), &shape)?;
        Ok(Self {
            dtype: TensorDtype::Float32,
            shape,
            data: TensorElems::Float32(data),
        })
    }

    /// Build an int64 tensor, checking that the shape matches the data.
    pub fn from_i64(data: Vec<i64>, shape: Option<Vec<u64>>) -> Result<Self> {
        check_shape(data.len(), &shape)?;
        Ok(Self {
            dtype: TensorDtype::Int64,
            shape,
            data: TensorElems::Int64(data),
        })
    }

    /// A scalar float32.
    pub fn scalar_f32(value: f32) -> Self {
        Self {
            dtype: TensorDtype::Float32,
            shape: None,
            data: TensorElems::Float32(vec![value]),
        }
    }

    /// A scalar int64.
    pub fn scalar_i64(value: i64) -> Self {
        Self {
            dtype: TensorDtype::Int64,
            shape: None,
            data: TensorElems::Int64(vec![value]),
        }
    }

    /// Downcast local float64 data to the float32 wire type.
    ///
    /// The downcast is permitted but must be loud: a warning naming the
    /// original dtype is logged on every call.
    pub fn from_f64_lossy(data: Vec<f64>, shape: Option<Vec<u64>>) -> Result<Self> {
        tracing::warn!(
            original_dtype = "float64",
            wire_dtype = "float32",
            elements = data.len(),
            "downcasting tensor data for wire transfer"
        );
        Self::from_f32(data.into_iter().map(|v| v as f32).collect(), shape)
    }

    /// Upcast local u64 data to the int64 wire type.
    ///
    /// Warned unconditionally: values above `i64::MAX` change meaning, and
    /// the wire cannot represent the distinction.
    pub fn from_u64_lossy(data: Vec<u64>, shape: Option<Vec<u64>>) -> Result<Self> {
        tracing::warn!(
            original_dtype = "uint64",
            wire_dtype = "int64",
            elements = data.len(),
            "reinterpreting unsigned tensor data as signed for wire transfer"
        );
        Self::from_i64(data.into_iter().map(|v| v as i64).collect(), shape)
    }

    /// Number of elements implied by the shape (1 for scalars).
    pub fn numel(&self) -> u64 {
        match &self.shape {
            Some(dims) => dims.iter().product(),
            None => 1,
        }
    }

    /// Byte length of the flattened data. Used by the request-chunking
    /// heuristic.
    pub fn data_byte_len(&self) -> usize {
        self.data.len() * self.dtype.size_bytes()
    }

    /// Borrow the data as f32, or fail when the dtype is int64.
    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            TensorElems::Float32(v) => Ok(v),
            TensorElems::Int64(_) => Err(TinkerError::Validation(
                "expected float32 tensor, got int64".into(),
            )),
        }
    }

    /// Borrow the data as i64, or fail when the dtype is float32.
    pub fn as_i64(&self) -> Result<&[i64]> {
        match &self.data {
            TensorElems::Int64(v) => Ok(v),
            TensorElems::Float32(_) => Err(TinkerError::Validation(
                "expected int64 tensor, got float32".into(),
            )),
        }
    }
}

fn check_shape(len: usize, shape: &Option<Vec<u64>>) -> Result<()> {
    let expected = match shape {
        Some(dims) => dims.iter().product::<u64>(),
        None => 1,
    };
    if expected != len as u64 {
        return Err(TinkerError::Validation(format!(
            "tensor shape {shape:?} implies {expected} elements, data has {len}"
        )));
    }
    Ok(())
}

// Serialization is dtype-directed: the same JSON number list decodes to i64
// or f32 depending on the `dtype` field, so decoding goes through a raw
// helper rather than an untagged enum.

#[derive(Serialize, Deserialize)]
struct TensorWire {
    dtype: TensorDtype,
    #[serde(skip_serializing_if = "Option::is_none")]
    shape: Option<Vec<u64>>,
    data: Vec<serde_json::Value>,
}

impl Serialize for TensorData {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let data = match &self.data {
            TensorElems::Int64(v) => v.iter().map(|x| serde_json::json!(x)).collect(),
            TensorElems::Float32(v) => v.iter().map(|x| serde_json::json!(x)).collect(),
        };
        TensorWire {
            dtype: self.dtype,
            shape: self.shape.clone(),
            data,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TensorData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = TensorWire::deserialize(deserializer)?;
        let data = match wire.dtype {
            TensorDtype::Int64 => TensorElems::Int64(
                wire.data
                    .iter()
                    .map(|v| {
                        v.as_i64()
                            .ok_or_else(|| D::Error::custom(format!("non-int64 element: {v}")))
                    })
                    .collect::<std::result::Result<_, _>>()?,
            ),
            TensorDtype::Float32 => TensorElems::Float32(
                wire.data
                    .iter()
                    .map(|v| {
                        v.as_f64().map(|f| f as f32).ok_or_else(|| {
                            D::Error::custom(format!("non-float32 element: {v}"))
                        })
                    })
                    .collect::<std::result::Result<_, _>>()?,
            ),
        };
        check_shape(data.len(), &wire.shape).map_err(D::Error::custom)?;
        Ok(TensorData {
            dtype: wire.dtype,
            shape: wire.shape,
            data,
        })
    }
}

/// Bridge to a local gradient-capable tensor library.
///
/// The custom-loss pipeline converts wire logprobs to local tensors, runs the
/// caller's loss function under the adapter, and reads back the gradients as
/// wire tensors. Implementations wrap whatever autograd the host application
/// uses; tests ship a finite-difference adapter over `Vec<f64>`.
pub trait TensorAdapter: Send + Sync {
    /// The local tensor type.
    type Tensor: Send + Sync;

    /// Decode a wire tensor into a local tensor.
    fn from_wire(&self, data: &TensorData) -> Result<Self::Tensor>;

    /// Encode a local tensor into wire format (float32/int64 only).
    fn to_wire(&self, tensor: &Self::Tensor) -> Result<TensorData>;

    /// Evaluate `loss_fn` on `inputs` under gradient tracking.
    ///
    /// Returns the scalar loss and `d(loss)/d(input)` for each input, in
    /// input order, as float32 wire tensors shaped like the inputs.
    fn loss_and_grad(
        &self,
        inputs: &[Self::Tensor],
        loss_fn: &dyn Fn(&[Self::Tensor]) -> anyhow::Result<f64>,
    ) -> Result<(f64, Vec<TensorData>)>;
}
