use ndarray::ArrayView1;

use crate::error::BridgeError;

/// Length of every face feature vector produced or accepted by the engine.
pub const EMBEDDING_DIM: usize = 512;

/// Face feature vector. Always exactly [`EMBEDDING_DIM`] elements.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Box<[f32; EMBEDDING_DIM]>,
}

impl Embedding {
    pub fn from_vec(values: Vec<f32>) -> Result<Self, BridgeError> {
        let actual = values.len();
        let values: Box<[f32; EMBEDDING_DIM]> = values
            .into_boxed_slice()
            .try_into()
            .map_err(|_| BridgeError::InvalidEmbeddingLength {
                expected: EMBEDDING_DIM,
                actual,
            })?;
        Ok(Self { values })
    }

    pub fn from_array(values: [f32; EMBEDDING_DIM]) -> Self {
        Self {
            values: Box::new(values),
        }
    }

    pub fn as_array(&self) -> &[f32; EMBEDDING_DIM] {
        &self.values
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values[..]
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.values.to_vec()
    }
}

impl AsRef<[f32]> for Embedding {
    fn as_ref(&self) -> &[f32] {
        self.as_slice()
    }
}

/// View a slice as a fixed-length feature vector, rejecting any other length.
pub fn as_feature(values: &[f32]) -> Result<&[f32; EMBEDDING_DIM], BridgeError> {
    values
        .try_into()
        .map_err(|_| BridgeError::InvalidEmbeddingLength {
            expected: EMBEDDING_DIM,
            actual: values.len(),
        })
}

/// Cosine similarity of two vectors; `NaN` when either has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let a = ArrayView1::from(&a[..len]);
    let b = ArrayView1::from(&b[..len]);

    let na = a.dot(&a);
    let nb = b.dot(&b);
    if na == 0.0 || nb == 0.0 {
        return f32::NAN;
    }
    a.dot(&b) / (na.sqrt() * nb.sqrt())
}
