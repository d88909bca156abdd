//! Value typing for dataflow graphs.
//!
//! Every value flowing along a data edge carries a declared [`TypeSig`]:
//! an element type plus a shape. Signatures are fixed at graph-construction
//! time and checked structurally; the interpreter enforces them again at
//! runtime.

use std::fmt;

use smallvec::SmallVec;

/// Element type of a dataflow value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DType {
    Bool,
    I64,
    F64,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Bool => write!(f, "bool"),
            DType::I64 => write!(f, "i64"),
            DType::F64 => write!(f, "f64"),
        }
    }
}

/// Shape of a dataflow value. Rank 0 is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Shape {
    pub dims: SmallVec<[usize; 4]>,
}

impl Shape {
    /// The rank-0 shape.
    pub fn scalar() -> Self {
        Shape { dims: SmallVec::new() }
    }

    /// A rank-1 shape of length `n`.
    pub fn vector(n: usize) -> Self {
        Shape { dims: SmallVec::from_slice(&[n]) }
    }

    pub fn new(dims: &[usize]) -> Self {
        Shape { dims: SmallVec::from_slice(dims) }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Total element count (1 for scalars).
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return write!(f, "scalar");
        }
        let rendered: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "{}", rendered.join("x"))
    }
}

/// Declared type and shape of one dataflow value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TypeSig {
    pub dtype: DType,
    pub shape: Shape,
}

impl TypeSig {
    /// A scalar signature of the given element type.
    pub fn scalar(dtype: DType) -> Self {
        TypeSig { dtype, shape: Shape::scalar() }
    }

    pub fn new(dtype: DType, shape: Shape) -> Self {
        TypeSig { dtype, shape }
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.shape.is_scalar() {
            write!(f, "{}", self.dtype)
        } else {
            write!(f, "{}[{}]", self.dtype, self.shape)
        }
    }
}

/// A typed scalar constant embedded in a graph.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Literal {
    Bool(bool),
    I64(i64),
    F64(f64),
}

impl Literal {
    pub fn dtype(&self) -> DType {
        match self {
            Literal::Bool(_) => DType::Bool,
            Literal::I64(_) => DType::I64,
            Literal::F64(_) => DType::F64,
        }
    }

    /// The scalar signature of this literal.
    pub fn type_sig(&self) -> TypeSig {
        TypeSig::scalar(self.dtype())
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(v) => write!(f, "{v}"),
            Literal::I64(v) => write!(f, "{v}"),
            Literal::F64(v) => write!(f, "{v}"),
        }
    }
}
