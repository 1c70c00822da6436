use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Enumerates the element types a value may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si8,
    Ui8,
    Si16,
    Ui16,
    Si32,
    Ui32,
    Si64,
    Ui64,
    /// Target-width index type; accepts any integral concrete dtype when binding.
    Index,
    Bf16,
    F16,
    F32,
    F64,
    Cf32,
    Cf64,
}

impl DType {
    /// Returns `true` when the dtype is any signed or unsigned integer, including `Index`.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DType::Si8
                | DType::Ui8
                | DType::Si16
                | DType::Ui16
                | DType::Si32
                | DType::Ui32
                | DType::Si64
                | DType::Ui64
                | DType::Index
        )
    }

    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::Bf16 | DType::F16 | DType::F32 | DType::F64)
    }

    /// Returns `true` when the dtype is complex.
    pub fn is_complex(self) -> bool {
        matches!(self, DType::Cf32 | DType::Cf64)
    }

    pub fn is_bool(self) -> bool {
        matches!(self, DType::I1)
    }

    /// Dtype a concrete tensor carries for this declared type.
    pub fn storage_dtype(self) -> DType {
        match self {
            DType::Index => DType::Si64,
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::I1 => "i1",
            DType::Si8 => "si8",
            DType::Ui8 => "ui8",
            DType::Si16 => "si16",
            DType::Ui16 => "ui16",
            DType::Si32 => "si32",
            DType::Ui32 => "ui32",
            DType::Si64 => "si64",
            DType::Ui64 => "ui64",
            DType::Index => "index",
            DType::Bf16 => "bf16",
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::Cf32 => "cf32",
            DType::Cf64 => "cf64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar literal carried by constant values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Literal {
    /// Dtype a literal declares when no explicit type is requested.
    pub fn default_dtype(self) -> DType {
        match self {
            Literal::Bool(_) => DType::I1,
            Literal::Int(_) => DType::Index,
            Literal::Float(_) => DType::F64,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(value) => write!(f, "{value}"),
            Literal::Int(value) => write!(f, "{value}"),
            Literal::Float(value) => write!(f, "{value:?}"),
        }
    }
}

/// Parallelization applied to an iteration domain or a launch dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParallelType {
    Serial,
    BIDx,
    BIDy,
    BIDz,
    TIDx,
    TIDy,
    TIDz,
    DIDx,
    DIDy,
    DIDz,
}

impl ParallelType {
    /// Block or thread launch dimension.
    pub fn is_thread(self) -> bool {
        matches!(
            self,
            ParallelType::BIDx
                | ParallelType::BIDy
                | ParallelType::BIDz
                | ParallelType::TIDx
                | ParallelType::TIDy
                | ParallelType::TIDz
        )
    }

    /// Dimension distributed across a device mesh.
    pub fn is_device(self) -> bool {
        self.mesh_axis().is_some()
    }

    /// Mesh axis a device parallel type distributes over.
    pub fn mesh_axis(self) -> Option<usize> {
        match self {
            ParallelType::DIDx => Some(0),
            ParallelType::DIDy => Some(1),
            ParallelType::DIDz => Some(2),
            _ => None,
        }
    }

    /// Named-scalar convention used for launch extents (`blockDim.x`, `gridDim.z`, ...).
    pub fn launch_name(self) -> Option<&'static str> {
        match self {
            ParallelType::BIDx => Some("gridDim.x"),
            ParallelType::BIDy => Some("gridDim.y"),
            ParallelType::BIDz => Some("gridDim.z"),
            ParallelType::TIDx => Some("blockDim.x"),
            ParallelType::TIDy => Some("blockDim.y"),
            ParallelType::TIDz => Some("blockDim.z"),
            _ => None,
        }
    }
}

impl fmt::Display for ParallelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Arena handle of a value node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Arena handle of an expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExprId(pub u32);

/// Arena handle of an iteration domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IterDomainId(pub u32);

/// Logical grid of devices a tensor is distributed over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceMesh {
    shape: Vec<usize>,
    devices: Vec<i64>,
}

impl DeviceMesh {
    /// Builds a one-dimensional mesh over the given device ids.
    pub fn new(devices: impl Into<Vec<i64>>) -> Self {
        let devices = devices.into();
        Self {
            shape: vec![devices.len()],
            devices,
        }
    }

    /// Builds a mesh of the given shape. Returns `None` when the device count does not fill it.
    pub fn with_shape(shape: impl Into<Vec<usize>>, devices: impl Into<Vec<i64>>) -> Option<Self> {
        let shape = shape.into();
        let devices = devices.into();
        let expected = shape.iter().try_fold(1usize, |acc, dim| acc.checked_mul(*dim))?;
        (expected == devices.len()).then_some(Self { shape, devices })
    }

    pub fn size(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn devices(&self) -> &[i64] {
        &self.devices
    }

    /// Number of devices along `axis`, or `None` when the mesh has no such axis.
    pub fn extent(&self, axis: usize) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        self.shape.get(axis).copied()
    }
}

/// One tensor dimension. Its extent and optional expanded extent are ordinary scalar values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterDomain {
    pub extent: ValueId,
    pub expanded_extent: Option<ValueId>,
    pub is_broadcast: bool,
    pub is_reduction: bool,
    pub parallel: ParallelType,
}

impl IterDomain {
    /// Ordinary iteration dimension.
    pub fn iteration(extent: ValueId) -> Self {
        Self {
            extent,
            expanded_extent: None,
            is_broadcast: false,
            is_reduction: false,
            parallel: ParallelType::Serial,
        }
    }

    /// Size-one broadcast dimension.
    pub fn broadcast(extent: ValueId) -> Self {
        Self {
            is_broadcast: true,
            ..Self::iteration(extent)
        }
    }

    /// Broadcast dimension replicated (stride zero) to `expanded_extent`.
    pub fn expanded(extent: ValueId, expanded_extent: ValueId) -> Self {
        Self {
            expanded_extent: Some(expanded_extent),
            ..Self::broadcast(extent)
        }
    }

    pub fn reduction(extent: ValueId) -> Self {
        Self {
            is_reduction: true,
            ..Self::iteration(extent)
        }
    }

    pub fn parallelize(mut self, parallel: ParallelType) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn has_expanded_extent(&self) -> bool {
        self.expanded_extent.is_some()
    }

    pub fn is_device_dim(&self) -> bool {
        self.parallel.is_device()
    }
}

/// Tensor descriptor attached to tensor-kinded values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub domain: Vec<IterDomainId>,
    pub mesh: Option<DeviceMesh>,
    /// Host-resident scalar tensor (e.g. RNG seeds produced on the CPU).
    pub cpu_scalar: bool,
}

impl TensorDesc {
    pub fn new(domain: impl Into<Vec<IterDomainId>>) -> Self {
        Self {
            domain: domain.into(),
            mesh: None,
            cpu_scalar: false,
        }
    }

    pub fn with_mesh(mut self, mesh: DeviceMesh) -> Self {
        self.mesh = Some(mesh);
        self
    }

    pub fn cpu_scalar(mut self) -> Self {
        self.cpu_scalar = true;
        self
    }
}

/// Semantic kind of a value node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Scalar,
    /// Runtime constant identified by name rather than by graph identity.
    NamedScalar { name: String },
    Tensor(TensorDesc),
}

/// Value node stored in the graph arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueNode {
    pub dtype: DType,
    pub kind: ValueKind,
    pub literal: Option<Literal>,
    pub definition: Option<ExprId>,
}

impl ValueNode {
    pub fn is_const(&self) -> bool {
        self.literal.is_some()
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self.kind, ValueKind::Tensor(_))
    }

    pub fn tensor(&self) -> Option<&TensorDesc> {
        match &self.kind {
            ValueKind::Tensor(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn named_scalar(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::NamedScalar { name } => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Not,
    Cast(DType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    CeilDiv,
    Mod,
    Max,
    Min,
    Eq,
    Lt,
    Le,
    And,
    Or,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::CeilDiv => "ceil_div",
            BinaryOp::Mod => "mod",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
            BinaryOp::Eq => "eq",
            BinaryOp::Lt => "lt",
            BinaryOp::Le => "le",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    /// Comparison and logical ops produce booleans.
    pub fn is_predicate(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Lt | BinaryOp::Le | BinaryOp::And | BinaryOp::Or
        )
    }
}

/// Operation performed by an expression node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExprOp {
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// `where(cond, a, b)`.
    Where,
    /// Two outputs: quotient and remainder.
    DivMod,
    TensorSize { axis: usize },
    TensorStride { axis: usize },
    Set,
    Pointwise,
    Broadcast { is_new: Vec<bool> },
    Transpose { perm: Vec<usize> },
    Reduction { axes: Vec<usize> },
}

impl ExprOp {
    pub fn name(&self) -> &'static str {
        match self {
            ExprOp::Unary(UnaryOp::Neg) => "neg",
            ExprOp::Unary(UnaryOp::Abs) => "abs",
            ExprOp::Unary(UnaryOp::Not) => "not",
            ExprOp::Unary(UnaryOp::Cast(_)) => "cast",
            ExprOp::Binary(op) => op.as_str(),
            ExprOp::Where => "where",
            ExprOp::DivMod => "div_mod",
            ExprOp::TensorSize { .. } => "tensor_size",
            ExprOp::TensorStride { .. } => "tensor_stride",
            ExprOp::Set => "set",
            ExprOp::Pointwise => "pointwise",
            ExprOp::Broadcast { .. } => "broadcast",
            ExprOp::Transpose { .. } => "transpose",
            ExprOp::Reduction { .. } => "reduction",
        }
    }

    /// Ops whose outputs are tensors and whose domains participate in exact mapping.
    pub fn is_tensor_op(&self) -> bool {
        matches!(
            self,
            ExprOp::Set
                | ExprOp::Pointwise
                | ExprOp::Broadcast { .. }
                | ExprOp::Transpose { .. }
                | ExprOp::Reduction { .. }
        )
    }
}

/// Expression node: consumes ordered inputs, produces ordered outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expr {
    pub op: ExprOp,
    pub inputs: SmallVec<[ValueId; 4]>,
    pub outputs: SmallVec<[ValueId; 2]>,
}
