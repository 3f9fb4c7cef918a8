//! Static per-operation capability tables
//!
//! Each (operation kind, operand role) pair owns a list of [`TensorLimits`]
//! entries, one per hardware generation that changed the limits. Lookups pick
//! the newest entry whose `since` generation is not newer than the target.
//! Tables are built once on first use and never mutated.

pub mod affine;
pub mod pooling;

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::error::ConfigReason;
use crate::tensor::{DataType, Dim, Layout, OperandRole};

/// Accelerator hardware revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub enum HwGeneration {
    V1,
    V2,
    #[default]
    V3,
}

impl HwGeneration {
    pub const ALL: [HwGeneration; 3] = [HwGeneration::V1, HwGeneration::V2, HwGeneration::V3];

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "v1" | "1" => Some(HwGeneration::V1),
            "v2" | "2" => Some(HwGeneration::V2),
            "v3" | "3" => Some(HwGeneration::V3),
            _ => None,
        }
    }
}

impl fmt::Display for HwGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HwGeneration::V1 => write!(f, "v1"),
            HwGeneration::V2 => write!(f, "v2"),
            HwGeneration::V3 => write!(f, "v3"),
        }
    }
}

/// Layer operation kinds understood by the transform builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum OperationKind {
    Affine,
    AffineDiagonal,
    AffineMultiBias,
    Pooling,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Affine,
        OperationKind::AffineDiagonal,
        OperationKind::AffineMultiBias,
        OperationKind::Pooling,
    ];

    /// First hardware generation that executes this operation
    pub fn since(self) -> HwGeneration {
        match self {
            OperationKind::AffineMultiBias => HwGeneration::V2,
            _ => HwGeneration::V1,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Affine => write!(f, "affine"),
            OperationKind::AffineDiagonal => write!(f, "affine-diagonal"),
            OperationKind::AffineMultiBias => write!(f, "affine-multibias"),
            OperationKind::Pooling => write!(f, "pooling"),
        }
    }
}

/// Inclusive range with a step, plus the reason raised on violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RangeLimit {
    pub min: u32,
    pub max: u32,
    pub multiple: u32,
    pub reason: ConfigReason,
}

impl RangeLimit {
    pub const fn new(min: u32, max: u32, multiple: u32, reason: ConfigReason) -> Self {
        Self {
            min,
            max,
            multiple,
            reason,
        }
    }

    pub const fn range(min: u32, max: u32, reason: ConfigReason) -> Self {
        Self::new(min, max, 1, reason)
    }

    pub fn contains(&self, value: u32) -> bool {
        value >= self.min && value <= self.max && value % self.multiple.max(1) == 0
    }
}

/// Allowed element types for one operand
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataTypeLimit {
    pub allowed: Vec<DataType>,
    pub reason: ConfigReason,
}

impl DataTypeLimit {
    pub fn new(allowed: &[DataType], reason: ConfigReason) -> Self {
        Self {
            allowed: allowed.to_vec(),
            reason,
        }
    }

    pub fn contains(&self, data_type: DataType) -> bool {
        self.allowed.contains(&data_type)
    }
}

/// Capability entry for one operand of one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorLimits {
    pub since: HwGeneration,
    pub layout: Layout,
    /// Range checks in layout order
    pub dims: Vec<(Dim, RangeLimit)>,
    pub data_types: DataTypeLimit,
}

impl TensorLimits {
    pub fn new(layout: Layout, data_types: DataTypeLimit) -> Self {
        Self {
            since: HwGeneration::V1,
            layout,
            dims: Vec::new(),
            data_types,
        }
    }

    pub fn since(mut self, generation: HwGeneration) -> Self {
        self.since = generation;
        self
    }

    pub fn with_dim(mut self, dim: Dim, limit: RangeLimit) -> Self {
        self.dims.push((dim, limit));
        self
    }

    pub fn dim_limit(&self, dim: Dim) -> Option<&RangeLimit> {
        self.dims.iter().find(|(d, _)| *d == dim).map(|(_, l)| l)
    }

    /// Same entry with a different data-type set, for later generations
    pub fn with_data_types(&self, since: HwGeneration, data_types: DataTypeLimit) -> Self {
        Self {
            since,
            data_types,
            ..self.clone()
        }
    }
}

/// All capability entries, keyed by (operation, operand role)
#[derive(Debug, Default)]
pub struct CapabilityTable {
    entries: HashMap<(OperationKind, OperandRole), Vec<TensorLimits>>,
}

static CAPABILITIES: Lazy<CapabilityTable> = Lazy::new(CapabilityTable::build);

impl CapabilityTable {
    /// Process-wide table
    pub fn global() -> &'static CapabilityTable {
        &CAPABILITIES
    }

    fn build() -> Self {
        let mut table = CapabilityTable::default();
        affine::register(&mut table);
        pooling::register(&mut table);
        tracing::debug!("Capability table built with {} operand entries", table.entries.len());
        table
    }

    pub(crate) fn insert(&mut self, kind: OperationKind, role: OperandRole, limits: TensorLimits) {
        let list = self.entries.entry((kind, role)).or_default();
        list.push(limits);
        list.sort_by_key(|l| l.since);
    }

    /// Newest entry not newer than `generation`
    pub fn lookup(
        &self,
        kind: OperationKind,
        role: OperandRole,
        generation: HwGeneration,
    ) -> Option<&TensorLimits> {
        self.entries
            .get(&(kind, role))?
            .iter()
            .rev()
            .find(|l| l.since <= generation)
    }

    /// Roles that have an entry for `kind` on `generation`, in role order
    pub fn roles(&self, kind: OperationKind, generation: HwGeneration) -> Vec<OperandRole> {
        OperandRole::ALL
            .into_iter()
            .filter(|role| self.lookup(kind, *role, generation).is_some())
            .collect()
    }

    /// Flattened view for one generation, used by the CLI dump
    pub fn snapshot(&self, generation: HwGeneration) -> Vec<CapabilityRow> {
        let mut rows = Vec::new();
        for kind in OperationKind::ALL {
            if kind.since() > generation {
                continue;
            }
            for role in self.roles(kind, generation) {
                if let Some(limits) = self.lookup(kind, role, generation) {
                    rows.push(CapabilityRow {
                        operation: kind,
                        operand: role,
                        limits: limits.clone(),
                    });
                }
            }
        }
        rows
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityRow {
    pub operation: OperationKind,
    pub operand: OperandRole,
    pub limits: TensorLimits,
}
