//! Kernel dispatch tables
//!
//! Kernels are plain function pointers grouped by family. The registry maps
//! (kernel operation, [`KernelMode`]) to a [`KernelMap`], which maps an
//! [`AccelerationMode`] to the entry point. Both lookup stages report a miss
//! as [`AccelError::NotImplemented`].

pub mod affine;
pub mod config;
pub mod cpu_features;
pub mod pooling;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::error::{AccelError, AccelResult};
use crate::tensor::DataType;

pub use crate::tensor::KernelMode;
pub use config::{AffineConfig, ExecutionContext, PoolingConfig};
pub use cpu_features::CpuFeatures;

/// Kernel-level operation, finer than the layer operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum KernelOp {
    Affine,
    AffineActiveList,
    AffineMultiBias,
    AffineDiagonal,
    Pooling,
}

impl fmt::Display for KernelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelOp::Affine => write!(f, "affine"),
            KernelOp::AffineActiveList => write!(f, "affine-active-list"),
            KernelOp::AffineMultiBias => write!(f, "affine-multibias"),
            KernelOp::AffineDiagonal => write!(f, "affine-diagonal"),
            KernelOp::Pooling => write!(f, "pooling"),
        }
    }
}

/// Compute backend selected for a kernel call, ordered slowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AccelerationMode {
    /// Scalar reference path
    Generic,
    /// 8-lane blocked path
    Sse4_2,
    /// 16-lane blocked path
    Avx2,
}

impl AccelerationMode {
    pub const ALL: [AccelerationMode; 3] = [
        AccelerationMode::Generic,
        AccelerationMode::Sse4_2,
        AccelerationMode::Avx2,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "generic" | "sw" | "scalar" => Some(AccelerationMode::Generic),
            "sse4.2" | "sse4_2" | "sse42" => Some(AccelerationMode::Sse4_2),
            "avx2" => Some(AccelerationMode::Avx2),
            _ => None,
        }
    }
}

impl fmt::Display for AccelerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccelerationMode::Generic => write!(f, "generic"),
            AccelerationMode::Sse4_2 => write!(f, "sse4.2"),
            AccelerationMode::Avx2 => write!(f, "avx2"),
        }
    }
}

pub type AffineFn = fn(&AffineConfig, &mut ExecutionContext) -> AccelResult<()>;
pub type ActiveListFn = fn(&AffineConfig, &[u32], &mut ExecutionContext) -> AccelResult<()>;
pub type PoolingFn = fn(&PoolingConfig, &mut ExecutionContext) -> AccelResult<()>;

/// Affine, multi-bias and diagonal kernel entry point
#[derive(Debug, Clone, Copy)]
pub struct AffineKernel(pub AffineFn);

/// Affine kernel restricted to an active output list
#[derive(Debug, Clone, Copy)]
pub struct ActiveListKernel(pub ActiveListFn);

#[derive(Debug, Clone, Copy)]
pub struct PoolingKernel(pub PoolingFn);

impl AffineKernel {
    pub fn invoke(&self, config: &AffineConfig, ctx: &mut ExecutionContext) -> AccelResult<()> {
        (self.0)(config, ctx)
    }
}

impl ActiveListKernel {
    pub fn invoke(
        &self,
        config: &AffineConfig,
        indices: &[u32],
        ctx: &mut ExecutionContext,
    ) -> AccelResult<()> {
        (self.0)(config, indices, ctx)
    }
}

impl PoolingKernel {
    pub fn invoke(&self, config: &PoolingConfig, ctx: &mut ExecutionContext) -> AccelResult<()> {
        (self.0)(config, ctx)
    }
}

pub type KernelTable<K> = HashMap<(KernelOp, KernelMode), KernelMap<K>>;

/// A kernel entry-point type with its own dispatch table
pub trait KernelFamily: Copy + fmt::Debug + Send + Sync + 'static {
    fn table(registry: &KernelRegistry) -> &KernelTable<Self>;
}

impl KernelFamily for AffineKernel {
    fn table(registry: &KernelRegistry) -> &KernelTable<Self> {
        &registry.affine
    }
}

impl KernelFamily for ActiveListKernel {
    fn table(registry: &KernelRegistry) -> &KernelTable<Self> {
        &registry.active_list
    }
}

impl KernelFamily for PoolingKernel {
    fn table(registry: &KernelRegistry) -> &KernelTable<Self> {
        &registry.pooling
    }
}

/// Acceleration mode to entry point, for one (op, mode) bucket
#[derive(Debug, Clone)]
pub struct KernelMap<K> {
    op: KernelOp,
    mode: KernelMode,
    entries: BTreeMap<AccelerationMode, K>,
}

impl<K: KernelFamily> KernelMap<K> {
    fn new(op: KernelOp, mode: KernelMode) -> Self {
        Self {
            op,
            mode,
            entries: BTreeMap::new(),
        }
    }

    pub fn op(&self) -> KernelOp {
        self.op
    }

    pub fn mode(&self) -> KernelMode {
        self.mode
    }

    /// Entry for `accel`, or the not-implemented condition
    pub fn get(&self, accel: AccelerationMode) -> AccelResult<K> {
        self.entries
            .get(&accel)
            .copied()
            .ok_or(AccelError::NotImplemented {
                op: self.op,
                mode: self.mode,
                accel,
            })
    }

    pub fn modes(&self) -> impl Iterator<Item = AccelerationMode> + '_ {
        self.entries.keys().copied()
    }
}

static KERNEL_REGISTRY: Lazy<KernelRegistry> =
    Lazy::new(|| KernelRegistry::for_features(CpuFeatures::get()));

/// One acceleration mode's worth of entry points
struct KernelSet {
    affine: AffineFn,
    active_list: ActiveListFn,
    multibias: AffineFn,
    diagonal: AffineFn,
    pooling: PoolingFn,
}

fn kernel_set<const LANES: usize>() -> KernelSet {
    KernelSet {
        affine: affine::affine::<LANES>,
        active_list: affine::affine_active_list::<LANES>,
        multibias: affine::affine_multibias::<LANES>,
        diagonal: affine::affine_diagonal::<LANES>,
        pooling: pooling::pooling::<LANES>,
    }
}

fn kernels_for(accel: AccelerationMode) -> KernelSet {
    match accel {
        AccelerationMode::Generic => kernel_set::<1>(),
        AccelerationMode::Sse4_2 => kernel_set::<8>(),
        AccelerationMode::Avx2 => kernel_set::<16>(),
    }
}

const INPUT_TYPES: [DataType; 2] = [DataType::Int8, DataType::Int16];
const WEIGHT_TYPES: [DataType; 2] = [DataType::Int8, DataType::Int16];

fn affine_modes(bias_types: &[DataType]) -> Vec<KernelMode> {
    let mut modes = Vec::new();
    for input in INPUT_TYPES {
        for weight in WEIGHT_TYPES {
            for bias in bias_types {
                // no 16x16-bit kernel with compound biases
                if weight == DataType::Int16 && *bias == DataType::CompoundBias && input == DataType::Int16 {
                    continue;
                }
                modes.push(KernelMode::new(input, weight, *bias));
            }
        }
    }
    modes
}

/// Process-wide, read-only kernel dispatch tables
#[derive(Debug, Default)]
pub struct KernelRegistry {
    modes: Vec<AccelerationMode>,
    affine: KernelTable<AffineKernel>,
    active_list: KernelTable<ActiveListKernel>,
    pooling: KernelTable<PoolingKernel>,
}

impl KernelRegistry {
    /// Registry for the detected processor
    pub fn global() -> &'static KernelRegistry {
        &KERNEL_REGISTRY
    }

    pub fn for_features(features: CpuFeatures) -> Self {
        tracing::debug!("Building kernel registry for {}", features);
        Self::for_modes(&features.supported_modes())
    }

    /// Registry holding exactly the given acceleration modes
    pub fn for_modes(modes: &[AccelerationMode]) -> Self {
        let mut registry = KernelRegistry::default();
        let all_biases = [
            DataType::Int8,
            DataType::Int16,
            DataType::Int32,
            DataType::CompoundBias,
        ];
        let single = affine_modes(&all_biases);
        let active = affine_modes(&[DataType::Int32, DataType::CompoundBias]);
        let grouped = affine_modes(&[DataType::Int8, DataType::Int16, DataType::Int32]);
        let pooled = [
            KernelMode::input_only(DataType::Int16),
            KernelMode::input_only(DataType::Int32),
        ];

        for &accel in modes {
            if registry.modes.contains(&accel) {
                continue;
            }
            registry.modes.push(accel);
            let set = kernels_for(accel);
            for mode in &single {
                insert(&mut registry.affine, KernelOp::Affine, *mode, accel, AffineKernel(set.affine));
                insert(
                    &mut registry.affine,
                    KernelOp::AffineDiagonal,
                    *mode,
                    accel,
                    AffineKernel(set.diagonal),
                );
            }
            for mode in &active {
                insert(
                    &mut registry.active_list,
                    KernelOp::AffineActiveList,
                    *mode,
                    accel,
                    ActiveListKernel(set.active_list),
                );
            }
            for mode in &grouped {
                insert(
                    &mut registry.affine,
                    KernelOp::AffineMultiBias,
                    *mode,
                    accel,
                    AffineKernel(set.multibias),
                );
            }
            for mode in pooled {
                insert(&mut registry.pooling, KernelOp::Pooling, mode, accel, PoolingKernel(set.pooling));
            }
        }
        registry.modes.sort();
        registry
    }

    /// Registered acceleration modes, slowest first
    pub fn modes(&self) -> &[AccelerationMode] {
        &self.modes
    }

    pub fn fastest_mode(&self) -> AccelerationMode {
        self.modes.last().copied().unwrap_or(AccelerationMode::Generic)
    }

    pub fn supports(&self, accel: AccelerationMode) -> bool {
        self.modes.contains(&accel)
    }

    /// First lookup stage: the bucket for (op, mode)
    pub fn kernel_map<K: KernelFamily>(&self, op: KernelOp, mode: KernelMode) -> AccelResult<&KernelMap<K>> {
        K::table(self).get(&(op, mode)).ok_or(AccelError::NotImplemented {
            op,
            mode,
            accel: self.fastest_mode(),
        })
    }

    /// Both lookup stages
    pub fn resolve<K: KernelFamily>(
        &self,
        op: KernelOp,
        mode: KernelMode,
        accel: AccelerationMode,
    ) -> AccelResult<K> {
        let kernel = self
            .kernel_map::<K>(op, mode)
            .map_err(|_| AccelError::NotImplemented { op, mode, accel })?
            .get(accel)?;
        tracing::trace!("Resolved {} {} on {}", op, mode, accel);
        Ok(kernel)
    }

    /// Every registered (op, mode, accel) triple, sorted
    pub fn entries(&self) -> Vec<(KernelOp, KernelMode, AccelerationMode)> {
        let mut out = Vec::new();
        collect_entries(&self.affine, &mut out);
        collect_entries(&self.active_list, &mut out);
        collect_entries(&self.pooling, &mut out);
        out.sort();
        out
    }
}

fn insert<K: KernelFamily>(
    table: &mut KernelTable<K>,
    op: KernelOp,
    mode: KernelMode,
    accel: AccelerationMode,
    kernel: K,
) {
    table
        .entry((op, mode))
        .or_insert_with(|| KernelMap::new(op, mode))
        .entries
        .insert(accel, kernel);
}

fn collect_entries<K: KernelFamily>(
    table: &KernelTable<K>,
    out: &mut Vec<(KernelOp, KernelMode, AccelerationMode)>,
) {
    for map in table.values() {
        for accel in map.modes() {
            out.push((map.op, map.mode, accel));
        }
    }
}
