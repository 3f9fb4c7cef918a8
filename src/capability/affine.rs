//! Affine-family operand limits

use crate::error::ConfigReason;
use crate::tensor::{DataType, Dim, Layout, OperandRole};

use super::{CapabilityTable, DataTypeLimit, HwGeneration, OperationKind, RangeLimit, TensorLimits};

/// Input elements per vector: 8..=65528, multiple of 8
pub const INPUT_ELEMENTS: RangeLimit = RangeLimit::new(8, 65528, 8, ConfigReason::InputVolume);
/// Interleaved input vectors per request
pub const VECTOR_COUNT: RangeLimit = RangeLimit::range(1, 8, ConfigReason::Grouping);
pub const OUTPUT_ROWS: RangeLimit = RangeLimit::range(1, 65535, ConfigReason::OutputVolume);
pub const WEIGHT_ROWS: RangeLimit = RangeLimit::range(1, 65535, ConfigReason::WeightVolume);
pub const WEIGHT_COLUMNS: RangeLimit = RangeLimit::new(8, 65528, 8, ConfigReason::WeightVolume);
pub const DIAGONAL_ELEMENTS: RangeLimit = RangeLimit::new(8, 65528, 8, ConfigReason::WeightVolume);
pub const BIAS_ROWS: RangeLimit = RangeLimit::range(1, 65535, ConfigReason::BiasVolume);
pub const BIAS_VECTORS: RangeLimit = RangeLimit::range(1, 65535, ConfigReason::BiasVolume);
pub const SCALE_ROWS: RangeLimit = RangeLimit::range(1, 65535, ConfigReason::WeightVolume);

/// Bias types the active-list kernels accept
pub const ACTIVE_LIST_BIAS_TYPES: [DataType; 2] = [DataType::Int32, DataType::CompoundBias];

const AFFINE_KINDS: [OperationKind; 3] = [
    OperationKind::Affine,
    OperationKind::AffineDiagonal,
    OperationKind::AffineMultiBias,
];

fn input_limits() -> TensorLimits {
    TensorLimits::new(
        Layout::hw(),
        DataTypeLimit::new(&[DataType::Int16], ConfigReason::InputBytes),
    )
    .with_dim(Dim::H, INPUT_ELEMENTS)
    .with_dim(Dim::W, VECTOR_COUNT)
}

fn output_limits() -> TensorLimits {
    TensorLimits::new(
        Layout::hw(),
        DataTypeLimit::new(&[DataType::Int32], ConfigReason::OutputBytes),
    )
    .with_dim(Dim::H, OUTPUT_ROWS)
    .with_dim(Dim::W, VECTOR_COUNT)
}

fn weight_types() -> DataTypeLimit {
    DataTypeLimit::new(&[DataType::Int8, DataType::Int16], ConfigReason::WeightBytes)
}

pub(super) fn register(table: &mut CapabilityTable) {
    for kind in AFFINE_KINDS {
        let input = input_limits().since(kind.since());
        let wide_input = input.with_data_types(
            HwGeneration::V3,
            DataTypeLimit::new(&[DataType::Int8, DataType::Int16], ConfigReason::InputBytes),
        );
        table.insert(kind, OperandRole::Input, input);
        table.insert(kind, OperandRole::Input, wide_input);
        table.insert(kind, OperandRole::Output, output_limits().since(kind.since()));
    }

    // Full and diagonal weights
    for kind in [OperationKind::Affine, OperationKind::AffineMultiBias] {
        table.insert(
            kind,
            OperandRole::Weights,
            TensorLimits::new(Layout::hw(), weight_types())
                .since(kind.since())
                .with_dim(Dim::H, WEIGHT_ROWS)
                .with_dim(Dim::W, WEIGHT_COLUMNS),
        );
    }
    table.insert(
        OperationKind::AffineDiagonal,
        OperandRole::Weights,
        TensorLimits::new(Layout::h(), weight_types()).with_dim(Dim::H, DIAGONAL_ELEMENTS),
    );

    // Single biases: 8/16-bit biases only from V3
    for kind in [OperationKind::Affine, OperationKind::AffineDiagonal] {
        let biases = TensorLimits::new(
            Layout::h(),
            DataTypeLimit::new(
                &[DataType::Int32, DataType::CompoundBias],
                ConfigReason::BiasBytes,
            ),
        )
        .with_dim(Dim::H, BIAS_ROWS);
        let wide = biases.with_data_types(
            HwGeneration::V3,
            DataTypeLimit::new(
                &[
                    DataType::Int8,
                    DataType::Int16,
                    DataType::Int32,
                    DataType::CompoundBias,
                ],
                ConfigReason::BiasBytes,
            ),
        );
        table.insert(kind, OperandRole::Biases, biases);
        table.insert(kind, OperandRole::Biases, wide);
    }

    // Grouped biases: H = rows, W = bias vectors
    let grouped = TensorLimits::new(
        Layout::hw(),
        DataTypeLimit::new(&[DataType::Int32], ConfigReason::BiasBytes),
    )
    .since(HwGeneration::V2)
    .with_dim(Dim::H, BIAS_ROWS)
    .with_dim(Dim::W, BIAS_VECTORS);
    let grouped_wide = grouped.with_data_types(
        HwGeneration::V3,
        DataTypeLimit::new(
            &[DataType::Int8, DataType::Int16, DataType::Int32],
            ConfigReason::BiasBytes,
        ),
    );
    table.insert(OperationKind::AffineMultiBias, OperandRole::Biases, grouped);
    table.insert(OperationKind::AffineMultiBias, OperandRole::Biases, grouped_wide);

    table.insert(
        OperationKind::AffineMultiBias,
        OperandRole::WeightScales,
        TensorLimits::new(
            Layout::h(),
            DataTypeLimit::new(&[DataType::CompoundBias], ConfigReason::BiasBytes),
        )
        .since(HwGeneration::V2)
        .with_dim(Dim::H, SCALE_ROWS),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagonal_weights_are_one_dimensional() {
        let limits = CapabilityTable::global()
            .lookup(OperationKind::AffineDiagonal, OperandRole::Weights, HwGeneration::V3)
            .unwrap();
        assert_eq!(limits.layout, Layout::h());
    }

    #[test]
    fn test_bias_types_widen_on_v3() {
        let table = CapabilityTable::global();
        let v2 = table
            .lookup(OperationKind::Affine, OperandRole::Biases, HwGeneration::V2)
            .unwrap();
        let v3 = table
            .lookup(OperationKind::Affine, OperandRole::Biases, HwGeneration::V3)
            .unwrap();
        assert!(!v2.data_types.contains(DataType::Int16));
        assert!(v3.data_types.contains(DataType::Int16));
        assert_eq!(v3.dim_limit(Dim::H), Some(&BIAS_ROWS));
    }

    #[test]
    fn test_single_affine_has_no_weight_scales() {
        assert!(CapabilityTable::global()
            .lookup(OperationKind::Affine, OperandRole::WeightScales, HwGeneration::V3)
            .is_none());
    }
}
