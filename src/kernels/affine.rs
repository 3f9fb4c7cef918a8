//! Reference affine kernels
//!
//! Input vectors are interleaved (`input[e * vectors + v]`), weights are
//! row-major, output is `output[r * vectors + v]`. Products accumulate in
//! `i64` and are saturated to `i32` on store. `LANES` is the accumulator block
//! width; 1 is the scalar path.

use crate::error::AccelResult;
use crate::tensor::DataType;

use super::config::{decode, read_element, read_multiplier, write_i32, AffineConfig, ExecutionContext};

#[inline]
fn dot<const LANES: usize>(a: &[i64], b: &[i64]) -> i64 {
    let mut acc = [0i64; LANES];
    let mut chunks_a = a.chunks_exact(LANES);
    let mut chunks_b = b.chunks_exact(LANES);
    for (ca, cb) in (&mut chunks_a).zip(&mut chunks_b) {
        for lane in 0..LANES {
            acc[lane] += ca[lane] * cb[lane];
        }
    }
    let mut sum: i64 = acc.iter().sum();
    for (x, y) in chunks_a.remainder().iter().zip(chunks_b.remainder()) {
        sum += x * y;
    }
    sum
}

/// Split interleaved input into one contiguous vector per column
fn deinterleave(bytes: &[u8], data_type: DataType, elements: usize, vectors: usize) -> Vec<Vec<i64>> {
    (0..vectors)
        .map(|v| {
            (0..elements)
                .map(|e| read_element(bytes, data_type, e * vectors + v))
                .collect()
        })
        .collect()
}

/// `(bias, multiplier)` for row `row` of a single-bias tensor
#[inline]
fn bias_at(bytes: &[u8], data_type: DataType, row: usize) -> (i64, i64) {
    match data_type {
        DataType::CompoundBias => (read_element(bytes, data_type, row), read_multiplier(bytes, row)),
        _ => (read_element(bytes, data_type, row), 1),
    }
}

pub fn affine<const LANES: usize>(config: &AffineConfig, ctx: &mut ExecutionContext) -> AccelResult<()> {
    let elements = config.elements as usize;
    let vectors = config.vectors as usize;
    let input = config.input.read()?;
    let weights = config.weights.read()?;
    let biases = config.biases.read()?;
    let mut output = config.output.try_write()?;
    ctx.record_invocation();

    let columns = deinterleave(&input, config.input_type, elements, vectors);
    for row in 0..config.rows as usize {
        let weight_row = decode(&weights, config.weight_type, row * elements, elements);
        let (bias, multiplier) = bias_at(&biases, config.bias_type, row);
        for (v, column) in columns.iter().enumerate() {
            let value = dot::<LANES>(&weight_row, column) * multiplier + bias;
            write_i32(&mut output, row * vectors + v, ctx.saturate(value));
        }
    }
    Ok(())
}

/// Compute only the listed rows, compacted into the first `indices.len()` output rows
pub fn affine_active_list<const LANES: usize>(
    config: &AffineConfig,
    indices: &[u32],
    ctx: &mut ExecutionContext,
) -> AccelResult<()> {
    let elements = config.elements as usize;
    let vectors = config.vectors as usize;
    let input = config.input.read()?;
    let weights = config.weights.read()?;
    let biases = config.biases.read()?;
    let mut output = config.output.try_write()?;
    ctx.record_invocation();

    let columns = deinterleave(&input, config.input_type, elements, vectors);
    for (slot, &row) in indices.iter().enumerate() {
        let row = row as usize;
        let weight_row = decode(&weights, config.weight_type, row * elements, elements);
        let (bias, multiplier) = bias_at(&biases, config.bias_type, row);
        for (v, column) in columns.iter().enumerate() {
            let value = dot::<LANES>(&weight_row, column) * multiplier + bias;
            write_i32(&mut output, slot * vectors + v, ctx.saturate(value));
        }
    }
    Ok(())
}

/// Grouped biases: row `r` uses `biases[r * bias_vector_count + bias_vector_index]`,
/// scaled by the weight-scale multiplier when scales are present
pub fn affine_multibias<const LANES: usize>(
    config: &AffineConfig,
    ctx: &mut ExecutionContext,
) -> AccelResult<()> {
    let elements = config.elements as usize;
    let vectors = config.vectors as usize;
    let count = config.bias_vector_count as usize;
    let index = config.bias_vector_index as usize;
    let input = config.input.read()?;
    let weights = config.weights.read()?;
    let biases = config.biases.read()?;
    let scales = match &config.weight_scales {
        Some(buffer) => Some(buffer.read()?),
        None => None,
    };
    let mut output = config.output.try_write()?;
    ctx.record_invocation();

    let columns = deinterleave(&input, config.input_type, elements, vectors);
    for row in 0..config.rows as usize {
        let weight_row = decode(&weights, config.weight_type, row * elements, elements);
        let bias = read_element(&biases, config.bias_type, row * count + index);
        let multiplier = scales.as_ref().map_or(1, |s| read_multiplier(s, row));
        for (v, column) in columns.iter().enumerate() {
            let value = dot::<LANES>(&weight_row, column) * multiplier + bias;
            write_i32(&mut output, row * vectors + v, ctx.saturate(value));
        }
    }
    Ok(())
}

/// Diagonal weights: `out[r][v] = w[r] * in[r][v] + bias[r]`
pub fn affine_diagonal<const LANES: usize>(
    config: &AffineConfig,
    ctx: &mut ExecutionContext,
) -> AccelResult<()> {
    let rows = config.rows as usize;
    let vectors = config.vectors as usize;
    let input = config.input.read()?;
    let weights = config.weights.read()?;
    let biases = config.biases.read()?;
    let mut output = config.output.try_write()?;
    ctx.record_invocation();

    let diagonal = decode(&weights, config.weight_type, 0, rows);
    for block in (0..rows).step_by(LANES) {
        let end = (block + LANES).min(rows);
        for row in block..end {
            let (bias, multiplier) = bias_at(&biases, config.bias_type, row);
            for v in 0..vectors {
                let x = read_element(&input, config.input_type, row * vectors + v);
                let value = diagonal[row] * x * multiplier + bias;
                write_i32(&mut output, row * vectors + v, ctx.saturate(value));
            }
        }
    }
    Ok(())
}
