//! Reference pooling kernels
//!
//! Input and output use the `WD` layout: `data[w * filters + d]`. Windows at
//! the right edge are truncated to the remaining positions.

use crate::capability::pooling::PoolingMode;
use crate::error::AccelResult;
use crate::internal_error;

use super::config::{read_element, write_i32, ExecutionContext, PoolingConfig};

pub fn pooling<const LANES: usize>(config: &PoolingConfig, ctx: &mut ExecutionContext) -> AccelResult<()> {
    let filters = config.filters as usize;
    let positions = config.positions as usize;
    let window = config.window as usize;
    let stride = config.stride as usize;
    if config.mode == PoolingMode::Disabled {
        return Err(internal_error!("pooling kernel invoked with pooling disabled"));
    }
    let input = config.input.read()?;
    let mut output = config.output.try_write()?;
    ctx.record_invocation();

    for out_pos in 0..config.output_positions as usize {
        let start = out_pos * stride;
        let end = (start + window).min(positions);
        for block in (0..filters).step_by(LANES) {
            let width = LANES.min(filters - block);
            let mut acc = [0i64; LANES];
            for (lane, slot) in acc.iter_mut().enumerate().take(width) {
                let d = block + lane;
                *slot = read_element(&input, config.input_type, start * filters + d);
                for pos in start + 1..end {
                    let x = read_element(&input, config.input_type, pos * filters + d);
                    match config.mode {
                        PoolingMode::Max => *slot = (*slot).max(x),
                        _ => *slot += x,
                    }
                }
            }
            for (lane, value) in acc.iter().enumerate().take(width) {
                let d = block + lane;
                write_i32(&mut output, out_pos * filters + d, ctx.saturate(*value));
            }
        }
    }
    Ok(())
}
